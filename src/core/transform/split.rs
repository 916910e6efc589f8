use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::{create_output_root, operation_rng, OutputDataset, TransformContext, TransformSummary};
use crate::core::dataset::{
    create_directory_structure, normalize_splits, write_dataset_config, ClassRegistry, Dataset,
    DatasetSplit,
};
use crate::core::progress::scaled_percent;
use crate::error::{DatasetError, Result};

/// Stems to copy, grouped by the split they come from and go to.
pub type SplitPlan = BTreeMap<DatasetSplit, Vec<String>>;

fn collect_stems(dataset: &Dataset, splits: &[DatasetSplit]) -> SplitPlan {
    splits
        .iter()
        .map(|split| (*split, dataset.stems(*split)))
        .collect()
}

/// Shuffles each split and deals it into `parts` contiguous chunks of
/// `ceil(len / parts)`. Chunk `i` of every split lands in plan `i`, so later
/// plans may come out smaller or empty.
pub fn plan_parts<R: Rng + ?Sized>(stems: &SplitPlan, parts: usize, rng: &mut R) -> Vec<SplitPlan> {
    let mut plans = vec![SplitPlan::new(); parts];
    if parts == 0 {
        return plans;
    }
    for (split, split_stems) in stems {
        if split_stems.is_empty() {
            continue;
        }
        let mut shuffled = split_stems.clone();
        shuffled.shuffle(rng);
        let chunk_size = shuffled.len().div_ceil(parts);
        for (i, chunk) in shuffled.chunks(chunk_size).enumerate() {
            plans[i].insert(*split, chunk.to_vec());
        }
    }
    plans
}

/// Pools every stem with its split, shuffles once and cuts chunks of `count`.
pub fn plan_count_chunks<R: Rng + ?Sized>(stems: &SplitPlan, count: usize, rng: &mut R) -> Vec<SplitPlan> {
    if count == 0 {
        return Vec::new();
    }
    let mut pooled: Vec<(DatasetSplit, String)> = stems
        .iter()
        .flat_map(|(split, s)| s.iter().map(move |stem| (*split, stem.clone())))
        .collect();
    pooled.shuffle(rng);

    pooled
        .chunks(count)
        .map(|chunk| {
            let mut plan = SplitPlan::new();
            for (split, stem) in chunk {
                plan.entry(*split).or_default().push(stem.clone());
            }
            plan
        })
        .collect()
}

fn plan_subset<R: Rng + ?Sized>(stems: &SplitPlan, count: usize, rng: &mut R) -> SplitPlan {
    stems
        .iter()
        .map(|(split, split_stems)| {
            let mut shuffled = split_stems.clone();
            shuffled.shuffle(rng);
            shuffled.truncate(count);
            (*split, shuffled)
        })
        .collect()
}

/// Writes one planned dataset under `dest_root`.
#[allow(clippy::too_many_arguments)]
fn write_planned(
    ctx: &TransformContext<'_>,
    src_root: &Path,
    dest_root: &Path,
    plan: &SplitPlan,
    splits: &[DatasetSplit],
    classes: &ClassRegistry,
    band: (u8, u8),
    summary: &mut TransformSummary,
) -> Result<OutputDataset> {
    create_directory_structure(dest_root, splits)?;
    let mut output = OutputDataset::new(dest_root);

    let total: usize = plan.values().map(Vec::len).sum();
    let mut done = 0;
    for (split, stems) in plan {
        let sub_band = (
            scaled_percent(done, total, band.0, band.1),
            scaled_percent(done + stems.len(), total, band.0, band.1),
        );
        let copied = ctx.copy_split(src_root, dest_root, *split, stems, sub_band, summary)?;
        output.add_images(*split, copied);
        done += stems.len();
    }

    write_dataset_config(dest_root, classes, splits)?;
    Ok(output)
}

fn write_plans(
    ctx: &TransformContext<'_>,
    dataset: &Dataset,
    output_root: &Path,
    plans: &[SplitPlan],
    splits: &[DatasetSplit],
) -> Result<TransformSummary> {
    create_output_root(output_root)?;
    let classes = dataset.class_registry();
    let mut summary = TransformSummary::default();

    for (i, plan) in plans.iter().enumerate() {
        ctx.cancel.check()?;
        let part_root = output_root.join(format!("part_{}", i + 1));
        let band = (
            scaled_percent(i, plans.len(), 5, 95),
            scaled_percent(i + 1, plans.len(), 5, 95),
        );
        ctx.progress
            .report(band.0, &format!("Creating part {}/{}...", i + 1, plans.len()));
        let output = write_planned(ctx, dataset.root(), &part_root, plan, splits, &classes, band, &mut summary)?;
        info!("Part {}: {} images", i + 1, output.total_images());
        summary.outputs.push(output);
    }
    Ok(summary)
}

/// Splits a dataset into `parts` datasets named `part_1` .. `part_n`.
///
/// # Arguments
/// * `parts` - Number of output datasets, at least 1
/// * `splits` - Splits to include, empty for all
/// * `seed` - Shuffle seed; `None` draws one from entropy
///
/// # Returns
/// * `Ok(TransformSummary)` with one output per part, empty parts included
/// * `Err(DatasetError::InvalidArgument)` if `parts` is 0
pub fn split_into_parts(
    ctx: &TransformContext<'_>,
    dataset_root: &Path,
    output_root: &Path,
    parts: usize,
    splits: &[DatasetSplit],
    seed: Option<u64>,
) -> Result<TransformSummary> {
    if parts == 0 {
        return Err(DatasetError::InvalidArgument(
            "number of parts must be at least 1".to_string(),
        ));
    }
    let dataset = Dataset::open(dataset_root)?;
    let splits = normalize_splits(splits);
    let mut rng = operation_rng(seed);

    ctx.progress.report(0, "Collecting images...");
    let stems = collect_stems(&dataset, &splits);
    let plans = plan_parts(&stems, parts, &mut rng);

    let summary = write_plans(ctx, &dataset, output_root, &plans, &splits)?;
    summary.log("Split into parts");
    ctx.progress.report(100, "Split complete");
    Ok(summary)
}

/// Splits a dataset into datasets of `count` images each, pooled across
/// splits. Images keep their original split.
pub fn split_by_count(
    ctx: &TransformContext<'_>,
    dataset_root: &Path,
    output_root: &Path,
    count: usize,
    splits: &[DatasetSplit],
    seed: Option<u64>,
) -> Result<TransformSummary> {
    if count == 0 {
        return Err(DatasetError::InvalidArgument(
            "images per part must be at least 1".to_string(),
        ));
    }
    let dataset = Dataset::open(dataset_root)?;
    let splits = normalize_splits(splits);
    let mut rng = operation_rng(seed);

    ctx.progress.report(0, "Collecting images...");
    let stems = collect_stems(&dataset, &splits);
    let plans = plan_count_chunks(&stems, count, &mut rng);
    info!(
        "Splitting {} images into {} parts of up to {}",
        stems.values().map(Vec::len).sum::<usize>(),
        plans.len(),
        count
    );

    let summary = write_plans(ctx, &dataset, output_root, &plans, &splits)?;
    summary.log("Split by count");
    ctx.progress.report(100, "Split complete");
    Ok(summary)
}

/// Takes up to `count` random images from each split into `output_root/subset`.
pub fn extract_subset(
    ctx: &TransformContext<'_>,
    dataset_root: &Path,
    output_root: &Path,
    count: usize,
    splits: &[DatasetSplit],
    seed: Option<u64>,
) -> Result<TransformSummary> {
    let dataset = Dataset::open(dataset_root)?;
    let splits = normalize_splits(splits);
    let mut rng = operation_rng(seed);

    ctx.progress.report(0, "Collecting images...");
    let plan = plan_subset(&collect_stems(&dataset, &splits), count, &mut rng);

    create_output_root(output_root)?;
    let mut summary = TransformSummary::default();
    let classes = dataset.class_registry();
    let output = write_planned(
        ctx,
        dataset.root(),
        &output_root.join("subset"),
        &plan,
        &splits,
        &classes,
        (5, 95),
        &mut summary,
    )?;
    summary.outputs.push(output);

    summary.log("Extract subset");
    ctx.progress.report(100, "Subset complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::list_stems;
    use crate::core::transform::test_support::{add_image, count_images, write_names};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn dataset(root: &Path, train: usize, val: usize) {
        write_names(root, &[(0, "person")]);
        for i in 0..train {
            add_image(root, "train", &format!("t{:02}", i), Some(&[0]));
        }
        for i in 0..val {
            add_image(root, "val", &format!("v{:02}", i), Some(&[0]));
        }
    }

    #[test]
    fn test_plan_parts_uses_ceil_chunks() {
        let stems: SplitPlan = [(
            DatasetSplit::Train,
            (0..10).map(|i| i.to_string()).collect::<Vec<_>>(),
        )]
        .into();
        let plans = plan_parts(&stems, 4, &mut operation_rng(Some(1)));
        let sizes: Vec<usize> = plans
            .iter()
            .map(|p| p.get(&DatasetSplit::Train).map_or(0, Vec::len))
            .collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_split_into_parts_conserves_and_is_disjoint() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        dataset(&src, 10, 4);
        let out = dir.path().join("out");

        let summary = split_into_parts(
            &TransformContext::default(),
            &src,
            &out,
            3,
            &[DatasetSplit::Train, DatasetSplit::Val],
            Some(42),
        )
        .unwrap();

        assert_eq!(summary.outputs.len(), 3);
        assert_eq!(summary.total_output_images(), 14);
        assert_eq!(summary.images_copied, 14);

        let mut seen = HashSet::new();
        let mut total = 0;
        for i in 1..=3 {
            let part = out.join(format!("part_{}", i));
            assert!(part.join("dataset.yaml").exists());
            for split in [DatasetSplit::Train, DatasetSplit::Val] {
                for stem in list_stems(&part, split) {
                    assert!(seen.insert(stem));
                    total += 1;
                }
            }
        }
        assert_eq!(total, 14);
    }

    #[test]
    fn test_split_by_count_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        dataset(&src, 7, 5);

        let listing = |out: &Path| -> Vec<Vec<(DatasetSplit, Vec<String>)>> {
            (1..=3)
                .map(|i| {
                    let part = out.join(format!("part_{}", i));
                    DatasetSplit::ALL
                        .into_iter()
                        .map(|s| (s, list_stems(&part, s)))
                        .collect()
                })
                .collect()
        };

        let ctx = TransformContext::default();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let first = split_by_count(&ctx, &src, &a, 5, &[], Some(9)).unwrap();
        split_by_count(&ctx, &src, &b, 5, &[], Some(9)).unwrap();

        assert_eq!(first.outputs.len(), 3);
        assert_eq!(first.total_output_images(), 12);
        assert_eq!(listing(&a), listing(&b));
        assert!(!a.join("part_4").exists());
    }

    #[test]
    fn test_split_by_count_keeps_original_split() {
        let stems: SplitPlan = [
            (DatasetSplit::Train, vec!["t0".to_string(), "t1".to_string()]),
            (DatasetSplit::Val, vec!["v0".to_string()]),
        ]
        .into();
        let plans = plan_count_chunks(&stems, 2, &mut operation_rng(Some(3)));
        assert_eq!(plans.len(), 2);
        for plan in &plans {
            for (split, stems) in plan {
                let prefix = if *split == DatasetSplit::Train { 't' } else { 'v' };
                assert!(stems.iter().all(|s| s.starts_with(prefix)));
            }
        }
    }

    #[test]
    fn test_extract_subset_caps_per_split() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        dataset(&src, 6, 2);
        let out = dir.path().join("out");

        let summary = extract_subset(&TransformContext::default(), &src, &out, 3, &[], None).unwrap();
        let subset = out.join("subset");
        assert_eq!(count_images(&subset, "train"), 3);
        assert_eq!(count_images(&subset, "val"), 2);
        assert_eq!(summary.total_output_images(), 5);
    }

    #[test]
    fn test_zero_parts_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = split_into_parts(&TransformContext::default(), dir.path(), &dir.path().join("o"), 0, &[], None)
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidArgument(_)));
    }
}
