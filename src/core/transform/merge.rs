use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{
    audit_class_ids, create_output_root, occupied_stems, require_dir, OutputDataset,
    TransformContext, TransformSummary,
};
use crate::core::dataset::{
    create_directory_structure, images_dir, labels_dir, list_stems, load_class_registry,
    normalize_splits, resolve_image_path, resolve_label_path, write_dataset_config, ClassRegistry,
    DatasetSplit,
};
use crate::core::operations::{copy_file_atomic, dotted_extension, unique_stem};
use crate::core::progress::scaled_percent;
use crate::error::{DatasetError, Result};

/// Unions registries by id. The first name seen for an id wins; a different
/// name for the same id is logged.
pub fn merge_registries(registries: &[ClassRegistry]) -> ClassRegistry {
    let mut merged = ClassRegistry::new();
    for registry in registries {
        for (id, name) in registry {
            match merged.get(id) {
                None => {
                    merged.insert(*id, name.clone());
                }
                Some(existing) if existing != name => {
                    warn!(
                        "Class ID {} has different names: '{}' vs '{}'",
                        id, existing, name
                    );
                }
                Some(_) => {}
            }
        }
    }
    merged
}

/// Copies a renamed pair outside the bulk copier. Returns (image, label) copied.
pub(crate) fn copy_renamed(
    src_root: &Path,
    dest_root: &Path,
    split: DatasetSplit,
    stem: &str,
    new_stem: &str,
) -> (bool, bool) {
    let Some(src_image) = resolve_image_path(src_root, split, stem) else {
        warn!("No image found for '{}' in {} split of {:?}", stem, split, src_root);
        return (false, false);
    };
    let dest_image = images_dir(dest_root, split).join(format!("{}{}", new_stem, dotted_extension(&src_image)));
    if let Err(e) = copy_file_atomic(&src_image, &dest_image) {
        warn!("{}", e);
        return (false, false);
    }

    let src_label = resolve_label_path(src_root, split, stem);
    if !src_label.is_file() {
        return (true, false);
    }
    let dest_label = labels_dir(dest_root, split).join(format!("{}.txt", new_stem));
    match copy_file_atomic(&src_label, &dest_label) {
        Ok(()) => (true, true),
        Err(e) => {
            warn!("{}", e);
            (true, false)
        }
    }
}

/// Merges `sources` into one dataset at `output_root`.
///
/// Stems that collide with one already in the output split get `_1`, `_2`, ...
/// appended to both image and label. A label already in the output with no
/// image still reserves its stem.
///
/// # Arguments
/// * `sources` - Dataset roots, merged in order; the first name for a class id wins
/// * `output_root` - Output dataset root, created if missing
/// * `splits` - Splits to merge, empty for all
///
/// # Returns
/// * `Ok(TransformSummary)` with one output dataset
/// * `Err(DatasetError::MissingInput)` if a source does not exist, before anything is written
pub fn merge_datasets(
    ctx: &TransformContext<'_>,
    sources: &[PathBuf],
    output_root: &Path,
    splits: &[DatasetSplit],
) -> Result<TransformSummary> {
    if sources.is_empty() {
        return Err(DatasetError::InvalidArgument(
            "at least one dataset is required to merge".to_string(),
        ));
    }
    for source in sources {
        require_dir(source)?;
    }
    let splits = normalize_splits(splits);

    ctx.progress.report(0, "Preparing output directory...");
    create_output_root(output_root)?;
    create_directory_structure(output_root, &splits)?;
    info!("Created output directory structure at: {:?}", output_root);

    let registries: Vec<ClassRegistry> = sources.iter().map(|s| load_class_registry(s)).collect();
    let classes = merge_registries(&registries);
    info!("Merged class registry has {} classes", classes.len());

    let mut summary = TransformSummary::default();
    let mut output = OutputDataset::new(output_root);
    let units = sources.len() * splits.len();
    let mut unit = 0;

    for split in &splits {
        let mut taken: HashSet<String> = occupied_stems(output_root, *split);

        for source in sources {
            let band = (
                scaled_percent(unit, units, 5, 95),
                scaled_percent(unit + 1, units, 5, 95),
            );
            unit += 1;

            if !images_dir(source, *split).is_dir() {
                info!("Skipping {} split of {:?} (not found)", split, source);
                continue;
            }
            let stems = list_stems(source, *split);
            ctx.progress.report(
                band.0,
                &format!("Copying {} images from {} split of {:?}...", stems.len(), split, source),
            );

            let mut direct = Vec::with_capacity(stems.len());
            let mut renamed = Vec::new();
            for stem in stems {
                if taken.insert(stem.clone()) {
                    direct.push(stem);
                } else {
                    let new_stem = unique_stem(&stem, &taken);
                    taken.insert(new_stem.clone());
                    renamed.push((stem, new_stem));
                }
            }

            let mut copied = ctx.copy_split(source, output_root, *split, &direct, band, &mut summary)?;

            if !renamed.is_empty() {
                info!("Renaming {} colliding stems from {:?}", renamed.len(), source);
            }
            let mut copied_stems = direct;
            for (stem, new_stem) in &renamed {
                ctx.cancel.check()?;
                match copy_renamed(source, output_root, *split, stem, new_stem) {
                    (true, label) => {
                        copied += 1;
                        summary.images_copied += 1;
                        if label {
                            summary.labels_copied += 1;
                        }
                        copied_stems.push(new_stem.clone());
                    }
                    (false, _) => summary.skipped += 1,
                }
            }

            audit_class_ids(output_root, *split, &copied_stems, &classes);
            output.add_images(*split, copied);
        }
    }

    ctx.progress.report(95, "Writing dataset.yaml...");
    write_dataset_config(output_root, &classes, &splits)?;

    summary.outputs.push(output);
    summary.log("Merge");
    ctx.progress.report(100, "Merge complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::parse_class_names;
    use crate::core::transform::test_support::{add_image, count_images, write_names};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_merge_registries_first_name_wins() {
        let a: ClassRegistry = [(0, "person".to_string())].into();
        let b: ClassRegistry = [(0, "human".to_string()), (1, "car".to_string())].into();
        let merged = merge_registries(&[a, b]);
        assert_eq!(merged[&0], "person");
        assert_eq!(merged[&1], "car");
    }

    #[test]
    fn test_merge_disjoint_datasets_conserves_images() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        for i in 0..3 {
            add_image(&a, "train", &format!("a{}", i), Some(&[0]));
        }
        for i in 0..4 {
            add_image(&b, "train", &format!("b{}", i), Some(&[1]));
        }
        write_names(&a, &[(0, "person")]);
        write_names(&b, &[(1, "car")]);

        let out = dir.path().join("merged");
        let summary = merge_datasets(
            &TransformContext::default(),
            &[a, b],
            &out,
            &[DatasetSplit::Train],
        )
        .unwrap();

        assert_eq!(count_images(&out, "train"), 7);
        assert_eq!(summary.images_copied, 7);
        assert_eq!(summary.labels_copied, 7);
        assert_eq!(summary.total_output_images(), 7);

        let yaml = fs::read_to_string(out.join("dataset.yaml")).unwrap();
        let names = parse_class_names(&yaml).unwrap();
        assert_eq!(names.len(), 2);
        assert!(yaml.contains("train: images/train"));
        assert!(!yaml.contains("val:"));
    }

    #[test]
    fn test_merge_renames_collisions() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        add_image(&a, "train", "img", Some(&[0]));
        add_image(&b, "train", "img", Some(&[1]));
        add_image(&b, "train", "img_1", None);

        let out = dir.path().join("merged");
        let summary = merge_datasets(
            &TransformContext::default(),
            &[a, b],
            &out,
            &[DatasetSplit::Train],
        )
        .unwrap();

        assert_eq!(summary.images_copied, 3);
        let train = out.join("images/train");
        assert!(train.join("img.png").exists());
        assert!(train.join("img_1.png").exists());
        assert!(train.join("img_1_1.png").exists());
        assert_eq!(fs::read_to_string(out.join("labels/train/img.txt")).unwrap().chars().next(), Some('0'));
        assert_eq!(fs::read_to_string(out.join("labels/train/img_1.txt")).unwrap().chars().next(), Some('1'));
        assert!(!out.join("labels/train/img_1_1.txt").exists());
    }

    #[test]
    fn test_merge_into_existing_output_keeps_unmatched_labels() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        add_image(&a, "train", "img", Some(&[0]));

        let out = dir.path().join("merged");
        fs::create_dir_all(out.join("labels/train")).unwrap();
        fs::write(out.join("labels/train/img.txt"), "9 0.5 0.5 0.1 0.1\n").unwrap();

        let summary = merge_datasets(&TransformContext::default(), &[a], &out, &[DatasetSplit::Train]).unwrap();

        assert_eq!(summary.images_copied, 1);
        assert_eq!(
            fs::read_to_string(out.join("labels/train/img.txt")).unwrap(),
            "9 0.5 0.5 0.1 0.1\n"
        );
        assert!(out.join("images/train/img_1.png").exists());
        assert_eq!(fs::read_to_string(out.join("labels/train/img_1.txt")).unwrap().chars().next(), Some('0'));
    }

    #[test]
    fn test_merge_rejects_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = merge_datasets(
            &TransformContext::default(),
            &[dir.path().join("nope")],
            &dir.path().join("out"),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, DatasetError::MissingInput(_)));
        assert!(!dir.path().join("out").exists());
    }
}
