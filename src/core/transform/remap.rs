use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use super::{create_output_root, OutputDataset, TransformContext, TransformSummary};
use crate::core::dataset::{
    create_directory_structure, list_label_stems, normalize_splits, read_label_file,
    resolve_label_path, write_dataset_config, write_label_file, ClassRegistry, Dataset,
    DatasetSplit,
};
use crate::core::pool::build_pool;
use crate::core::progress::scaled_percent;
use crate::error::{DatasetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRule {
    pub old_class_id: u32,
    pub new_class_id: u32,
}

impl RemapRule {
    pub fn new(old_class_id: u32, new_class_id: u32) -> Self {
        Self {
            old_class_id,
            new_class_id,
        }
    }
}

fn rule_map(rules: &[RemapRule]) -> Result<HashMap<u32, u32>> {
    let mut map = HashMap::new();
    for rule in rules {
        if let Some(previous) = map.insert(rule.old_class_id, rule.new_class_id) {
            if previous != rule.new_class_id {
                return Err(DatasetError::InvalidArgument(format!(
                    "class {} is mapped to both {} and {}",
                    rule.old_class_id, previous, rule.new_class_id
                )));
            }
        }
    }
    Ok(map)
}

/// Re-keys a registry. When two classes land on one id the first name (by
/// old id) is kept and the other logged.
fn remap_registry(classes: &ClassRegistry, map: &HashMap<u32, u32>) -> ClassRegistry {
    let mut remapped = ClassRegistry::new();
    for (id, name) in classes {
        let new_id = map.get(id).copied().unwrap_or(*id);
        match remapped.get(&new_id) {
            None => {
                remapped.insert(new_id, name.clone());
            }
            Some(existing) if existing != name => {
                warn!(
                    "Class '{}' ({}) merged into id {} which is already '{}'",
                    name, id, new_id, existing
                );
            }
            Some(_) => {}
        }
    }
    remapped
}

/// Rewrites one copied label in place. Returns whether any line changed.
fn rewrite_label(label_path: &Path, map: &HashMap<u32, u32>) -> std::io::Result<bool> {
    let mut file = read_label_file(label_path)?;
    for (line_number, err) in &file.malformed {
        warn!("Dropping line {} of {:?}: {}", line_number, label_path, err);
    }
    let mut changed = !file.malformed.is_empty();
    for line in &mut file.lines {
        if let Some(new_id) = map.get(&line.class_id) {
            changed |= *new_id != line.class_id;
            line.class_id = *new_id;
        }
    }
    write_label_file(label_path, &file.lines)?;
    Ok(changed)
}

/// Copies a dataset to `output_root` with class ids rewritten by `rules`.
///
/// # Arguments
/// * `rules` - Old to new class id; ids without a rule are kept
/// * `splits` - Splits to copy, empty for all
///
/// # Returns
/// * `Ok(TransformSummary)` with one output dataset
/// * `Err(DatasetError::InvalidArgument)` if one old id maps to two new ids
pub fn remap_classes(
    ctx: &TransformContext<'_>,
    dataset_root: &Path,
    output_root: &Path,
    rules: &[RemapRule],
    splits: &[DatasetSplit],
) -> Result<TransformSummary> {
    let map = rule_map(rules)?;
    let dataset = Dataset::open(dataset_root)?;
    let splits = normalize_splits(splits);
    let pool = build_pool(ctx.workers)?;

    create_output_root(output_root)?;
    create_directory_structure(output_root, &splits)?;
    let classes = remap_registry(&dataset.class_registry(), &map);

    let mut summary = TransformSummary::default();
    let mut output = OutputDataset::new(output_root);
    let rewritten = AtomicUsize::new(0);

    for (i, split) in splits.iter().enumerate() {
        let start = scaled_percent(i, splits.len(), 0, 95);
        let end = scaled_percent(i + 1, splits.len(), 0, 95);
        let mid = start + (end - start) / 2;

        let stems = dataset.stems(*split);
        ctx.progress
            .report(start, &format!("Copying {} images from {} split...", stems.len(), split));
        let copied = ctx.copy_split(dataset.root(), output_root, *split, &stems, (start, mid), &mut summary)?;
        output.add_images(*split, copied);

        ctx.progress
            .report(mid, &format!("Remapping labels in {} split...", split));
        let labels = list_label_stems(output_root, *split);
        pool.install(|| {
            labels.par_iter().for_each(|stem| {
                if ctx.cancel.is_cancelled() {
                    return;
                }
                let path = resolve_label_path(output_root, *split, stem);
                match rewrite_label(&path, &map) {
                    Ok(true) => {
                        rewritten.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Failed to remap {:?}: {}", path, e),
                }
            })
        });
        ctx.cancel.check()?;
    }

    write_dataset_config(output_root, &classes, &splits)?;
    info!("Rewrote {} label files", rewritten.load(Ordering::Relaxed));
    summary.outputs.push(output);
    summary.log("Remap");
    ctx.progress.report(100, "Remap complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::load_class_registry;
    use crate::core::transform::test_support::{add_image, write_names};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_remap_rewrites_labels_and_registry() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        write_names(&src, &[(0, "person"), (1, "pedestrian"), (2, "car")]);
        add_image(&src, "train", "a", Some(&[0, 1, 2]));
        fs::write(src.join("labels/train/b.txt"), "1 0.1 0.2 0.3 0.4\nbad line\n").unwrap();
        add_image(&src, "train", "b", None);

        let out = dir.path().join("out");
        let summary = remap_classes(
            &TransformContext::default(),
            &src,
            &out,
            &[RemapRule::new(1, 0), RemapRule::new(2, 5)],
            &[DatasetSplit::Train],
        )
        .unwrap();

        assert_eq!(summary.images_copied, 2);
        let a = fs::read_to_string(out.join("labels/train/a.txt")).unwrap();
        let ids: Vec<&str> = a.lines().map(|l| l.split(' ').next().unwrap()).collect();
        assert_eq!(ids, vec!["0", "0", "5"]);
        assert_eq!(
            fs::read_to_string(out.join("labels/train/b.txt")).unwrap(),
            "0 0.100000 0.200000 0.300000 0.400000\n"
        );
        // Source is untouched.
        assert!(fs::read_to_string(src.join("labels/train/a.txt")).unwrap().contains("\n1 "));

        let registry = load_class_registry(&out);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry[&0], "person");
        assert_eq!(registry[&5], "car");
    }

    #[test]
    fn test_conflicting_rules_are_rejected() {
        let err = rule_map(&[RemapRule::new(1, 2), RemapRule::new(1, 3)]).unwrap_err();
        assert!(matches!(err, DatasetError::InvalidArgument(_)));
        assert!(rule_map(&[RemapRule::new(1, 2), RemapRule::new(1, 2)]).is_ok());
    }
}
