//! Dataset-to-dataset operations.
//!
//! Every operation reads one or more dataset roots, writes a new dataset tree
//! (or rewrites one in place, for consolidation) and returns a
//! [`TransformSummary`]. Randomised operations take an optional seed and build
//! one RNG for the whole call with [`operation_rng`].

mod balance;
mod consolidate;
mod dedup;
mod filter;
mod merge;
mod remap;
mod split;

pub use balance::{
    execute_balance, get_recommendations, plan_balance, BalanceCandidate, BalanceConfig,
    BalancePlan, BalanceSelector, BalanceStrategy, ClassBalance, GreedySelector,
    SelectionStrategy,
};
pub use consolidate::consolidate_to_train;
pub use dedup::{find_duplicates, hash_file, DuplicateGroup, DuplicateReport};
pub use filter::{filter_dataset, ClassCombinator, ClassPolarity, ClassPredicate, FilterMode};
pub use merge::{merge_datasets, merge_registries};
pub use remap::{remap_classes, RemapRule};
pub use split::{
    extract_subset, plan_count_chunks, plan_parts, split_by_count, split_into_parts, SplitPlan,
};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::dataset::{
    label_class_ids, list_label_stems, list_stems, resolve_label_path, ClassRegistry,
    DatasetSplit,
};
use crate::core::operations::{BulkCopier, CopySummary};
use crate::core::progress::{Banded, CancelToken, NoProgress, ProgressReporter};
use crate::error::{DatasetError, Result};

/// The RNG for one top-level operation.
pub fn operation_rng(seed: Option<u64>) -> ChaCha8Rng {
    seed.map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64)
}

/// Shared collaborators for a transform call.
pub struct TransformContext<'a> {
    pub copier: BulkCopier,
    pub workers: Option<usize>,
    pub progress: &'a dyn ProgressReporter,
    pub cancel: CancelToken,
}

impl Default for TransformContext<'_> {
    fn default() -> Self {
        Self {
            copier: BulkCopier::direct(),
            workers: None,
            progress: &NoProgress,
            cancel: CancelToken::new(),
        }
    }
}

impl<'a> TransformContext<'a> {
    pub fn new(copier: BulkCopier, progress: &'a dyn ProgressReporter) -> Self {
        Self {
            copier,
            workers: None,
            progress,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copies `stems` of one split, reporting within `[start, end]`, and
    /// folds the counts into `summary`. Returns the images copied.
    pub(crate) fn copy_split(
        &self,
        src_root: &Path,
        dest_root: &Path,
        split: DatasetSplit,
        stems: &[String],
        band: (u8, u8),
        summary: &mut TransformSummary,
    ) -> Result<usize> {
        let banded = Banded::new(self.progress, band.0, band.1);
        let copied = self
            .copier
            .copy_pairs(src_root, dest_root, split, stems, &banded, &self.cancel)?;
        summary.record_copy(&copied);
        Ok(copied.images_copied)
    }
}

/// One dataset tree written by a transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputDataset {
    pub root: PathBuf,
    pub images_per_split: BTreeMap<DatasetSplit, usize>,
}

impl OutputDataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            images_per_split: BTreeMap::new(),
        }
    }

    pub fn add_images(&mut self, split: DatasetSplit, count: usize) {
        *self.images_per_split.entry(split).or_insert(0) += count;
    }

    pub fn total_images(&self) -> usize {
        self.images_per_split.values().sum()
    }
}

/// Final counts of a transform. Output image counts always add up to
/// `images_copied`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformSummary {
    pub outputs: Vec<OutputDataset>,
    pub images_copied: usize,
    pub labels_copied: usize,
    pub skipped: usize,
}

impl TransformSummary {
    pub(crate) fn record_copy(&mut self, copy: &CopySummary) {
        self.images_copied += copy.images_copied;
        self.labels_copied += copy.labels_copied;
        self.skipped += copy.images_missing + copy.failed;
    }

    pub fn total_output_images(&self) -> usize {
        self.outputs.iter().map(OutputDataset::total_images).sum()
    }

    pub fn log(&self, operation: &str) {
        info!(
            "{} complete: {} output dataset(s), {} images, {} labels, {} skipped",
            operation,
            self.outputs.len(),
            self.images_copied,
            self.labels_copied,
            self.skipped
        );
    }
}

pub(crate) fn require_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(DatasetError::MissingInput(path.to_path_buf()))
    }
}

pub(crate) fn create_output_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| DatasetError::io(path, e))
}

/// Stems already used in one split of `root`, by an image or by a label.
/// A label without an image still reserves its stem.
pub(crate) fn occupied_stems(root: &Path, split: DatasetSplit) -> HashSet<String> {
    list_stems(root, split)
        .into_iter()
        .chain(list_label_stems(root, split))
        .collect()
}

/// Logs class ids in the copied labels that `registry` does not name.
/// Labels are never rewritten here. Returns the unresolved ids.
pub(crate) fn audit_class_ids(
    root: &Path,
    split: DatasetSplit,
    stems: &[String],
    registry: &ClassRegistry,
) -> BTreeSet<u32> {
    if registry.is_empty() {
        return BTreeSet::new();
    }
    let mut unresolved = BTreeSet::new();
    for stem in stems {
        for id in label_class_ids(&resolve_label_path(root, split, stem)) {
            if !registry.contains_key(&id) {
                unresolved.insert(id);
            }
        }
    }
    if !unresolved.is_empty() {
        warn!(
            "{} split of {:?} uses class ids missing from the registry: {:?}",
            split, root, unresolved
        );
    }
    unresolved
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::Path;

    /// Writes `images/<split>/<stem>.png` and, when `classes` is given, a label
    /// with one box per class id.
    pub fn add_image(root: &Path, split: &str, stem: &str, classes: Option<&[u32]>) {
        let images = root.join("images").join(split);
        let labels = root.join("labels").join(split);
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&labels).unwrap();
        fs::write(images.join(format!("{}.png", stem)), format!("img-{}-{}", split, stem)).unwrap();
        if let Some(classes) = classes {
            let content: String = classes
                .iter()
                .map(|c| format!("{} 0.500000 0.500000 0.100000 0.100000\n", c))
                .collect();
            fs::write(labels.join(format!("{}.txt", stem)), content).unwrap();
        }
    }

    pub fn write_names(root: &Path, names: &[(u32, &str)]) {
        let mut yaml = String::from("names:\n");
        for (id, name) in names {
            yaml.push_str(&format!("  {}: {}\n", id, name));
        }
        fs::create_dir_all(root).unwrap();
        fs::write(root.join("dataset.yaml"), yaml).unwrap();
    }

    pub fn count_images(root: &Path, split: &str) -> usize {
        fs::read_dir(root.join("images").join(split))
            .map(|entries| entries.flatten().count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let a: Vec<u32> = operation_rng(Some(7)).sample_iter(rand::distributions::Standard).take(4).collect();
        let b: Vec<u32> = operation_rng(Some(7)).sample_iter(rand::distributions::Standard).take(4).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_orphan_labels_occupy_their_stem() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        test_support::add_image(root, "train", "a", None);
        fs::create_dir_all(root.join("labels/train")).unwrap();
        fs::write(root.join("labels/train/orphan.txt"), "0 0.5 0.5 0.1 0.1\n").unwrap();

        let taken = occupied_stems(root, DatasetSplit::Train);
        assert!(taken.contains("a"));
        assert!(taken.contains("orphan"));
        assert!(occupied_stems(root, DatasetSplit::Val).is_empty());
    }

    #[test]
    fn test_summary_totals() {
        let mut summary = TransformSummary::default();
        summary.record_copy(&CopySummary {
            images_copied: 3,
            labels_copied: 2,
            images_missing: 1,
            failed: 1,
            ..Default::default()
        });
        let mut out = OutputDataset::new("/tmp/out");
        out.add_images(DatasetSplit::Train, 3);
        summary.outputs.push(out);
        assert_eq!(summary.total_output_images(), summary.images_copied);
        assert_eq!(summary.skipped, 2);
    }
}
