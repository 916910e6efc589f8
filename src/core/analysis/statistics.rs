//! Aggregate class and annotation statistics.
//!
//! Each worker tallies one image without touching shared state, folds it into
//! a worker-local [`StatsAccumulator`], and the accumulators are reduced once
//! per split. No locks are taken in the hot path.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::core::dataset::{
    class_name, list_stems, load_class_registry, read_label_file, resolve_label_path,
    validate_layout, DatasetSplit,
};
use crate::core::pool::build_pool;
use crate::core::progress::{scaled_percent, CancelToken, ProgressReporter};
use crate::error::{DatasetError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassStatistics {
    pub class_id: u32,
    pub class_name: String,
    pub instance_count: usize,
    pub image_count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub total_images: usize,
    pub train_images: usize,
    pub val_images: usize,
    pub test_images: usize,
    pub total_annotations: usize,
    pub images_without_labels: usize,
    pub average_annotations_per_image: f64,
    pub min_annotations_per_image: usize,
    pub max_annotations_per_image: usize,
    pub class_stats: BTreeMap<u32, ClassStatistics>,
}

impl DatasetStatistics {
    pub fn images_in(&self, split: DatasetSplit) -> usize {
        match split {
            DatasetSplit::Train => self.train_images,
            DatasetSplit::Val => self.val_images,
            DatasetSplit::Test => self.test_images,
        }
    }

    /// Classes ordered by instance count, most frequent first; ties by id.
    pub fn classes_by_frequency(&self) -> Vec<&ClassStatistics> {
        let mut classes: Vec<&ClassStatistics> = self.class_stats.values().collect();
        classes.sort_by(|a, b| {
            b.instance_count
                .cmp(&a.instance_count)
                .then(a.class_id.cmp(&b.class_id))
        });
        classes
    }
}

/// What one image contributes.
#[derive(Debug, Clone, Default)]
struct ImageTally {
    has_label: bool,
    per_class: BTreeMap<u32, usize>,
}

impl ImageTally {
    fn instances(&self) -> usize {
        self.per_class.values().sum()
    }
}

/// Running totals for a set of images.
#[derive(Debug, Clone, Default)]
struct StatsAccumulator {
    images: usize,
    annotations: usize,
    without_labels: usize,
    min_annotations: Option<usize>,
    max_annotations: usize,
    instances: BTreeMap<u32, usize>,
    images_per_class: BTreeMap<u32, usize>,
}

impl StatsAccumulator {
    fn add(mut self, tally: ImageTally) -> Self {
        let count = tally.instances();
        self.images += 1;
        self.annotations += count;
        if !tally.has_label {
            self.without_labels += 1;
        }
        self.min_annotations = Some(self.min_annotations.map_or(count, |m| m.min(count)));
        self.max_annotations = self.max_annotations.max(count);
        for (class_id, n) in tally.per_class {
            *self.instances.entry(class_id).or_insert(0) += n;
            *self.images_per_class.entry(class_id).or_insert(0) += 1;
        }
        self
    }

    fn merge(mut self, other: Self) -> Self {
        self.images += other.images;
        self.annotations += other.annotations;
        self.without_labels += other.without_labels;
        self.min_annotations = match (self.min_annotations, other.min_annotations) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_annotations = self.max_annotations.max(other.max_annotations);
        for (class_id, n) in other.instances {
            *self.instances.entry(class_id).or_insert(0) += n;
        }
        for (class_id, n) in other.images_per_class {
            *self.images_per_class.entry(class_id).or_insert(0) += n;
        }
        self
    }
}

fn tally_image(root: &Path, split: DatasetSplit, stem: &str) -> ImageTally {
    let label_path = resolve_label_path(root, split, stem);
    if !label_path.exists() {
        return ImageTally::default();
    }
    match read_label_file(&label_path) {
        Ok(file) => {
            let mut per_class = BTreeMap::new();
            for line in &file.lines {
                *per_class.entry(line.class_id).or_insert(0) += 1;
            }
            ImageTally {
                has_label: true,
                per_class,
            }
        }
        Err(e) => {
            warn!("Failed to read {:?}: {}", label_path, e);
            ImageTally {
                has_label: true,
                per_class: BTreeMap::new(),
            }
        }
    }
}

/// Computes [`DatasetStatistics`] over every split of a dataset.
#[derive(Debug, Clone)]
pub struct StatisticsEngine {
    workers: Option<usize>,
    progress_interval: usize,
}

impl Default for StatisticsEngine {
    fn default() -> Self {
        Self {
            workers: None,
            progress_interval: 100,
        }
    }
}

impl StatisticsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    pub fn analyze(
        &self,
        root: &Path,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<DatasetStatistics> {
        if !validate_layout(root) {
            return Err(DatasetError::InvalidLayout(root.to_path_buf()));
        }
        progress.report(5, "Loading dataset...");
        let pool = build_pool(self.workers)?;
        let classes = load_class_registry(root);

        let per_split: Vec<(DatasetSplit, Vec<String>)> = DatasetSplit::ALL
            .into_iter()
            .map(|split| (split, list_stems(root, split)))
            .collect();
        let total: usize = per_split.iter().map(|(_, s)| s.len()).sum();
        info!("Analyzing {} images in {:?}", total, root);

        let processed = AtomicUsize::new(0);
        let mut stats = DatasetStatistics::default();
        let mut overall = StatsAccumulator::default();

        for (split, stems) in &per_split {
            progress.report(
                scaled_percent(processed.load(Ordering::Relaxed), total, 5, 95),
                &format!("Analyzing {} split ({} images)...", split, stems.len()),
            );

            let split_acc = pool.install(|| {
                stems
                    .par_iter()
                    .filter(|_| !cancel.is_cancelled())
                    .map(|stem| {
                        let tally = tally_image(root, *split, stem);
                        let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                        if done % self.progress_interval == 0 {
                            progress.report(
                                scaled_percent(done, total, 5, 95),
                                &format!("Processed {}/{} images", done, total),
                            );
                        }
                        tally
                    })
                    .fold(StatsAccumulator::default, StatsAccumulator::add)
                    .reduce(StatsAccumulator::default, StatsAccumulator::merge)
            });
            cancel.check()?;

            debug!("{} split: {} images", split, split_acc.images);
            match split {
                DatasetSplit::Train => stats.train_images = split_acc.images,
                DatasetSplit::Val => stats.val_images = split_acc.images,
                DatasetSplit::Test => stats.test_images = split_acc.images,
            }
            overall = overall.merge(split_acc);
        }

        progress.report(95, "Calculating statistics...");
        stats.total_images = overall.images;
        stats.total_annotations = overall.annotations;
        stats.images_without_labels = overall.without_labels;
        stats.min_annotations_per_image = overall.min_annotations.unwrap_or(0);
        stats.max_annotations_per_image = overall.max_annotations;
        stats.average_annotations_per_image = if overall.images > 0 {
            overall.annotations as f64 / overall.images as f64
        } else {
            0.0
        };

        for (class_id, instance_count) in &overall.instances {
            let percentage = if overall.annotations > 0 {
                *instance_count as f64 / overall.annotations as f64 * 100.0
            } else {
                0.0
            };
            stats.class_stats.insert(
                *class_id,
                ClassStatistics {
                    class_id: *class_id,
                    class_name: class_name(&classes, *class_id),
                    instance_count: *instance_count,
                    image_count: overall.images_per_class.get(class_id).copied().unwrap_or(0),
                    percentage,
                },
            );
        }

        info!(
            "Analysis complete: {} images, {} annotations, {} classes",
            stats.total_images,
            stats.total_annotations,
            stats.class_stats.len()
        );
        progress.report(100, "Analysis complete");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::NoProgress;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn sample_dataset(root: &Path) {
        write(root, "dataset.yaml", "names:\n  0: person\n  1: car\n");
        write(root, "images/train/a.png", "x");
        write(root, "labels/train/a.txt", "0 0.5 0.5 0.1 0.1\n0 0.2 0.2 0.1 0.1\n1 0.3 0.3 0.1 0.1\n");
        write(root, "images/train/b.png", "x");
        write(root, "labels/train/b.txt", "1 0.5 0.5 0.1 0.1\n");
        write(root, "images/val/c.jpg", "x");
        write(root, "labels/val/c.txt", "2 0.5 0.5 0.1 0.1\nbroken\n");
        write(root, "images/test/d.png", "x");
        fs::create_dir_all(root.join("labels/test")).unwrap();
    }

    #[test]
    fn test_statistics_aggregate() {
        let dir = TempDir::new().unwrap();
        sample_dataset(dir.path());

        let stats = StatisticsEngine::new()
            .with_workers(Some(3))
            .analyze(dir.path(), &NoProgress, &CancelToken::new())
            .unwrap();

        assert_eq!(stats.total_images, 4);
        assert_eq!((stats.train_images, stats.val_images, stats.test_images), (2, 1, 1));
        assert_eq!(stats.total_annotations, 5);
        assert_eq!(stats.images_without_labels, 1);
        assert_eq!(stats.min_annotations_per_image, 0);
        assert_eq!(stats.max_annotations_per_image, 3);
        assert!((stats.average_annotations_per_image - 1.25).abs() < 1e-9);

        let person = &stats.class_stats[&0];
        assert_eq!(person.class_name, "person");
        assert_eq!(person.instance_count, 2);
        assert_eq!(person.image_count, 1);
        assert!((person.percentage - 40.0).abs() < 1e-9);

        let car = &stats.class_stats[&1];
        assert_eq!(car.image_count, 2);
        assert_eq!(stats.class_stats[&2].class_name, "class_2");

        let order: Vec<u32> = stats.classes_by_frequency().iter().map(|c| c.class_id).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_dataset_has_zero_percentages() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("images")).unwrap();
        fs::create_dir_all(dir.path().join("labels")).unwrap();

        let stats = StatisticsEngine::new()
            .analyze(dir.path(), &NoProgress, &CancelToken::new())
            .unwrap();
        assert_eq!(stats.total_images, 0);
        assert_eq!(stats.average_annotations_per_image, 0.0);
        assert!(stats.class_stats.is_empty());
    }

    #[test]
    fn test_progress_reaches_completion() {
        let dir = TempDir::new().unwrap();
        sample_dataset(dir.path());
        let seen = Mutex::new(Vec::new());
        let sink = |p: u8, _s: &str| seen.lock().unwrap().push(p);

        StatisticsEngine::new()
            .with_progress_interval(1)
            .analyze(dir.path(), &sink, &CancelToken::new())
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&5));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.iter().all(|p| *p <= 100));
    }
}
