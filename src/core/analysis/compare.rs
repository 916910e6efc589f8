use serde::Serialize;
use std::collections::BTreeMap;

use super::statistics::DatasetStatistics;

/// One class seen in either of two compared datasets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassComparison {
    pub class_id: u32,
    pub class_name: String,
    pub dataset1_count: usize,
    pub dataset2_count: usize,
}

impl ClassComparison {
    pub fn difference(&self) -> i64 {
        self.dataset2_count as i64 - self.dataset1_count as i64
    }

    /// Change relative to the first dataset. 0 when the first dataset has no
    /// instances of the class; see [`DatasetComparison::only_in_second`].
    pub fn percentage_difference(&self) -> f64 {
        if self.dataset1_count == 0 {
            return 0.0;
        }
        self.difference() as f64 / self.dataset1_count as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetComparison {
    pub dataset1_images: usize,
    pub dataset2_images: usize,
    pub dataset1_annotations: usize,
    pub dataset2_annotations: usize,
    pub classes: Vec<ClassComparison>,
}

impl DatasetComparison {
    pub fn only_in_first(&self) -> impl Iterator<Item = &ClassComparison> {
        self.classes
            .iter()
            .filter(|c| c.dataset1_count > 0 && c.dataset2_count == 0)
    }

    pub fn only_in_second(&self) -> impl Iterator<Item = &ClassComparison> {
        self.classes
            .iter()
            .filter(|c| c.dataset1_count == 0 && c.dataset2_count > 0)
    }
}

/// Compares instance counts class by class. Names come from the first
/// dataset that knows the class.
pub fn compare_datasets(first: &DatasetStatistics, second: &DatasetStatistics) -> DatasetComparison {
    let mut classes: BTreeMap<u32, ClassComparison> = BTreeMap::new();

    for (id, stats) in &first.class_stats {
        classes.insert(
            *id,
            ClassComparison {
                class_id: *id,
                class_name: stats.class_name.clone(),
                dataset1_count: stats.instance_count,
                dataset2_count: 0,
            },
        );
    }
    for (id, stats) in &second.class_stats {
        classes
            .entry(*id)
            .or_insert_with(|| ClassComparison {
                class_id: *id,
                class_name: stats.class_name.clone(),
                dataset1_count: 0,
                dataset2_count: 0,
            })
            .dataset2_count = stats.instance_count;
    }

    DatasetComparison {
        dataset1_images: first.total_images,
        dataset2_images: second.total_images,
        dataset1_annotations: first.total_annotations,
        dataset2_annotations: second.total_annotations,
        classes: classes.into_values().collect(),
    }
}
