use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

use super::{audit_class_ids, create_output_root, operation_rng, OutputDataset, TransformContext, TransformSummary};
use crate::core::dataset::{
    create_directory_structure, label_class_ids, normalize_splits, resolve_label_path,
    write_dataset_config, ClassRegistry, Dataset, DatasetSplit,
};
use crate::core::pool::build_pool;
use crate::core::progress::scaled_percent;
use crate::error::{DatasetError, Result};

/// How the selected classes combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClassCombinator {
    /// Every selected class
    #[default]
    And,
    /// At least one selected class
    Or,
}

/// Whether matching images contain or lack the selected classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClassPolarity {
    #[default]
    Contains,
    Excludes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPredicate {
    pub classes: BTreeSet<u32>,
    pub combinator: ClassCombinator,
    pub polarity: ClassPolarity,
}

impl ClassPredicate {
    pub fn new(
        classes: impl IntoIterator<Item = u32>,
        combinator: ClassCombinator,
        polarity: ClassPolarity,
    ) -> Self {
        Self {
            classes: classes.into_iter().collect(),
            combinator,
            polarity,
        }
    }

    /// | combinator | contains              | excludes                   |
    /// |------------|-----------------------|----------------------------|
    /// | And        | image ⊇ selected      | image ∩ selected = ∅       |
    /// | Or         | image ∩ selected ≠ ∅  | some selected class absent |
    pub fn matches(&self, image_classes: &BTreeSet<u32>) -> bool {
        match (self.combinator, self.polarity) {
            (ClassCombinator::And, ClassPolarity::Contains) => {
                self.classes.iter().all(|c| image_classes.contains(c))
            }
            (ClassCombinator::And, ClassPolarity::Excludes) => {
                !self.classes.iter().any(|c| image_classes.contains(c))
            }
            (ClassCombinator::Or, ClassPolarity::Contains) => {
                self.classes.iter().any(|c| image_classes.contains(c))
            }
            (ClassCombinator::Or, ClassPolarity::Excludes) => {
                self.classes.iter().any(|c| !image_classes.contains(c))
            }
        }
    }
}

/// Which images a filter keeps from each split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    ByClass(ClassPredicate),
    /// The first `n` stems in listing order
    FirstN(usize),
    RandomN(usize),
}

impl FilterMode {
    pub fn as_str(&self) -> &str {
        match self {
            FilterMode::ByClass(_) => "By Class",
            FilterMode::FirstN(_) => "First N",
            FilterMode::RandomN(_) => "Random N",
        }
    }

    /// The registry to write for the filtered dataset.
    fn output_registry(&self, classes: &ClassRegistry) -> ClassRegistry {
        match self {
            FilterMode::ByClass(predicate) if predicate.polarity == ClassPolarity::Contains => classes
                .iter()
                .filter(|(id, _)| predicate.classes.contains(id))
                .map(|(id, name)| (*id, name.clone()))
                .collect(),
            _ => classes.clone(),
        }
    }
}

/// Copies the images of each split that `mode` selects into `output_root`.
///
/// # Arguments
/// * `mode` - Class predicate, or first/random N per split
/// * `splits` - Splits to filter, empty for all
/// * `seed` - Used by `FilterMode::RandomN` only
///
/// # Returns
/// * `Ok(TransformSummary)` with one output dataset
/// * `Err(DatasetError::InvalidArgument)` for a class predicate with no classes
pub fn filter_dataset(
    ctx: &TransformContext<'_>,
    dataset_root: &Path,
    output_root: &Path,
    mode: &FilterMode,
    splits: &[DatasetSplit],
    seed: Option<u64>,
) -> Result<TransformSummary> {
    if let FilterMode::ByClass(predicate) = mode {
        if predicate.classes.is_empty() {
            return Err(DatasetError::InvalidArgument(
                "select at least one class to filter by".to_string(),
            ));
        }
    }
    let dataset = Dataset::open(dataset_root)?;
    let splits = normalize_splits(splits);
    let mut rng = operation_rng(seed);
    let pool = build_pool(ctx.workers)?;

    create_output_root(output_root)?;
    create_directory_structure(output_root, &splits)?;
    let classes = mode.output_registry(&dataset.class_registry());

    let mut summary = TransformSummary::default();
    let mut output = OutputDataset::new(output_root);

    for (i, split) in splits.iter().enumerate() {
        let band = (
            scaled_percent(i, splits.len(), 0, 95),
            scaled_percent(i + 1, splits.len(), 0, 95),
        );
        let stems = dataset.stems(*split);
        let selected: Vec<String> = match mode {
            FilterMode::ByClass(predicate) => {
                ctx.progress
                    .report(band.0, &format!("Filtering {} split by class...", split));
                let root = dataset.root();
                pool.install(|| {
                    stems
                        .par_iter()
                        .filter(|stem| {
                            !ctx.cancel.is_cancelled()
                                && predicate.matches(&label_class_ids(&resolve_label_path(root, *split, stem)))
                        })
                        .cloned()
                        .collect()
                })
            }
            FilterMode::FirstN(n) => {
                ctx.progress
                    .report(band.0, &format!("Taking first {} images from {} split...", n, split));
                stems.into_iter().take(*n).collect()
            }
            FilterMode::RandomN(n) => {
                ctx.progress
                    .report(band.0, &format!("Taking random {} images from {} split...", n, split));
                let mut shuffled = stems;
                shuffled.shuffle(&mut rng);
                shuffled.truncate(*n);
                shuffled
            }
        };
        ctx.cancel.check()?;

        info!("Copying {} images from {} split...", selected.len(), split);
        let copied = ctx.copy_split(dataset.root(), output_root, *split, &selected, band, &mut summary)?;
        audit_class_ids(output_root, *split, &selected, &classes);
        output.add_images(*split, copied);
    }

    write_dataset_config(output_root, &classes, &splits)?;
    summary.outputs.push(output);
    summary.log(&format!("Filter ({})", mode.as_str()));
    ctx.progress.report(100, "Filter complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::{list_stems, load_class_registry};
    use crate::core::transform::test_support::{add_image, count_images, write_names};
    use tempfile::TempDir;

    fn set(ids: &[u32]) -> BTreeSet<u32> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_class_predicate_truth_table() {
        let images = [set(&[1]), set(&[1, 2]), set(&[2, 3])];
        let keep = |combinator, polarity| -> Vec<bool> {
            let predicate = ClassPredicate::new([1, 2], combinator, polarity);
            images.iter().map(|i| predicate.matches(i)).collect()
        };

        assert_eq!(keep(ClassCombinator::And, ClassPolarity::Contains), vec![false, true, false]);
        assert_eq!(keep(ClassCombinator::And, ClassPolarity::Excludes), vec![false, false, false]);
        assert_eq!(keep(ClassCombinator::Or, ClassPolarity::Contains), vec![true, true, true]);
        assert_eq!(keep(ClassCombinator::Or, ClassPolarity::Excludes), vec![true, false, true]);

        let none = set(&[]);
        assert!(ClassPredicate::new([1, 2], ClassCombinator::And, ClassPolarity::Excludes).matches(&none));
    }

    fn sample(root: &Path) {
        write_names(root, &[(1, "car"), (2, "bus"), (3, "bike")]);
        add_image(root, "train", "a", Some(&[1]));
        add_image(root, "train", "b", Some(&[1, 2]));
        add_image(root, "train", "c", Some(&[2, 3]));
        add_image(root, "train", "d", None);
    }

    #[test]
    fn test_filter_and_contains_keeps_superset_only() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        sample(&src);
        let out = dir.path().join("out");

        let mode = FilterMode::ByClass(ClassPredicate::new(
            [1, 2],
            ClassCombinator::And,
            ClassPolarity::Contains,
        ));
        let summary = filter_dataset(&TransformContext::default(), &src, &out, &mode, &[DatasetSplit::Train], None)
            .unwrap();

        assert_eq!(list_stems(&out, DatasetSplit::Train), vec!["b".to_string()]);
        assert_eq!(summary.images_copied, 1);
        let registry = load_class_registry(&out);
        assert_eq!(registry.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_filter_excludes_keeps_full_registry() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        sample(&src);
        let out = dir.path().join("out");

        let mode = FilterMode::ByClass(ClassPredicate::new([3], ClassCombinator::Or, ClassPolarity::Excludes));
        filter_dataset(&TransformContext::default(), &src, &out, &mode, &[], None).unwrap();

        assert_eq!(
            list_stems(&out, DatasetSplit::Train),
            vec!["a".to_string(), "b".to_string(), "d".to_string()]
        );
        assert_eq!(load_class_registry(&out).len(), 3);
    }

    #[test]
    fn test_filter_first_and_random_n() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        sample(&src);

        let first = dir.path().join("first");
        filter_dataset(&TransformContext::default(), &src, &first, &FilterMode::FirstN(2), &[], None).unwrap();
        assert_eq!(list_stems(&first, DatasetSplit::Train), vec!["a".to_string(), "b".to_string()]);

        let random = dir.path().join("random");
        let summary =
            filter_dataset(&TransformContext::default(), &src, &random, &FilterMode::RandomN(3), &[], Some(5)).unwrap();
        assert_eq!(count_images(&random, "train"), 3);
        assert_eq!(summary.total_output_images(), 3);
    }

    #[test]
    fn test_empty_class_selection_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mode = FilterMode::ByClass(ClassPredicate::new([], ClassCombinator::Or, ClassPolarity::Contains));
        let err = filter_dataset(&TransformContext::default(), dir.path(), &dir.path().join("o"), &mode, &[], None)
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidArgument(_)));
    }
}
