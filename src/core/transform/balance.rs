//! Class balancing.
//!
//! A [`BalanceStrategy`] turns the primary dataset's per-class instance counts
//! into per-class targets. A [`BalanceSelector`] then picks images from the
//! primary dataset (and, once those run out, from an optional secondary
//! dataset) to approach those targets. [`execute_balance`] copies the picked
//! images into a new dataset. Images are never duplicated; a class that
//! cannot reach its target shows a deficit in the plan.

use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::merge::{copy_renamed, merge_registries};
use super::{
    create_output_root, occupied_stems, operation_rng, require_dir, OutputDataset,
    TransformContext, TransformSummary,
};
use crate::core::dataset::{
    class_name, create_directory_structure, load_class_registry, normalize_splits,
    read_label_file, resolve_label_path, write_dataset_config, ClassRegistry, Dataset,
    DatasetSplit,
};
use crate::core::operations::unique_stem;
use crate::core::pool::build_pool;
use crate::core::progress::scaled_percent;
use crate::error::{DatasetError, Result};

/// How per-class instance targets are derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceStrategy {
    /// The same target for every class
    EqualForAll(usize),
    /// Every class down to the rarest class's count
    ToMinimumClass,
    /// Explicit targets; classes not listed keep their current count
    CustomPerClass(BTreeMap<u32, usize>),
}

impl BalanceStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            BalanceStrategy::EqualForAll(_) => "Equal For All",
            BalanceStrategy::ToMinimumClass => "To Minimum Class",
            BalanceStrategy::CustomPerClass(_) => "Custom Per Class",
        }
    }

    /// Target instance count for each class in `current`.
    pub fn targets(&self, current: &BTreeMap<u32, usize>) -> BTreeMap<u32, usize> {
        match self {
            BalanceStrategy::EqualForAll(target) => current.keys().map(|id| (*id, *target)).collect(),
            BalanceStrategy::ToMinimumClass => {
                let min = current.values().copied().filter(|c| *c > 0).min().unwrap_or(0);
                current.keys().map(|id| (*id, min)).collect()
            }
            BalanceStrategy::CustomPerClass(custom) => {
                let mut targets: BTreeMap<u32, usize> = current.clone();
                for (id, target) in custom {
                    targets.insert(*id, *target);
                }
                targets
            }
        }
    }
}

/// Order in which candidate images are considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SelectionStrategy {
    /// Select randomly
    #[default]
    Random,
    /// Select images with fewest detections first
    FewestDetections,
    /// Select oldest files first (by name, assuming timestamp-based names)
    OldestFirst,
    /// Select newest files first
    NewestFirst,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            SelectionStrategy::Random => "Random",
            SelectionStrategy::FewestDetections => "Fewest Detections",
            SelectionStrategy::OldestFirst => "Oldest First",
            SelectionStrategy::NewestFirst => "Newest First",
        }
    }

    pub fn all() -> Vec<SelectionStrategy> {
        vec![
            SelectionStrategy::Random,
            SelectionStrategy::FewestDetections,
            SelectionStrategy::OldestFirst,
            SelectionStrategy::NewestFirst,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceConfig {
    pub primary: PathBuf,
    /// Extra images to draw from once the primary dataset is exhausted.
    pub secondary: Option<PathBuf>,
    pub strategy: BalanceStrategy,
    pub selection: SelectionStrategy,
    pub splits: Vec<DatasetSplit>,
    pub seed: Option<u64>,
}

impl BalanceConfig {
    pub fn new(primary: impl Into<PathBuf>, strategy: BalanceStrategy) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
            strategy,
            selection: SelectionStrategy::default(),
            splits: Vec::new(),
            seed: None,
        }
    }
}

/// One image that may be picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceCandidate {
    pub dataset_root: PathBuf,
    pub split: DatasetSplit,
    pub stem: String,
    pub instances: BTreeMap<u32, usize>,
}

impl BalanceCandidate {
    pub fn detection_count(&self) -> usize {
        self.instances.values().sum()
    }
}

/// Picks candidates toward the targets. Candidates arrive already ordered
/// by the configured [`SelectionStrategy`].
pub trait BalanceSelector: Send + Sync {
    fn name(&self) -> &str;

    /// Indices into `candidates` of the chosen images.
    fn select(&self, candidates: &[BalanceCandidate], targets: &BTreeMap<u32, usize>) -> Vec<usize>;
}

/// Takes each candidate in order if the instances it adds toward unmet
/// targets outweigh the instances it adds beyond them.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySelector;

impl BalanceSelector for GreedySelector {
    fn name(&self) -> &str {
        "Greedy"
    }

    fn select(&self, candidates: &[BalanceCandidate], targets: &BTreeMap<u32, usize>) -> Vec<usize> {
        let mut selected_counts: BTreeMap<u32, usize> = BTreeMap::new();
        let mut chosen = Vec::new();

        for (idx, candidate) in candidates.iter().enumerate() {
            let mut useful = 0usize;
            let mut excess = 0usize;
            for (id, count) in &candidate.instances {
                let target = targets.get(id).copied().unwrap_or(0);
                let have = selected_counts.get(id).copied().unwrap_or(0);
                let remaining = target.saturating_sub(have);
                useful += (*count).min(remaining);
                excess += count.saturating_sub(remaining);
            }
            if useful > 0 && useful > excess {
                for (id, count) in &candidate.instances {
                    *selected_counts.entry(*id).or_insert(0) += count;
                }
                chosen.push(idx);
            }
        }
        chosen
    }
}

/// Per-class outcome of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassBalance {
    pub class_id: u32,
    pub class_name: String,
    pub current: usize,
    pub target: usize,
    pub selected: usize,
}

impl ClassBalance {
    pub fn deficit(&self) -> usize {
        self.target.saturating_sub(self.selected)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalancePlan {
    pub classes: Vec<ClassBalance>,
    pub selections: Vec<BalanceCandidate>,
    pub registry: ClassRegistry,
    pub splits: Vec<DatasetSplit>,
}

impl BalancePlan {
    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }
}

fn collect_candidates(
    ctx: &TransformContext<'_>,
    root: &Path,
    splits: &[DatasetSplit],
) -> Result<Vec<BalanceCandidate>> {
    let dataset = Dataset::open(root)?;
    let pool = build_pool(ctx.workers)?;
    let mut candidates = Vec::new();
    for split in splits {
        let stems = dataset.stems(*split);
        let found: Vec<BalanceCandidate> = pool.install(|| {
            stems
                .par_iter()
                .filter(|_| !ctx.cancel.is_cancelled())
                .filter_map(|stem| {
                    let label_path = resolve_label_path(root, *split, stem);
                    let file = read_label_file(&label_path).ok()?;
                    let mut instances = BTreeMap::new();
                    for line in &file.lines {
                        *instances.entry(line.class_id).or_insert(0) += 1;
                    }
                    (!instances.is_empty()).then(|| BalanceCandidate {
                        dataset_root: root.to_path_buf(),
                        split: *split,
                        stem: stem.clone(),
                        instances,
                    })
                })
                .collect()
        });
        ctx.cancel.check()?;
        candidates.extend(found);
    }
    Ok(candidates)
}

fn order_candidates<R: rand::Rng + ?Sized>(
    candidates: &mut [BalanceCandidate],
    selection: SelectionStrategy,
    rng: &mut R,
) {
    match selection {
        SelectionStrategy::Random => candidates.shuffle(rng),
        SelectionStrategy::FewestDetections => candidates.sort_by_key(BalanceCandidate::detection_count),
        SelectionStrategy::OldestFirst => candidates.sort_by(|a, b| a.stem.cmp(&b.stem)),
        SelectionStrategy::NewestFirst => candidates.sort_by(|a, b| b.stem.cmp(&a.stem)),
    }
}

/// Computes targets from the primary dataset and lets `selector` choose the
/// images. Nothing is written.
pub fn plan_balance(
    ctx: &TransformContext<'_>,
    config: &BalanceConfig,
    selector: &dyn BalanceSelector,
) -> Result<BalancePlan> {
    require_dir(&config.primary)?;
    if let Some(secondary) = &config.secondary {
        require_dir(secondary)?;
    }
    let splits = normalize_splits(&config.splits);
    let mut rng = operation_rng(config.seed);

    ctx.progress.report(0, "Analyzing primary dataset...");
    let mut primary = collect_candidates(ctx, &config.primary, &splits)?;
    let mut current: BTreeMap<u32, usize> = BTreeMap::new();
    for candidate in &primary {
        for (id, count) in &candidate.instances {
            *current.entry(*id).or_insert(0) += count;
        }
    }
    let targets = config.strategy.targets(&current);
    info!(
        "Balancing {} classes with '{}' strategy and '{}' selector",
        targets.len(),
        config.strategy.as_str(),
        selector.name()
    );

    order_candidates(&mut primary, config.selection, &mut rng);
    let mut registries = vec![load_class_registry(&config.primary)];
    if let Some(secondary) = &config.secondary {
        ctx.progress.report(40, "Analyzing secondary dataset...");
        let mut extra = collect_candidates(ctx, secondary, &splits)?;
        order_candidates(&mut extra, config.selection, &mut rng);
        primary.extend(extra);
        registries.push(load_class_registry(secondary));
    }
    let registry = merge_registries(&registries);

    ctx.progress.report(80, "Selecting images...");
    let picked: BTreeSet<usize> = selector.select(&primary, &targets).into_iter().collect();
    let selections: Vec<BalanceCandidate> = primary
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| picked.contains(idx))
        .map(|(_, c)| c)
        .collect();

    let mut selected_counts: BTreeMap<u32, usize> = BTreeMap::new();
    for candidate in &selections {
        for (id, count) in &candidate.instances {
            *selected_counts.entry(*id).or_insert(0) += count;
        }
    }
    let class_ids: BTreeSet<u32> = targets.keys().chain(selected_counts.keys()).copied().collect();
    let classes = class_ids
        .into_iter()
        .map(|id| ClassBalance {
            class_id: id,
            class_name: class_name(&registry, id),
            current: current.get(&id).copied().unwrap_or(0),
            target: targets.get(&id).copied().unwrap_or(0),
            selected: selected_counts.get(&id).copied().unwrap_or(0),
        })
        .collect();

    ctx.progress.report(100, "Balance plan ready");
    info!("Balance plan selects {} images", selections.len());
    Ok(BalancePlan {
        classes,
        selections,
        registry,
        splits,
    })
}

/// Human-readable advice for a plan.
pub fn get_recommendations(plan: &BalancePlan) -> Vec<String> {
    let mut recommendations = Vec::new();

    if plan.classes.is_empty() {
        recommendations.push("No annotated images found in dataset.".to_string());
        return recommendations;
    }

    for class in &plan.classes {
        if class.current > class.target {
            recommendations.push(format!(
                "📉 Reduce '{}' by approximately {} instances (currently {}, target {})",
                class.class_name,
                class.current - class.target,
                class.current,
                class.target
            ));
        } else if class.current < class.target {
            recommendations.push(format!(
                "📈 Add approximately {} more '{}' instances (currently {}, target {})",
                class.target - class.current,
                class.class_name,
                class.current,
                class.target
            ));
        } else {
            recommendations.push(format!(
                "✓ '{}' is balanced ({} instances)",
                class.class_name, class.current
            ));
        }

        if class.deficit() > 0 {
            recommendations.push(format!(
                "   → Only {} of {} reachable with the available images",
                class.selected, class.target
            ));
        }
    }

    recommendations
}

/// Copies the images chosen by `plan` into a new dataset at `output_root`.
/// Images keep their split; stems from different source datasets that
/// collide are renamed.
///
/// # Arguments
/// * `plan` - Output of [`plan_balance`]
/// * `output_root` - Output dataset root, created if missing
///
/// # Returns
/// * `Ok(TransformSummary)` with one output dataset
/// * `Err(DatasetError::InvalidArgument)` if the plan selects nothing
pub fn execute_balance(
    ctx: &TransformContext<'_>,
    plan: &BalancePlan,
    output_root: &Path,
) -> Result<TransformSummary> {
    if plan.is_empty() {
        return Err(DatasetError::InvalidArgument(
            "balance plan selects no images".to_string(),
        ));
    }
    create_output_root(output_root)?;
    create_directory_structure(output_root, &plan.splits)?;

    let mut groups: BTreeMap<(PathBuf, DatasetSplit), Vec<String>> = BTreeMap::new();
    for candidate in &plan.selections {
        groups
            .entry((candidate.dataset_root.clone(), candidate.split))
            .or_default()
            .push(candidate.stem.clone());
    }

    let mut taken: BTreeMap<DatasetSplit, HashSet<String>> = plan
        .splits
        .iter()
        .map(|s| (*s, occupied_stems(output_root, *s)))
        .collect();
    let mut summary = TransformSummary::default();
    let mut output = OutputDataset::new(output_root);
    let total_groups = groups.len();

    for (i, ((source, split), stems)) in groups.iter().enumerate() {
        let band = (
            scaled_percent(i, total_groups, 0, 95),
            scaled_percent(i + 1, total_groups, 0, 95),
        );
        let taken = taken.entry(*split).or_default();
        let mut direct = Vec::new();
        let mut renamed = Vec::new();
        for stem in stems {
            if taken.insert(stem.clone()) {
                direct.push(stem.clone());
            } else {
                let new_stem = unique_stem(stem, taken);
                taken.insert(new_stem.clone());
                renamed.push((stem.clone(), new_stem));
            }
        }

        let mut copied = ctx.copy_split(source, output_root, *split, &direct, band, &mut summary)?;
        for (stem, new_stem) in &renamed {
            ctx.cancel.check()?;
            match copy_renamed(source, output_root, *split, stem, new_stem) {
                (true, label) => {
                    copied += 1;
                    summary.images_copied += 1;
                    summary.labels_copied += usize::from(label);
                }
                (false, _) => {
                    warn!("Could not copy '{}' from {:?}", stem, source);
                    summary.skipped += 1;
                }
            }
        }
        output.add_images(*split, copied);
    }

    write_dataset_config(output_root, &plan.registry, &plan.splits)?;
    summary.outputs.push(output);
    summary.log("Balance");
    ctx.progress.report(100, "Balance complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transform::test_support::{add_image, count_images, write_names};
    use tempfile::TempDir;

    fn candidate(stem: &str, instances: &[(u32, usize)]) -> BalanceCandidate {
        BalanceCandidate {
            dataset_root: PathBuf::from("/data"),
            split: DatasetSplit::Train,
            stem: stem.to_string(),
            instances: instances.iter().copied().collect(),
        }
    }

    #[test]
    fn test_strategy_targets() {
        let current: BTreeMap<u32, usize> = [(0, 10), (1, 3), (2, 7)].into();
        assert_eq!(
            BalanceStrategy::EqualForAll(5).targets(&current),
            [(0, 5), (1, 5), (2, 5)].into()
        );
        assert_eq!(
            BalanceStrategy::ToMinimumClass.targets(&current),
            [(0, 3), (1, 3), (2, 3)].into()
        );
        let custom = BalanceStrategy::CustomPerClass([(1, 9)].into());
        assert_eq!(custom.targets(&current), [(0, 10), (1, 9), (2, 7)].into());
    }

    #[test]
    fn test_greedy_selector_stops_at_targets() {
        let candidates = vec![
            candidate("a", &[(0, 2)]),
            candidate("b", &[(0, 2)]),
            candidate("c", &[(1, 1)]),
            candidate("d", &[(0, 3), (1, 1)]),
        ];
        let targets: BTreeMap<u32, usize> = [(0, 2), (1, 2)].into();
        // d adds one useful class-1 instance but three beyond class 0's target.
        assert_eq!(GreedySelector.select(&candidates, &targets), vec![0, 2]);
    }

    #[test]
    fn test_selection_strategy_display() {
        assert_eq!(SelectionStrategy::Random.as_str(), "Random");
        assert_eq!(SelectionStrategy::FewestDetections.as_str(), "Fewest Detections");
        assert_eq!(SelectionStrategy::all().len(), 4);
    }

    #[test]
    fn test_balance_to_minimum_class() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        write_names(&src, &[(0, "person"), (1, "car")]);
        for i in 0..4 {
            add_image(&src, "train", &format!("p{}", i), Some(&[0]));
        }
        add_image(&src, "train", "c0", Some(&[1]));
        add_image(&src, "train", "bg", None);

        let mut config = BalanceConfig::new(&src, BalanceStrategy::ToMinimumClass);
        config.selection = SelectionStrategy::OldestFirst;
        let ctx = TransformContext::default();
        let plan = plan_balance(&ctx, &config, &GreedySelector).unwrap();

        assert_eq!(plan.len(), 2);
        assert!(plan.classes.iter().all(|c| c.target == 1 && c.selected == 1));
        assert_eq!(plan.classes[0].current, 4);
        let recs = get_recommendations(&plan);
        assert!(recs[0].contains("Reduce 'person' by approximately 3"));

        let out = dir.path().join("out");
        let summary = execute_balance(&ctx, &plan, &out).unwrap();
        assert_eq!(count_images(&out, "train"), 2);
        assert_eq!(summary.total_output_images(), 2);
        assert!(out.join("images/train/c0.png").exists());
        assert!(out.join("images/train/p0.png").exists());
    }

    #[test]
    fn test_secondary_dataset_fills_shortage() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("primary");
        let secondary = dir.path().join("secondary");
        add_image(&primary, "train", "a", Some(&[0]));
        add_image(&primary, "train", "b", Some(&[0]));
        add_image(&primary, "train", "c", Some(&[1]));
        add_image(&secondary, "train", "c", Some(&[1]));
        add_image(&secondary, "train", "d", Some(&[0]));

        let mut config = BalanceConfig::new(&primary, BalanceStrategy::EqualForAll(2));
        config.secondary = Some(secondary);
        config.seed = Some(1);
        let ctx = TransformContext::default();
        let plan = plan_balance(&ctx, &config, &GreedySelector).unwrap();

        let car = plan.classes.iter().find(|c| c.class_id == 1).unwrap();
        assert_eq!(car.current, 1);
        assert_eq!(car.selected, 2);
        assert_eq!(plan.len(), 4);

        let out = dir.path().join("out");
        execute_balance(&ctx, &plan, &out).unwrap();
        assert_eq!(count_images(&out, "train"), 4);
        assert!(out.join("images/train/c_1.png").exists());
    }

    #[test]
    fn test_shortage_is_reported() {
        let plan = BalancePlan {
            classes: vec![ClassBalance {
                class_id: 0,
                class_name: "person".to_string(),
                current: 1,
                target: 5,
                selected: 1,
            }],
            ..Default::default()
        };
        let recs = get_recommendations(&plan);
        assert!(recs[0].starts_with("📈 Add approximately 4"));
        assert!(recs[1].contains("Only 1 of 5"));
    }
}
