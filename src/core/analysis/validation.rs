//! Per-image label validation.
//!
//! Splits are scanned one after another; the images of a split are checked in
//! parallel on a bounded worker pool. Each worker only produces its own
//! [`ValidationResult`]; category counts are folded after the parallel phase,
//! so nothing shared is mutated in the hot path.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::core::dataset::{
    list_label_stems, list_stems, read_raw_lines, resolve_image_path, resolve_label_path,
    validate_layout, DatasetSplit, LabelLine,
};
use crate::core::pool::build_pool;
use crate::core::progress::{scaled_percent, CancelToken, ProgressReporter};
use crate::error::{DatasetError, Result};

/// Which checks run, and the minimum number of annotations per image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationChecks {
    pub missing_files: bool,
    pub empty_labels: bool,
    pub minimum_roi: bool,
    pub min_roi: usize,
    pub duplicate_classes: bool,
    pub invalid_coordinates: bool,
    /// Sequential pass for label files with no image.
    pub orphan_labels: bool,
}

impl Default for ValidationChecks {
    fn default() -> Self {
        Self {
            missing_files: true,
            empty_labels: true,
            minimum_roi: true,
            min_roi: 1,
            duplicate_classes: true,
            invalid_coordinates: true,
            orphan_labels: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationIssueType {
    MinimumRoi,
    DuplicateClass,
    InvalidCoordinates,
    MissingLabel,
    MissingImage,
    EmptyLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub issue_type: ValidationIssueType,
    pub description: String,
    pub line_number: Option<usize>,
}

impl ValidationIssue {
    fn new(issue_type: ValidationIssueType, description: impl Into<String>) -> Self {
        Self {
            issue_type,
            description: description.into(),
            line_number: None,
        }
    }

    fn at_line(mut self, line: usize) -> Self {
        self.line_number = Some(line);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationCategory {
    Fine,
    MinimumRoi,
    DuplicateClasses,
    InvalidCoordinates,
    MissingFiles,
}

impl ValidationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCategory::Fine => "Fine",
            ValidationCategory::MinimumRoi => "Minimum ROI",
            ValidationCategory::DuplicateClasses => "Duplicate Classes",
            ValidationCategory::InvalidCoordinates => "Invalid Coordinates",
            ValidationCategory::MissingFiles => "Missing Files",
        }
    }

    /// Higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            ValidationCategory::Fine => 0,
            ValidationCategory::MinimumRoi => 1,
            ValidationCategory::DuplicateClasses => 2,
            ValidationCategory::InvalidCoordinates => 3,
            ValidationCategory::MissingFiles => 4,
        }
    }
}

/// How an image with issues from several checks gets its single category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CategoryPolicy {
    /// The last check that fired wins, in check order.
    #[default]
    LastWriteWins,
    /// The most severe category wins.
    Severity,
}

struct CategoryTracker {
    policy: CategoryPolicy,
    current: ValidationCategory,
}

impl CategoryTracker {
    fn new(policy: CategoryPolicy) -> Self {
        Self {
            policy,
            current: ValidationCategory::Fine,
        }
    }

    fn record(&mut self, category: ValidationCategory) {
        match self.policy {
            CategoryPolicy::LastWriteWins => self.current = category,
            CategoryPolicy::Severity => {
                if category.severity() > self.current.severity() {
                    self.current = category;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub split: DatasetSplit,
    pub stem: String,
    pub image_path: Option<PathBuf>,
    pub label_path: PathBuf,
    pub issues: Vec<ValidationIssue>,
    pub category: ValidationCategory,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Stems already verified by a person; the per-image pass skips them.
pub trait VerifiedStems: Sync {
    fn is_verified(&self, split: DatasetSplit, stem: &str) -> bool;
}

/// Nothing is verified.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneVerified;

impl VerifiedStems for NoneVerified {
    fn is_verified(&self, _split: DatasetSplit, _stem: &str) -> bool {
        false
    }
}

impl VerifiedStems for HashSet<String> {
    fn is_verified(&self, _split: DatasetSplit, stem: &str) -> bool {
        self.contains(stem)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
    pub total_scanned: usize,
    pub skipped_verified: usize,
    pub category_counts: BTreeMap<ValidationCategory, usize>,
}

impl ValidationReport {
    pub fn invalid(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| !r.is_valid())
    }

    pub fn count(&self, category: ValidationCategory) -> usize {
        self.category_counts.get(&category).copied().unwrap_or(0)
    }

    pub fn issue_count(&self) -> usize {
        self.results.iter().map(|r| r.issues.len()).sum()
    }
}

/// Checks the lines of one label file. `lines` are the non-blank lines with
/// their 1-based line numbers.
pub fn check_label_lines(
    lines: &[(usize, String)],
    checks: &ValidationChecks,
    tracker_policy: CategoryPolicy,
) -> (Vec<ValidationIssue>, ValidationCategory) {
    let mut issues = Vec::new();
    let mut tracker = CategoryTracker::new(tracker_policy);

    if checks.empty_labels && lines.is_empty() {
        issues.push(ValidationIssue::new(
            ValidationIssueType::EmptyLabel,
            "Label file is empty",
        ));
        tracker.record(ValidationCategory::MissingFiles);
    }

    if checks.minimum_roi && lines.len() < checks.min_roi {
        issues.push(ValidationIssue::new(
            ValidationIssueType::MinimumRoi,
            format!(
                "Only {} annotations (minimum {})",
                lines.len(),
                checks.min_roi
            ),
        ));
        tracker.record(ValidationCategory::MinimumRoi);
    }

    if checks.duplicate_classes {
        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for (_, line) in lines {
            if let Some(id) = line.split_whitespace().next().and_then(|t| t.parse::<u32>().ok()) {
                *counts.entry(id).or_insert(0) += 1;
            }
        }
        let duplicated: Vec<String> = counts
            .iter()
            .filter(|(_, n)| **n > 1)
            .map(|(id, n)| format!("{} (x{})", id, n))
            .collect();
        if !duplicated.is_empty() {
            issues.push(ValidationIssue::new(
                ValidationIssueType::DuplicateClass,
                format!("Duplicate class IDs: {}", duplicated.join(", ")),
            ));
            tracker.record(ValidationCategory::DuplicateClasses);
        }
    }

    if checks.invalid_coordinates {
        for (line_no, line) in lines {
            let problem = match LabelLine::parse(line) {
                Err(e) => Some(e.to_string()),
                Ok(parsed) => parsed.first_out_of_range().map(|(pos, value)| {
                    format!(
                        "Coordinate out of range [0,1] at position {} ({}): {}",
                        pos,
                        LabelLine::FIELD_NAMES[pos - 1],
                        value
                    )
                }),
            };
            if let Some(description) = problem {
                issues.push(
                    ValidationIssue::new(ValidationIssueType::InvalidCoordinates, description)
                        .at_line(*line_no),
                );
                tracker.record(ValidationCategory::InvalidCoordinates);
            }
        }
    }

    (issues, tracker.current)
}

/// Validates every image of a dataset.
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    checks: ValidationChecks,
    policy: CategoryPolicy,
    workers: Option<usize>,
    progress_interval: usize,
}

impl ValidationEngine {
    pub fn new(checks: ValidationChecks) -> Self {
        Self {
            checks,
            policy: CategoryPolicy::default(),
            workers: None,
            progress_interval: 100,
        }
    }

    pub fn with_policy(mut self, policy: CategoryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    pub fn checks(&self) -> &ValidationChecks {
        &self.checks
    }

    pub fn validate(
        &self,
        root: &Path,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<ValidationReport> {
        self.validate_with(root, &NoneVerified, progress, cancel)
    }

    pub fn validate_with(
        &self,
        root: &Path,
        verified: &dyn VerifiedStems,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<ValidationReport> {
        if !validate_layout(root) {
            return Err(DatasetError::InvalidLayout(root.to_path_buf()));
        }
        let pool = build_pool(self.workers)?;

        let per_split: Vec<(DatasetSplit, Vec<String>)> = DatasetSplit::ALL
            .into_iter()
            .map(|split| (split, list_stems(root, split)))
            .collect();
        let total: usize = per_split.iter().map(|(_, stems)| stems.len()).sum();
        info!("Validating {} images in {:?}", total, root);
        progress.report(0, &format!("Validating {} images...", total));

        let processed = AtomicUsize::new(0);
        let mut report = ValidationReport::default();

        for (split, stems) in &per_split {
            if stems.is_empty() {
                continue;
            }
            let (to_check, skipped): (Vec<&String>, Vec<&String>) = stems
                .iter()
                .partition(|stem| !verified.is_verified(*split, stem));
            report.skipped_verified += skipped.len();
            processed.fetch_add(skipped.len(), Ordering::Relaxed);

            progress.report(
                scaled_percent(processed.load(Ordering::Relaxed), total, 0, 90),
                &format!("Validating {} split ({} images)...", split, to_check.len()),
            );

            let results: Vec<Option<ValidationResult>> = pool.install(|| {
                to_check
                    .par_iter()
                    .map(|stem| {
                        if cancel.is_cancelled() {
                            return None;
                        }
                        let result = self.check_image(root, *split, stem);
                        let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                        if done % self.progress_interval == 0 {
                            progress.report(
                                scaled_percent(done, total, 0, 90),
                                &format!("Validated {}/{} images", done, total),
                            );
                        }
                        Some(result)
                    })
                    .collect()
            });
            cancel.check()?;

            report.total_scanned += results.len();
            report.results.extend(results.into_iter().flatten());
        }

        if self.checks.orphan_labels {
            progress.report(90, "Looking for labels without images...");
            for split in DatasetSplit::ALL {
                cancel.check()?;
                report.results.extend(self.find_orphan_labels(root, split));
            }
        }

        for result in &report.results {
            *report.category_counts.entry(result.category).or_insert(0) += 1;
        }

        let invalid = report.invalid().count();
        info!(
            "Validation complete: {} scanned, {} with issues, {} issues total",
            report.total_scanned,
            invalid,
            report.issue_count()
        );
        progress.report(
            100,
            &format!(
                "Validation complete: {} of {} images have issues",
                invalid, report.total_scanned
            ),
        );
        Ok(report)
    }

    /// Checks one image. Read failures are logged and produce no issues.
    fn check_image(&self, root: &Path, split: DatasetSplit, stem: &str) -> ValidationResult {
        let label_path = resolve_label_path(root, split, stem);
        let mut result = ValidationResult {
            split,
            stem: stem.to_string(),
            image_path: resolve_image_path(root, split, stem),
            label_path,
            issues: Vec::new(),
            category: ValidationCategory::Fine,
        };

        if !result.label_path.exists() {
            if self.checks.missing_files {
                result.issues.push(ValidationIssue::new(
                    ValidationIssueType::MissingLabel,
                    format!("Missing label file: {}", result.label_path.display()),
                ));
                result.category = ValidationCategory::MissingFiles;
            }
            return result;
        }

        match read_raw_lines(&result.label_path) {
            Ok(lines) => {
                let (issues, category) = check_label_lines(&lines, &self.checks, self.policy);
                result.issues = issues;
                result.category = category;
            }
            Err(e) => {
                warn!("Failed to read {:?}: {}", result.label_path, e);
            }
        }
        result
    }

    fn find_orphan_labels(&self, root: &Path, split: DatasetSplit) -> Vec<ValidationResult> {
        let image_stems: HashSet<String> = list_stems(root, split).into_iter().collect();

        list_label_stems(root, split)
            .into_iter()
            .filter(|stem| !image_stems.contains(stem))
            .map(|stem| {
                let label_path = resolve_label_path(root, split, &stem);
                ValidationResult {
                    split,
                    issues: vec![ValidationIssue::new(
                        ValidationIssueType::MissingImage,
                        format!("No image for label {}", label_path.display()),
                    )],
                    stem,
                    image_path: None,
                    label_path,
                    category: ValidationCategory::MissingFiles,
                }
            })
            .collect()
    }
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new(ValidationChecks::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::NoProgress;
    use std::fs;
    use tempfile::TempDir;

    fn lines(text: &str) -> Vec<(usize, String)> {
        text.lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| (i + 1, l.trim().to_string()))
            .collect()
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_out_of_range_coordinate() {
        let (issues, category) = check_label_lines(
            &lines("0 1.5 0.5 0.2 0.2"),
            &ValidationChecks::default(),
            CategoryPolicy::LastWriteWins,
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, ValidationIssueType::InvalidCoordinates);
        assert_eq!(issues[0].line_number, Some(1));
        assert_eq!(category, ValidationCategory::InvalidCoordinates);
    }

    #[test]
    fn test_duplicate_classes() {
        let text = "0 0.1 0.1 0.1 0.1\n1 0.2 0.2 0.1 0.1\n0 0.3 0.3 0.1 0.1\n2 0.4 0.4 0.1 0.1\n3 0.5 0.5 0.1 0.1\n4 0.6 0.6 0.1 0.1\n";
        let (issues, category) = check_label_lines(
            &lines(text),
            &ValidationChecks::default(),
            CategoryPolicy::LastWriteWins,
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, ValidationIssueType::DuplicateClass);
        assert_eq!(category, ValidationCategory::DuplicateClasses);

        let disabled = ValidationChecks {
            duplicate_classes: false,
            ..ValidationChecks::default()
        };
        let (issues, _) = check_label_lines(&lines(text), &disabled, CategoryPolicy::LastWriteWins);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_each_bad_line_is_its_own_issue() {
        let text = "0 0.5 0.5 0.1 0.1\n1 -0.1 0.5 0.1 0.1\n\n2 0.5 0.5 0.1\n";
        let (issues, _) = check_label_lines(
            &lines(text),
            &ValidationChecks::default(),
            CategoryPolicy::LastWriteWins,
        );
        let numbers: Vec<_> = issues.iter().map(|i| i.line_number).collect();
        assert_eq!(numbers, vec![Some(2), Some(4)]);
    }

    #[test]
    fn test_category_policies() {
        let checks = ValidationChecks {
            min_roi: 3,
            ..ValidationChecks::default()
        };
        // below minimum ROI and one bad coordinate, plus a duplicate
        let text = "0 1.5 0.5 0.1 0.1\n0 0.5 0.5 0.1 0.1\n";
        let (_, last) = check_label_lines(&lines(text), &checks, CategoryPolicy::LastWriteWins);
        assert_eq!(last, ValidationCategory::InvalidCoordinates);

        // empty file: EmptyLabel then MinimumRoi fire
        let (issues, last) = check_label_lines(&[], &checks, CategoryPolicy::LastWriteWins);
        assert_eq!(issues.len(), 2);
        assert_eq!(last, ValidationCategory::MinimumRoi);
        let (_, severe) = check_label_lines(&[], &checks, CategoryPolicy::Severity);
        assert_eq!(severe, ValidationCategory::MissingFiles);
    }

    #[test]
    fn test_validate_dataset() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "images/train/good.png", "x");
        write(root, "labels/train/good.txt", "0 0.5 0.5 0.1 0.1\n");
        write(root, "images/train/nolabel.png", "x");
        write(root, "images/val/bad.jpg", "x");
        write(root, "labels/val/bad.txt", "0 1.5 0.5 0.2 0.2\n");
        write(root, "labels/val/orphan.txt", "0 0.5 0.5 0.1 0.1\n");
        write(root, "images/test/empty.png", "x");
        write(root, "labels/test/empty.txt", "\n");

        let report = ValidationEngine::default()
            .with_workers(Some(2))
            .validate(root, &NoProgress, &CancelToken::new())
            .unwrap();

        assert_eq!(report.total_scanned, 4);
        assert_eq!(report.results.len(), 5);
        assert_eq!(report.invalid().count(), 4);
        assert_eq!(report.count(ValidationCategory::Fine), 1);
        assert_eq!(report.count(ValidationCategory::InvalidCoordinates), 1);
        // missing label + orphan label
        assert_eq!(report.count(ValidationCategory::MissingFiles), 2);
        assert_eq!(report.count(ValidationCategory::MinimumRoi), 1);

        let orphan = report.results.iter().find(|r| r.stem == "orphan").unwrap();
        assert_eq!(orphan.issues[0].issue_type, ValidationIssueType::MissingImage);
    }

    #[test]
    fn test_verified_stems_are_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "images/train/a.png", "x");
        write(root, "images/train/b.png", "x");
        fs::create_dir_all(root.join("labels/train")).unwrap();

        let verified: HashSet<String> = ["a".to_string()].into();
        let report = ValidationEngine::default()
            .validate_with(root, &verified, &NoProgress, &CancelToken::new())
            .unwrap();
        assert_eq!(report.skipped_verified, 1);
        assert_eq!(report.total_scanned, 1);
        assert_eq!(report.results[0].stem, "b");
    }

    #[test]
    fn test_cancelled_validation() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "images/train/a.png", "x");
        fs::create_dir_all(root.join("labels/train")).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = ValidationEngine::default().validate(root, &NoProgress, &cancel);
        assert!(matches!(result, Err(DatasetError::Cancelled)));
    }
}
