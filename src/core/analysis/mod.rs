mod compare;
mod report;
mod statistics;
mod validation;

pub use compare::{compare_datasets, ClassComparison, DatasetComparison};
pub use report::{render_csv, render_html, write_csv, write_html, CSV_HEADER};
pub use statistics::{ClassStatistics, DatasetStatistics, StatisticsEngine};
pub use validation::{
    check_label_lines, CategoryPolicy, NoneVerified, ValidationCategory, ValidationChecks,
    ValidationEngine, ValidationIssue, ValidationIssueType, ValidationReport, ValidationResult,
    VerifiedStems,
};
