//! Bulk transfer of image/label pairs between dataset trees.
//!
//! A [`BulkCopier`] first tries an external batch-copy tool (robocopy-style
//! command line, probed once per process) and drops to per-file copies for the
//! rest of the operation as soon as the tool is unavailable or a batch
//! invocation fails. Per-file copies after a tool failure skip destination
//! files that already exist, so re-copying a half-done batch never duplicates
//! or overwrites finished output.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::file_ops::{copy_file_atomic, copy_if_absent, file_name_string};
use crate::core::dataset::{
    images_dir, labels_dir, resolve_image_path, resolve_label_path, DatasetSplit,
};
use crate::core::pool::default_worker_count;
use crate::core::progress::{scaled_percent, CancelToken, ProgressReporter};
use crate::error::{DatasetError, Result};

/// Upper bound on file names per tool invocation, to stay under OS
/// command-line limits.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Settings for the external copy tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyToolConfig {
    pub enabled: bool,
    pub program: String,
    pub batch_size: usize,
    pub retries: u32,
    pub retry_wait_secs: u32,
    /// Tool thread count; `None` means all cores but two.
    pub threads: Option<usize>,
}

impl Default for CopyToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "robocopy".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            retries: 2,
            retry_wait_secs: 1,
            threads: None,
        }
    }
}

/// What a finished batch reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    /// The tool exited with a code of 8 or more. The batch is treated as done.
    CompletedWithWarnings(i32),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to run copy tool: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("copy tool terminated without an exit code")]
    Terminated,
    #[error("{failed} of {total} files failed to copy")]
    Files { failed: usize, total: usize },
}

/// Copies a batch of files, named relative to both directories.
pub trait BatchCopier: Send + Sync {
    fn name(&self) -> &str;

    fn copy_batch(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        files: &[String],
    ) -> std::result::Result<BatchOutcome, BatchError>;
}

/// Exit codes 0-7 mean success (including "nothing copied" and "extra files").
pub fn classify_exit_code(code: i32) -> BatchOutcome {
    if (0..8).contains(&code) {
        BatchOutcome::Completed
    } else {
        BatchOutcome::CompletedWithWarnings(code)
    }
}

/// Batch copier backed by an external multi-threaded copy program.
#[derive(Debug, Clone)]
pub struct ExternalToolCopier {
    program: String,
    threads: usize,
    retries: u32,
    retry_wait_secs: u32,
}

impl ExternalToolCopier {
    pub fn new(config: &CopyToolConfig) -> Self {
        Self {
            program: config.program.clone(),
            threads: config.threads.unwrap_or_else(default_worker_count).max(1),
            retries: config.retries,
            retry_wait_secs: config.retry_wait_secs,
        }
    }

    /// `source dest file... /MT:n /R:r /W:w /NFL /NDL /NJH /NJS`
    pub fn build_args(&self, src_dir: &Path, dest_dir: &Path, files: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(files.len() + 8);
        args.push(src_dir.display().to_string());
        args.push(dest_dir.display().to_string());
        args.extend(files.iter().cloned());
        args.push(format!("/MT:{}", self.threads));
        args.push(format!("/R:{}", self.retries));
        args.push(format!("/W:{}", self.retry_wait_secs));
        args.extend(["/NFL", "/NDL", "/NJH", "/NJS"].map(String::from));
        args
    }
}

impl BatchCopier for ExternalToolCopier {
    fn name(&self) -> &str {
        &self.program
    }

    fn copy_batch(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        files: &[String],
    ) -> std::result::Result<BatchOutcome, BatchError> {
        let output = Command::new(&self.program)
            .args(self.build_args(src_dir, dest_dir, files))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        let code = output.status.code().ok_or(BatchError::Terminated)?;
        let outcome = classify_exit_code(code);
        if let BatchOutcome::CompletedWithWarnings(code) = outcome {
            warn!(
                "{} batch warning (exit code {}): {}",
                self.program,
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(outcome)
    }
}

/// Direct per-file copies through the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCopier {
    /// Leave existing destination files untouched.
    pub skip_existing: bool,
}

impl FsCopier {
    fn copy_one(&self, src: &Path, dest: &Path) -> bool {
        let result = if self.skip_existing {
            copy_if_absent(src, dest).map(|_| ())
        } else {
            copy_file_atomic(src, dest)
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}

impl BatchCopier for FsCopier {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn copy_batch(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        files: &[String],
    ) -> std::result::Result<BatchOutcome, BatchError> {
        let failed = files
            .iter()
            .filter(|f| !self.copy_one(&src_dir.join(f), &dest_dir.join(f)))
            .count();
        if failed > 0 {
            return Err(BatchError::Files {
                failed,
                total: files.len(),
            });
        }
        Ok(BatchOutcome::Completed)
    }
}

static PROBE_CACHE: OnceLock<Mutex<HashMap<String, bool>>> = OnceLock::new();

/// Whether `program` can be launched. Probed once per program per process.
pub fn probe_tool(program: &str) -> bool {
    let cache = PROBE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock() {
        if let Some(available) = guard.get(program) {
            return *available;
        }
    }

    // Any exit status counts; only a failure to launch means "unavailable".
    let available = Command::new(program)
        .arg("/?")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok();
    debug!("Copy tool '{}' available: {}", program, available);

    if let Ok(mut guard) = cache.lock() {
        guard.insert(program.to_string(), available);
    }
    available
}

/// Counts from one `copy_pairs` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    /// Images present at the destination after the call.
    pub images_copied: usize,
    pub labels_copied: usize,
    /// Stems with no image file in the source.
    pub images_missing: usize,
    pub failed: usize,
    pub used_tool: bool,
    pub fell_back: bool,
}

impl CopySummary {
    pub fn absorb(&mut self, other: &CopySummary) {
        self.images_copied += other.images_copied;
        self.labels_copied += other.labels_copied;
        self.images_missing += other.images_missing;
        self.failed += other.failed;
        self.used_tool |= other.used_tool;
        self.fell_back |= other.fell_back;
    }
}

struct FileSet {
    src_dir: PathBuf,
    dest_dir: PathBuf,
    files: Vec<String>,
    is_label: bool,
}

/// Copies image/label pairs between dataset trees.
#[derive(Clone)]
pub struct BulkCopier {
    primary: Option<Arc<dyn BatchCopier>>,
    batch_size: usize,
}

impl std::fmt::Debug for BulkCopier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkCopier")
            .field("primary", &self.primary.as_ref().map(|p| p.name().to_string()))
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl BulkCopier {
    /// Uses the configured tool if it is enabled and can be launched.
    pub fn from_config(config: &CopyToolConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        if config.enabled && probe_tool(&config.program) {
            info!("Using '{}' for bulk copies", config.program);
            Self {
                primary: Some(Arc::new(ExternalToolCopier::new(config))),
                batch_size,
            }
        } else {
            if config.enabled {
                info!("'{}' not available, using standard file copy", config.program);
            }
            Self {
                primary: None,
                batch_size,
            }
        }
    }

    /// Per-file copies only.
    pub fn direct() -> Self {
        Self {
            primary: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Uses `primary` for batches, falling back to per-file copies.
    pub fn with_primary(primary: Arc<dyn BatchCopier>, batch_size: usize) -> Self {
        Self {
            primary: Some(primary),
            batch_size: batch_size.max(1),
        }
    }

    pub fn uses_tool(&self) -> bool {
        self.primary.is_some()
    }

    /// Copies each stem's image and, when present, its label from
    /// `src_root/<kind>/<split>` to `dest_root/<kind>/<split>`.
    ///
    /// Stems without an image are counted as missing. Labels are optional.
    /// Only failing to create the destination directories is fatal.
    pub fn copy_pairs(
        &self,
        src_root: &Path,
        dest_root: &Path,
        split: DatasetSplit,
        stems: &[String],
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<CopySummary> {
        let mut summary = CopySummary::default();
        if stems.is_empty() {
            return Ok(summary);
        }

        let dest_images = images_dir(dest_root, split);
        let dest_labels = labels_dir(dest_root, split);
        for dir in [&dest_images, &dest_labels] {
            std::fs::create_dir_all(dir).map_err(|e| DatasetError::io(dir, e))?;
        }

        let mut images = Vec::with_capacity(stems.len());
        let mut labels = Vec::with_capacity(stems.len());
        for stem in stems {
            match resolve_image_path(src_root, split, stem).as_deref().and_then(file_name_string) {
                Some(name) => images.push(name),
                None => {
                    warn!("No image found for '{}' in {} split of {:?}", stem, split, src_root);
                    summary.images_missing += 1;
                    continue;
                }
            }
            let label = resolve_label_path(src_root, split, stem);
            if label.is_file() {
                labels.push(format!("{}.txt", stem));
            }
        }

        let sets = [
            FileSet {
                src_dir: images_dir(src_root, split),
                dest_dir: dest_images,
                files: images,
                is_label: false,
            },
            FileSet {
                src_dir: labels_dir(src_root, split),
                dest_dir: dest_labels,
                files: labels,
                is_label: true,
            },
        ];
        let total_batches: usize = sets
            .iter()
            .map(|s| s.files.len().div_ceil(self.batch_size))
            .sum();

        if let Some(primary) = &self.primary {
            match self.run_tool(primary.as_ref(), &sets, total_batches, progress, cancel)? {
                Some(tool_summary) => {
                    summary.absorb(&tool_summary);
                    summary.used_tool = true;
                    return Ok(summary);
                }
                None => summary.fell_back = true,
            }
        }

        let fallback = FsCopier {
            skip_existing: summary.fell_back,
        };
        let mut done_batches = 0;
        for set in &sets {
            for batch in set.files.chunks(self.batch_size) {
                for file in batch {
                    cancel.check()?;
                    if fallback.copy_one(&set.src_dir.join(file), &set.dest_dir.join(file)) {
                        if set.is_label {
                            summary.labels_copied += 1;
                        } else {
                            summary.images_copied += 1;
                        }
                    } else {
                        summary.failed += 1;
                    }
                }
                done_batches += 1;
                progress.report(
                    scaled_percent(done_batches, total_batches, 0, 100),
                    &format!(
                        "Copied {} batch {}/{} ({})",
                        if set.is_label { "label" } else { "image" },
                        done_batches,
                        total_batches,
                        split
                    ),
                );
            }
        }

        debug!("Copy summary for {} split: {:?}", split, summary);
        Ok(summary)
    }

    /// Runs every batch through the tool. `Ok(None)` means the tool failed and
    /// the caller must redo the whole operation with per-file copies.
    fn run_tool(
        &self,
        primary: &dyn BatchCopier,
        sets: &[FileSet],
        total_batches: usize,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<Option<CopySummary>> {
        let mut summary = CopySummary::default();
        let mut done_batches = 0;

        for set in sets {
            let kind = if set.is_label { "label" } else { "image" };
            let set_batches = set.files.len().div_ceil(self.batch_size);
            if set_batches > 0 {
                info!(
                    "Starting {} for {} {}s in {} batches",
                    primary.name(),
                    set.files.len(),
                    kind,
                    set_batches
                );
            }

            for (idx, batch) in set.files.chunks(self.batch_size).enumerate() {
                cancel.check()?;
                match primary.copy_batch(&set.src_dir, &set.dest_dir, batch) {
                    Ok(outcome) => {
                        if let BatchOutcome::CompletedWithWarnings(code) = outcome {
                            warn!("{} {} batch {} finished with exit code {}", primary.name(), kind, idx + 1, code);
                        }
                        if set.is_label {
                            summary.labels_copied += batch.len();
                        } else {
                            summary.images_copied += batch.len();
                        }
                    }
                    Err(e) => {
                        warn!("{} failed: {}, falling back to standard file copy", primary.name(), e);
                        return Ok(None);
                    }
                }
                done_batches += 1;
                progress.report(
                    scaled_percent(done_batches, total_batches, 0, 100),
                    &format!("Completed {} batch {}/{}", kind, idx + 1, set_batches),
                );
            }
        }
        Ok(Some(summary))
    }
}
