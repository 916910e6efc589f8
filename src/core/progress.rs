//! Progress sinks and cancellation for long-running operations.
//!
//! Every long operation reports through a [`ProgressReporter`]. The core never
//! stores what it reports; the sink (a UI thread, a progress bar, the log)
//! decides what to show. Reports from parallel phases can arrive out of
//! order, so sinks should simply display the latest one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::info;

use crate::error::{DatasetError, Result};

pub trait ProgressReporter: Send + Sync {
    fn report(&self, percentage: u8, status: &str);
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _percentage: u8, _status: &str) {}
}

/// Writes every report to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, percentage: u8, status: &str) {
        info!("[{:>3}%] {}", percentage, status);
    }
}

impl<F> ProgressReporter for F
where
    F: Fn(u8, &str) + Send + Sync,
{
    fn report(&self, percentage: u8, status: &str) {
        self(percentage, status)
    }
}

/// Message form of a report, for handing progress to another thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percentage: u8,
    pub status: String,
}

impl ProgressReporter for Sender<ProgressUpdate> {
    fn report(&self, percentage: u8, status: &str) {
        // The receiver may have gone away; progress is best effort.
        let _ = self.send(ProgressUpdate {
            percentage,
            status: status.to_string(),
        });
    }
}

/// Maps `done / total` into the `[start, end]` band of an overall percentage.
pub fn scaled_percent(done: usize, total: usize, start: u8, end: u8) -> u8 {
    let end = end.clamp(start, 100);
    if total == 0 {
        return end;
    }
    let span = (end - start) as usize;
    let pct = start as usize + span * done.min(total) / total;
    pct.min(100) as u8
}

/// Rescales a sub-operation's 0..=100 reports into `[start, end]` of the
/// parent operation.
pub struct Banded<'a> {
    inner: &'a dyn ProgressReporter,
    start: u8,
    end: u8,
}

impl<'a> Banded<'a> {
    pub fn new(inner: &'a dyn ProgressReporter, start: u8, end: u8) -> Self {
        Self { inner, start, end }
    }
}

impl ProgressReporter for Banded<'_> {
    fn report(&self, percentage: u8, status: &str) {
        let pct = scaled_percent(percentage as usize, 100, self.start, self.end);
        self.inner.report(pct, status);
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DatasetError::Cancelled)
        } else {
            Ok(())
        }
    }
}
