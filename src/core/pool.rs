use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::Result;

/// All logical cores but two, at least one.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(2).max(1)
}

/// Builds the bounded pool used for per-image scans.
pub fn build_pool(workers: Option<usize>) -> Result<ThreadPool> {
    let threads = workers.unwrap_or_else(default_worker_count).max(1);
    debug!("Building worker pool with {} threads", threads);
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("dataset-worker-{}", i))
        .build()?;
    Ok(pool)
}
