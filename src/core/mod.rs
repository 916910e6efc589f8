pub mod analysis;
pub mod dataset;
pub mod operations;
pub mod pool;
pub mod progress;
pub mod transform;

pub use analysis::*;
pub use dataset::*;
pub use operations::*;
pub use progress::{CancelToken, LogProgress, NoProgress, ProgressReporter, ProgressUpdate};
pub use transform::*;
