use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Errors that stop an operation.
///
/// Per-item problems (a malformed label line, one unreadable file, one failed
/// copy) never show up here. They are logged and counted by the operation that
/// hit them, and the operation keeps going.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The root is missing `images/` or `labels/`.
    #[error("not a YOLO dataset (expected images/ and labels/): {0}")]
    InvalidLayout(PathBuf),

    #[error("input does not exist: {0}")]
    MissingInput(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode settings: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to encode dataset config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to set up logging: {0}")]
    Logging(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl DatasetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.into(),
            source,
        }
    }
}
