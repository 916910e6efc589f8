use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use super::formatter::BracketedFormatter;
use crate::error::{DatasetError, Result};

/// Terminal stream for console log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleStream {
    /// Keeps stdout free for command output
    #[default]
    Stderr,
    Stdout,
}

impl ConsoleStream {
    fn make_writer(self) -> BoxMakeWriter {
        match self {
            ConsoleStream::Stderr => BoxMakeWriter::new(std::io::stderr),
            ConsoleStream::Stdout => BoxMakeWriter::new(std::io::stdout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Directory for a timestamped log file; `None` logs to the console only.
    pub log_dir: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub console: ConsoleStream,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            default_filter: "info".to_string(),
            console: ConsoleStream::default(),
        }
    }
}

/// Installs the global subscriber. Returns the log file path when one was
/// opened.
pub fn setup_logging(options: &LoggingOptions) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.default_filter))
        .map_err(|e| DatasetError::Logging(e.to_string()))?;

    let console_layer = fmt::layer()
        .event_format(BracketedFormatter::compact())
        .with_writer(options.console.make_writer());

    let (file_layer, log_path) = match &options.log_dir {
        Some(log_dir) => {
            fs::create_dir_all(log_dir).map_err(|e| DatasetError::io(log_dir, e))?;
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let log_path = log_dir.join(format!("yolo_dataset_tools_{}.log", timestamp));
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&log_path)
                .map_err(|e| DatasetError::io(&log_path, e))?;

            let layer = fmt::layer()
                .event_format(BracketedFormatter::default())
                .with_writer(Mutex::new(file))
                .with_ansi(false);
            (Some(layer), Some(log_path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| DatasetError::Logging(e.to_string()))?;

    if let Some(path) = &log_path {
        info!("Log file created at: {:?}", path);
    }
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_logs_default_to_stderr() {
        let options = LoggingOptions::default();
        assert_eq!(options.console, ConsoleStream::Stderr);
        assert_eq!(options.default_filter, "info");
        assert!(options.log_dir.is_none());
    }
}
