//! Logging setup for the engine and its command-line front end
//!
//! This module provides:
//! - Bracketed log lines (`[TIMESTAMP] [LEVEL] [SPAN] [TARGET: FILE:LINE]: MESSAGE`)
//! - Console logging (stderr by default) plus an optional timestamped log file

mod formatter;
mod setup;

pub use formatter::BracketedFormatter;
pub use setup::{setup_logging, ConsoleStream, LoggingOptions};
