//! Transformation and validation engine for YOLO object-detection datasets.
//!
//! A dataset is a directory with `images/<split>` and `labels/<split>`
//! subfolders plus a `dataset.yaml` naming the classes. The engine merges,
//! splits, filters, balances, deduplicates, consolidates and validates such
//! trees, and computes statistics over them.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;

pub use crate::config::EngineConfig;
pub use crate::error::{DatasetError, Result};
