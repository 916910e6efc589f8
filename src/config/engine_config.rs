use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::analysis::{CategoryPolicy, StatisticsEngine, ValidationChecks, ValidationEngine};
use crate::core::operations::{BulkCopier, CopyToolConfig};
use crate::core::pool::default_worker_count;
use crate::error::{DatasetError, Result};

/// Engine settings persisted as JSON between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads for parallel scans; `None` means all cores but two
    pub worker_threads: Option<usize>,

    /// Images between progress reports during scans
    pub progress_interval: usize,

    /// External bulk-copy tool
    pub copy_tool: CopyToolConfig,

    /// Checks run by `validate`
    pub validation: ValidationChecks,

    /// How a validation result with several issue types is categorised
    pub category_policy: CategoryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            progress_interval: 100,
            copy_tool: CopyToolConfig::default(),
            validation: ValidationChecks::default(),
            category_policy: CategoryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// `<config dir>/yolo-dataset-tools/config.json` for the current user
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "yolo-dataset-tools").map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Load settings from `path`, or return defaults if the file doesn't exist or is corrupted
    pub fn load(path: &Path) -> Self {
        info!("Loading engine config from: {:?}", path);

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    info!("Successfully loaded engine config");
                    return config;
                }
                Err(e) => {
                    warn!("Failed to parse config file: {}. Using defaults.", e);
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read config file: {}. Using defaults.", e);
                } else {
                    info!("No config file found. Using defaults.");
                }
            }
        }

        Self::default()
    }

    /// Load from the default location, falling back to defaults
    pub fn load_default() -> Self {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => {
                warn!("Could not determine config directory. Using defaults.");
                Self::default()
            }
        }
    }

    /// Save settings to `path` as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DatasetError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| DatasetError::io(path, e))?;
        info!("Engine config saved to: {:?}", path);
        Ok(())
    }

    /// Effective worker count
    pub fn workers(&self) -> usize {
        self.worker_threads.unwrap_or_else(default_worker_count).max(1)
    }

    pub fn validation_engine(&self) -> ValidationEngine {
        ValidationEngine::new(self.validation.clone())
            .with_policy(self.category_policy)
            .with_workers(self.worker_threads)
            .with_progress_interval(self.progress_interval)
    }

    pub fn statistics_engine(&self) -> StatisticsEngine {
        StatisticsEngine::new()
            .with_workers(self.worker_threads)
            .with_progress_interval(self.progress_interval)
    }

    /// Probes for the copy tool when it is enabled
    pub fn bulk_copier(&self) -> BulkCopier {
        BulkCopier::from_config(&self.copy_tool)
    }
}
