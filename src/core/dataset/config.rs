use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::split::DatasetSplit;
use crate::error::{DatasetError, Result};

/// Class id to class name.
pub type ClassRegistry = BTreeMap<u32, String>;

pub const DATASET_CONFIG_FILE: &str = "dataset.yaml";

/// The `dataset.yaml` written next to every produced dataset tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    pub nc: usize,
    pub names: ClassRegistry,
}

impl DatasetConfig {
    pub fn new(output_root: &Path, classes: &ClassRegistry, splits: &[DatasetSplit]) -> Self {
        let rel = |split: DatasetSplit| {
            splits
                .contains(&split)
                .then(|| format!("images/{}", split.as_str()))
        };
        let path = fs::canonicalize(output_root).unwrap_or_else(|_| output_root.to_path_buf());
        Self {
            path,
            train: rel(DatasetSplit::Train),
            val: rel(DatasetSplit::Val),
            test: rel(DatasetSplit::Test),
            nc: classes.len(),
            names: classes.clone(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes `dataset.yaml` into `root` and returns its path.
    pub fn write(&self, root: &Path) -> Result<PathBuf> {
        let yaml_path = root.join(DATASET_CONFIG_FILE);
        fs::write(&yaml_path, self.to_yaml()?).map_err(|e| DatasetError::io(&yaml_path, e))?;
        info!("Wrote {:?} with {} classes", yaml_path, self.nc);
        Ok(yaml_path)
    }
}

/// Regenerates the dataset config for an output tree.
pub fn write_dataset_config(
    output_root: &Path,
    classes: &ClassRegistry,
    splits: &[DatasetSplit],
) -> Result<PathBuf> {
    DatasetConfig::new(output_root, classes, splits).write(output_root)
}

/// Extracts `names` from a dataset YAML document. Both the mapping form
/// (`0: cat`) and the list form (`[cat, dog]`) are accepted.
pub fn parse_class_names(yaml: &str) -> Option<ClassRegistry> {
    let doc: serde_yaml::Value = serde_yaml::from_str(yaml).ok()?;
    let names = doc.get("names")?;

    let mut classes = ClassRegistry::new();
    if let Some(seq) = names.as_sequence() {
        for (i, name) in seq.iter().enumerate() {
            if let Some(s) = yaml_scalar_to_string(name) {
                classes.insert(i as u32, s);
            }
        }
    } else if let Some(map) = names.as_mapping() {
        for (k, v) in map {
            let id = k
                .as_u64()
                .or_else(|| k.as_str().and_then(|s| s.trim().parse().ok()));
            if let (Some(id), Some(name)) = (id, yaml_scalar_to_string(v)) {
                classes.insert(id as u32, name);
            }
        }
    } else {
        return None;
    }
    Some(classes)
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The first `*.yaml` (then `*.yml`) file directly inside `root`.
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    let mut yaml = Vec::new();
    let mut yml = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
            Some(ext) if ext == "yaml" => yaml.push(path),
            Some(ext) if ext == "yml" => yml.push(path),
            _ => {}
        }
    }
    yaml.sort();
    yml.sort();
    yaml.into_iter().chain(yml).next()
}

/// Loads the class registry of a dataset. Never fails: a missing or
/// unparsable config yields an empty registry.
pub fn load_class_registry(root: &Path) -> ClassRegistry {
    let Some(config_path) = find_config_file(root) else {
        debug!("No dataset config found in {:?}", root);
        return ClassRegistry::new();
    };

    match fs::read_to_string(&config_path) {
        Ok(content) => match parse_class_names(&content) {
            Some(classes) => {
                debug!("Loaded {} classes from {:?}", classes.len(), config_path);
                classes
            }
            None => {
                warn!("No usable 'names' in {:?}", config_path);
                ClassRegistry::new()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            ClassRegistry::new()
        }
    }
}

/// Display name for a class id, `class_<id>` when the registry lacks it.
pub fn class_name(classes: &ClassRegistry, class_id: u32) -> String {
    classes
        .get(&class_id)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", class_id))
}
