use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::config::{load_class_registry, ClassRegistry};
use super::label::read_label_file;
use super::split::DatasetSplit;
use crate::error::{DatasetError, Result};

/// Extensions tried, in order, when resolving a stem to an image file.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "PNG", "JPG", "JPEG"];

pub fn is_image_file(path: &Path) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "png" || ext == "jpg" || ext == "jpeg"
        }
        None => false,
    }
}

pub fn images_dir(root: &Path, split: DatasetSplit) -> PathBuf {
    root.join("images").join(split.as_str())
}

pub fn labels_dir(root: &Path, split: DatasetSplit) -> PathBuf {
    root.join("labels").join(split.as_str())
}

/// True iff `root/images` and `root/labels` both exist.
pub fn validate_layout(root: &Path) -> bool {
    root.join("images").is_dir() && root.join("labels").is_dir()
}

/// Stems of every image in `root/images/<split>`, sorted. Empty when the
/// directory is absent.
pub fn list_stems(root: &Path, split: DatasetSplit) -> Vec<String> {
    let dir = images_dir(root, split);
    let Ok(entries) = fs::read_dir(&dir) else {
        debug!("No image directory at {:?}", dir);
        return Vec::new();
    };

    let stems: BTreeSet<String> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_image_file(path))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .collect();

    debug!("Found {} images in {:?}", stems.len(), dir);
    stems.into_iter().collect()
}

/// Stems of every `.txt` file in `root/labels/<split>`, sorted.
pub fn list_label_stems(root: &Path, split: DatasetSplit) -> Vec<String> {
    let dir = labels_dir(root, split);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut stems: Vec<String> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|e| e.to_string_lossy().eq_ignore_ascii_case("txt"))
                    .unwrap_or(false)
        })
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .collect();
    stems.sort();
    stems
}

/// First existing image for `stem`, trying [`IMAGE_EXTENSIONS`] in order.
pub fn resolve_image_path(root: &Path, split: DatasetSplit, stem: &str) -> Option<PathBuf> {
    let dir = images_dir(root, split);
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}

/// `root/labels/<split>/<stem>.txt`. Existence is not checked.
pub fn resolve_label_path(root: &Path, split: DatasetSplit, stem: &str) -> PathBuf {
    labels_dir(root, split).join(format!("{}.txt", stem))
}

/// Splits that have an image directory.
pub fn available_splits(root: &Path) -> Vec<DatasetSplit> {
    DatasetSplit::ALL
        .into_iter()
        .filter(|s| images_dir(root, *s).is_dir())
        .collect()
}

/// Creates `images/<split>` and `labels/<split>` under `root` for each split.
pub fn create_directory_structure(root: &Path, splits: &[DatasetSplit]) -> Result<()> {
    fs::create_dir_all(root).map_err(|e| DatasetError::io(root, e))?;
    for split in splits {
        for dir in [images_dir(root, *split), labels_dir(root, *split)] {
            fs::create_dir_all(&dir).map_err(|e| DatasetError::io(&dir, e))?;
        }
    }
    Ok(())
}

/// One image and what its label says about it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub stem: String,
    pub split: DatasetSplit,
    pub image_path: PathBuf,
    pub label_path: Option<PathBuf>,
    pub class_ids: BTreeSet<u32>,
    pub instance_count: usize,
}

/// A dataset root whose layout has been checked.
#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
}

impl Dataset {
    /// Opens a dataset root, failing before any work if the layout is wrong.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            return Err(DatasetError::MissingInput(root));
        }
        if !validate_layout(&root) {
            return Err(DatasetError::InvalidLayout(root));
        }
        info!("Opened dataset at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.root.display().to_string())
    }

    pub fn stems(&self, split: DatasetSplit) -> Vec<String> {
        list_stems(&self.root, split)
    }

    pub fn image_path(&self, split: DatasetSplit, stem: &str) -> Option<PathBuf> {
        resolve_image_path(&self.root, split, stem)
    }

    pub fn label_path(&self, split: DatasetSplit, stem: &str) -> PathBuf {
        resolve_label_path(&self.root, split, stem)
    }

    pub fn class_registry(&self) -> ClassRegistry {
        load_class_registry(&self.root)
    }

    /// Builds the record for one stem. `None` if the image itself is gone.
    pub fn record(&self, split: DatasetSplit, stem: &str) -> Option<ImageRecord> {
        let image_path = self.image_path(split, stem)?;
        let label_path = self.label_path(split, stem);
        let (label_path, class_ids, instance_count) = match read_label_file(&label_path) {
            Ok(file) => (Some(label_path), file.class_ids(), file.lines.len()),
            Err(_) => (None, BTreeSet::new(), 0),
        };
        Some(ImageRecord {
            stem: stem.to_string(),
            split,
            image_path,
            label_path,
            class_ids,
            instance_count,
        })
    }

    /// Records for every image of the given splits, split by split.
    pub fn records(&self, splits: &[DatasetSplit]) -> Vec<ImageRecord> {
        splits
            .iter()
            .flat_map(|split| {
                self.stems(*split)
                    .into_iter()
                    .filter_map(move |stem| self.record(*split, &stem))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_layout_and_stems() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        assert!(!validate_layout(root));

        touch(&root.join("images/train/b.JPG"), "x");
        touch(&root.join("images/train/a.png"), "x");
        touch(&root.join("images/train/notes.txt"), "x");
        fs::create_dir_all(root.join("labels/train")).unwrap();

        assert!(validate_layout(root));
        assert_eq!(list_stems(root, DatasetSplit::Train), vec!["a", "b"]);
        assert!(list_stems(root, DatasetSplit::Val).is_empty());
        assert_eq!(available_splits(root), vec![DatasetSplit::Train]);
    }

    #[test]
    fn test_resolve_prefers_png() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("images/val/x.jpg"), "jpg");
        touch(&root.join("images/val/x.png"), "png");

        let resolved = resolve_image_path(root, DatasetSplit::Val, "x").unwrap();
        assert_eq!(resolved.extension().unwrap(), "png");
        assert!(resolve_image_path(root, DatasetSplit::Val, "missing").is_none());
        assert_eq!(
            resolve_label_path(root, DatasetSplit::Val, "x"),
            root.join("labels/val/x.txt")
        );
    }

    #[test]
    fn test_open_rejects_bad_layout() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Dataset::open(dir.path()),
            Err(DatasetError::InvalidLayout(_))
        ));
        assert!(matches!(
            Dataset::open(dir.path().join("nope")),
            Err(DatasetError::MissingInput(_))
        ));
    }

    #[test]
    fn test_record_reads_label() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("images/train/a.png"), "x");
        touch(&root.join("labels/train/a.txt"), "1 0.5 0.5 0.1 0.1\n1 0.2 0.2 0.1 0.1\n3 0.5 0.5 0.1 0.1\n");
        touch(&root.join("images/train/b.png"), "x");

        let dataset = Dataset::open(root).unwrap();
        let records = dataset.records(&[DatasetSplit::Train]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].instance_count, 3);
        assert_eq!(records[0].class_ids.len(), 2);
        assert!(records[1].label_path.is_none());
    }
}
