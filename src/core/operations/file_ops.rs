use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

/// Result type for file operations
pub type FileOpResult<T> = Result<T, FileOpError>;

/// A single file that could not be copied or moved. Callers log it and move on.
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("copy failed from {src:?} to {dest:?}: {source}")]
    CopyFailed {
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {path:?}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid file name: {0:?}")]
    InvalidName(PathBuf),
}

fn partial_path(dest: &Path) -> FileOpResult<PathBuf> {
    let name = dest
        .file_name()
        .ok_or_else(|| FileOpError::InvalidName(dest.to_path_buf()))?;
    Ok(dest.with_file_name(format!(".{}.partial", name.to_string_lossy())))
}

/// Copies `src` to `dest` through a temporary sibling and a rename, so `dest`
/// either holds the complete file or does not exist.
pub fn copy_file_atomic(src: &Path, dest: &Path) -> FileOpResult<()> {
    let tmp = partial_path(dest)?;
    let copy_failed = |source| FileOpError::CopyFailed {
        src: src.to_path_buf(),
        dest: dest.to_path_buf(),
        source,
    };

    if let Err(e) = fs::copy(src, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(copy_failed(e));
    }
    if let Err(e) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(copy_failed(e));
    }
    Ok(())
}

/// Copies unless `dest` already exists. Returns whether a copy happened.
pub fn copy_if_absent(src: &Path, dest: &Path) -> FileOpResult<bool> {
    if dest.exists() {
        debug!("Skipping existing {:?}", dest);
        return Ok(false);
    }
    copy_file_atomic(src, dest)?;
    Ok(true)
}

/// Moves a file. A plain rename is tried first; across devices this falls
/// back to copy + remove.
pub fn move_file(src: &Path, dest: &Path) -> FileOpResult<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }

    copy_file_atomic(src, dest)?;

    if let Err(e) = fs::remove_file(src) {
        error!("Failed to remove original file {:?} after copy: {}", src, e);
        // Keep exactly one copy around.
        let _ = fs::remove_file(dest);
        return Err(FileOpError::RemoveFailed {
            path: src.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

/// `base`, or `base_1`, `base_2`, ... whichever is first absent from `taken`.
pub fn unique_stem(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|counter| format!("{}_{}", base, counter))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// File name of a path as an owned string.
pub fn file_name_string(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

/// Extension of a path including the dot, or an empty string.
pub fn dotted_extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}
