use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use super::TransformContext;
use crate::core::dataset::{normalize_splits, Dataset, DatasetSplit};
use crate::core::pool::build_pool;
use crate::core::progress::scaled_percent;
use crate::error::Result;

/// Hex SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Images with byte-identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub hash: String,
    pub images: Vec<(DatasetSplit, PathBuf)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
    pub images_scanned: usize,
    pub unreadable: usize,
}

impl DuplicateReport {
    /// Images beyond the first of each group.
    pub fn redundant_images(&self) -> usize {
        self.groups.iter().map(|g| g.images.len() - 1).sum()
    }
}

/// Groups images by content hash across `splits`. Nothing is deleted.
pub fn find_duplicates(
    ctx: &TransformContext<'_>,
    dataset_root: &Path,
    splits: &[DatasetSplit],
) -> Result<DuplicateReport> {
    let dataset = Dataset::open(dataset_root)?;
    let splits = normalize_splits(splits);
    let pool = build_pool(ctx.workers)?;

    ctx.progress.report(0, "Collecting images...");
    let images: Vec<(DatasetSplit, PathBuf)> = splits
        .iter()
        .flat_map(|split| {
            dataset
                .stems(*split)
                .into_iter()
                .filter_map(|stem| dataset.image_path(*split, &stem))
                .map(move |path| (*split, path))
        })
        .collect();
    let total = images.len();
    info!("Hashing {} images", total);

    let done = AtomicUsize::new(0);
    let hashed: Vec<Option<(String, DatasetSplit, PathBuf)>> = pool.install(|| {
        images
            .par_iter()
            .filter(|_| !ctx.cancel.is_cancelled())
            .map(|(split, path)| {
                let result = match hash_file(path) {
                    Ok(hash) => Some((hash, *split, path.clone())),
                    Err(e) => {
                        warn!("Failed to hash {:?}: {}", path, e);
                        None
                    }
                };
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 100 == 0 {
                    ctx.progress
                        .report(scaled_percent(n, total, 5, 90), &format!("Hashed {}/{} images", n, total));
                }
                result
            })
            .collect()
    });
    ctx.cancel.check()?;

    ctx.progress.report(90, "Grouping duplicates...");
    let mut report = DuplicateReport {
        images_scanned: total,
        ..Default::default()
    };
    let mut by_hash: BTreeMap<String, Vec<(DatasetSplit, PathBuf)>> = BTreeMap::new();
    for entry in hashed {
        match entry {
            Some((hash, split, path)) => by_hash.entry(hash).or_default().push((split, path)),
            None => report.unreadable += 1,
        }
    }

    report.groups = by_hash
        .into_iter()
        .filter(|(_, images)| images.len() > 1)
        .map(|(hash, mut images)| {
            images.sort();
            DuplicateGroup { hash, images }
        })
        .collect();
    report.groups.sort_by(|a, b| a.images.cmp(&b.images));

    info!(
        "Found {} duplicate groups ({} redundant images) among {} images",
        report.groups.len(),
        report.redundant_images(),
        total
    );
    ctx.progress.report(100, "Duplicate scan complete");
    Ok(report)
}
