use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use super::{occupied_stems, OutputDataset, TransformContext, TransformSummary};
use crate::core::dataset::{
    images_dir, labels_dir, list_stems, resolve_image_path, resolve_label_path, Dataset,
    DatasetSplit,
};
use crate::core::operations::{dotted_extension, move_file, unique_stem};
use crate::core::progress::scaled_percent;
use crate::error::{DatasetError, Result};

/// Moves every image and label of `val` and `test` into `train`, in place.
/// Colliding stems are renamed the way merge renames them. The dataset
/// config is left as it is.
///
/// # Arguments
/// * `dataset_root` - Dataset to rewrite in place
///
/// # Returns
/// * `Ok(TransformSummary)` counting the moved files; files that failed to
///   move are counted as skipped and stay where they were
pub fn consolidate_to_train(ctx: &TransformContext<'_>, dataset_root: &Path) -> Result<TransformSummary> {
    let dataset = Dataset::open(dataset_root)?;
    let root = dataset.root();

    let train_images = images_dir(root, DatasetSplit::Train);
    let train_labels = labels_dir(root, DatasetSplit::Train);
    for dir in [&train_images, &train_labels] {
        std::fs::create_dir_all(dir).map_err(|e| DatasetError::io(dir, e))?;
    }

    let mut taken: HashSet<String> = occupied_stems(root, DatasetSplit::Train);
    let mut summary = TransformSummary::default();
    let mut output = OutputDataset::new(root);

    let sources = [DatasetSplit::Val, DatasetSplit::Test];
    for (i, split) in sources.iter().enumerate() {
        if !images_dir(root, *split).is_dir() {
            info!("Skipping {} split (not found)", split);
            continue;
        }
        let stems = list_stems(root, *split);
        ctx.progress.report(
            scaled_percent(i, sources.len(), 0, 100),
            &format!("Moving {} images from {} to train...", stems.len(), split),
        );

        let mut moved = 0;
        for stem in &stems {
            ctx.cancel.check()?;
            let Some(src_image) = resolve_image_path(root, *split, stem) else {
                summary.skipped += 1;
                continue;
            };
            let new_stem = unique_stem(stem, &taken);
            if &new_stem != stem {
                info!("Renaming {}/{} to {} to avoid a collision", split, stem, new_stem);
            }

            let dest_image = train_images.join(format!("{}{}", new_stem, dotted_extension(&src_image)));
            if let Err(e) = move_file(&src_image, &dest_image) {
                warn!("{}", e);
                summary.skipped += 1;
                continue;
            }
            taken.insert(new_stem.clone());
            moved += 1;
            summary.images_copied += 1;

            let src_label = resolve_label_path(root, *split, stem);
            if src_label.is_file() {
                match move_file(&src_label, &train_labels.join(format!("{}.txt", new_stem))) {
                    Ok(()) => summary.labels_copied += 1,
                    Err(e) => warn!("{}", e),
                }
            }
        }
        info!("Moved {} images from {} to train", moved, split);
        output.add_images(DatasetSplit::Train, moved);
    }

    summary.outputs.push(output);
    summary.log("Consolidate");
    ctx.progress.report(100, "Consolidation complete");
    Ok(summary)
}
