use std::fs;
use std::path::Path;
use tempfile::TempDir;

use yolo_dataset_tools::core::analysis::{StatisticsEngine, ValidationCategory, ValidationChecks, ValidationEngine};
use yolo_dataset_tools::core::dataset::{load_class_registry, list_stems, DatasetSplit};
use yolo_dataset_tools::core::progress::{CancelToken, NoProgress};
use yolo_dataset_tools::core::transform::{merge_datasets, split_into_parts, TransformContext};

fn make_dataset(root: &Path, names: &str, images: &[(&str, &str, &str)]) {
    fs::create_dir_all(root).unwrap();
    fs::write(root.join("dataset.yaml"), names).unwrap();
    for (split, stem, label) in images {
        let images_dir = root.join("images").join(split);
        let labels_dir = root.join("labels").join(split);
        fs::create_dir_all(&images_dir).unwrap();
        fs::create_dir_all(&labels_dir).unwrap();
        fs::write(images_dir.join(format!("{}.jpg", stem)), format!("{}-{}", split, stem)).unwrap();
        if !label.is_empty() {
            fs::write(labels_dir.join(format!("{}.txt", stem)), label).unwrap();
        }
    }
}

#[test]
fn test_merge_split_validate_stats() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    make_dataset(
        &a,
        "names:\n  0: ct\n  1: t\n",
        &[
            ("train", "frame_001", "0 0.5 0.5 0.1 0.1\n"),
            ("train", "frame_002", "1 0.5 0.5 0.1 0.1\n0 0.2 0.2 0.1 0.1\n"),
            ("val", "frame_003", "0 0.5 0.5 0.1 0.1\n"),
        ],
    );
    make_dataset(
        &b,
        "names:\n  0: ct\n  1: t\n  2: hostage\n",
        &[
            ("train", "frame_001", "2 0.5 0.5 0.1 0.1\n"),
            ("train", "frame_009", "0 0.4 0.4 0.2 0.2\n"),
            ("val", "frame_010", ""),
        ],
    );

    let ctx = TransformContext::default();
    let merged = dir.path().join("merged");
    let summary = merge_datasets(&ctx, &[a, b], &merged, &[]).unwrap();
    assert_eq!(summary.images_copied, 6);
    assert_eq!(summary.labels_copied, 5);
    assert_eq!(list_stems(&merged, DatasetSplit::Train).len(), 4);
    assert_eq!(list_stems(&merged, DatasetSplit::Val).len(), 2);

    let registry = load_class_registry(&merged);
    assert_eq!(registry.len(), 3);
    assert_eq!(registry[&2], "hostage");

    let parts_root = dir.path().join("parts");
    let split = split_into_parts(&ctx, &merged, &parts_root, 2, &[], Some(7)).unwrap();
    assert_eq!(split.outputs.len(), 2);
    assert_eq!(split.total_output_images(), 6);
    let part_train: usize = ["part_1", "part_2"]
        .iter()
        .map(|p| list_stems(&parts_root.join(p), DatasetSplit::Train).len())
        .sum();
    assert_eq!(part_train, 4);

    let report = ValidationEngine::new(ValidationChecks::default())
        .validate(&merged, &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(report.total_scanned, 6);
    let invalid: Vec<_> = report.invalid().collect();
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].stem, "frame_010");
    assert_eq!(invalid[0].category, ValidationCategory::MissingFiles);

    let stats = StatisticsEngine::new()
        .analyze(&merged, &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(stats.total_images, 6);
    assert_eq!(stats.train_images, 4);
    assert_eq!(stats.val_images, 2);
    assert_eq!(stats.total_annotations, 6);
    assert_eq!(stats.images_without_labels, 1);
    assert_eq!(stats.class_stats[&0].instance_count, 4);
    assert_eq!(stats.class_stats[&1].image_count, 1);
}
