mod accessor;
mod config;
mod label;
mod split;

pub use accessor::{
    available_splits, create_directory_structure, images_dir, is_image_file, labels_dir,
    list_label_stems, list_stems, resolve_image_path, resolve_label_path, validate_layout,
    Dataset, ImageRecord, IMAGE_EXTENSIONS,
};
pub use config::{
    class_name, find_config_file, load_class_registry, parse_class_names, write_dataset_config,
    ClassRegistry, DatasetConfig, DATASET_CONFIG_FILE,
};
pub use label::{
    label_class_ids, read_label_file, read_raw_lines, write_label_file, LabelFile, LabelLine,
    LineError,
};
pub use split::{normalize_splits, DatasetSplit};
