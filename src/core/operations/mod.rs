mod bulk_copy;
mod file_ops;

pub use bulk_copy::{
    classify_exit_code, probe_tool, BatchCopier, BatchError, BatchOutcome, BulkCopier,
    CopySummary, CopyToolConfig, ExternalToolCopier, FsCopier, DEFAULT_BATCH_SIZE,
};
pub use file_ops::{
    copy_file_atomic, copy_if_absent, dotted_extension, file_name_string, move_file, unique_stem,
    FileOpError, FileOpResult,
};
