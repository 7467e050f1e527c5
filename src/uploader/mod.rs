// 上传编排模块
//
// - target: 上传目标与文件名清理
// - folder: 本地文件夹扫描与分批
// - chunk: 分片描述、进度计数、重试状态机
// - planner: 向后端规划分片上传地址
// - engine: 分片上传（重试 + 地址刷新）
// - orchestrator: 单文件 / 文件夹运行编排
// - summary: 结果记录与汇总

pub mod chunk;
pub mod engine;
pub mod error;
pub mod folder;
pub mod orchestrator;
pub mod planner;
pub mod summary;
pub mod target;

#[cfg(test)]
pub(crate) mod mock;

pub use chunk::{
    calculate_chunk_ranges, validate_tiling, ChunkAttempt, ChunkCounters, ChunkDescriptor,
    ChunkProgressMap, ChunkState,
};
pub use engine::{ChunkUploader, FileUploadContext, RetryPolicy};
pub use error::{UploadError, UploadResult};
pub use folder::{format_bytes, partition_batches, FolderScanner, ScanOptions, ScanOutcome};
pub use orchestrator::UploadOrchestrator;
pub use planner::{ChunkPlanner, PlanScope};
pub use summary::{
    summary_message, FileRecord, FileStatus, ResultAggregator, RunState, UploadMode,
    UploadRunSummary,
};
pub use target::{
    dedupe_file_keys, file_key, join_remote_path, normalize_relative_path, sanitize_name,
    ContentSource, UploadTarget, FLAT_RELATIVE_PATH,
};
