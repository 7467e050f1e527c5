// Cloud Backup Uploader Library
// 云备份分片上传核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 会话模块
pub mod session;

// 🔥 公共模块（并发限流）
pub mod common;

// 上传后端模块（规划接口 + 分片 PUT）
pub mod backend;

// 上传事件模块
pub mod events;

// 上传编排模块
pub mod uploader;

// 导出常用类型
pub use backend::{BackendError, HttpUploadBackend, UploadBackend};
pub use common::ConcurrencyLimiter;
pub use config::AppConfig;
pub use events::{EventSink, LogReporter, UploadEvent};
pub use session::SessionContext;
pub use uploader::{
    FileRecord, FileStatus, FolderScanner, RunState, UploadError, UploadMode, UploadOrchestrator,
    UploadResult, UploadRunSummary, UploadTarget,
};
