//! 上传事件类型定义
//!
//! 编排器在运行过程中发出的全部事件，由展示层（日志、前端等）消费

use crate::uploader::summary::RunState;
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：分片进度
    Low = 0,
    /// 中优先级：规划、运行状态
    Medium = 1,
    /// 高优先级：文件完成、失败、跳过
    High = 2,
}

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 运行状态变更
    RunState { run_id: String, state: RunState },
    /// 文件规划完成
    Planned {
        file_key: String,
        total_chunks: usize,
        size: u64,
    },
    /// 分片完成
    ChunkDone {
        file_key: String,
        chunk_index: u32,
        uploaded: usize,
        total: usize,
        /// 文件进度 (0.0 - 100.0)
        percent: f64,
    },
    /// 文件上传完成
    FileDone {
        file_key: String,
        size: u64,
        elapsed_ms: u64,
    },
    /// 文件上传失败
    Failed { file_key: String, error: String },
    /// 文件被跳过（空文件、超出大小限制）
    Skipped { file_key: String, reason: String },
    /// 整体进度（只在文件成功后更新）
    OverallProgress {
        completed: usize,
        total: usize,
        percent: f64,
        message: String,
    },
}

impl UploadEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::ChunkDone { .. } => EventPriority::Low,
            UploadEvent::RunState { .. }
            | UploadEvent::Planned { .. }
            | UploadEvent::OverallProgress { .. } => EventPriority::Medium,
            UploadEvent::FileDone { .. }
            | UploadEvent::Failed { .. }
            | UploadEvent::Skipped { .. } => EventPriority::High,
        }
    }

    /// 事件所属文件键（运行级事件为 None）
    pub fn file_key(&self) -> Option<&str> {
        match self {
            UploadEvent::Planned { file_key, .. }
            | UploadEvent::ChunkDone { file_key, .. }
            | UploadEvent::FileDone { file_key, .. }
            | UploadEvent::Failed { file_key, .. }
            | UploadEvent::Skipped { file_key, .. } => Some(file_key),
            UploadEvent::RunState { .. } | UploadEvent::OverallProgress { .. } => None,
        }
    }
}
