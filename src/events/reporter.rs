//! 日志展示适配器
//!
//! 消费上传事件流并通过 tracing 输出
//!
//! 只有低优先级事件（分片进度）按文件节流，其余事件全部输出

use crate::events::{EventPriority, ProgressThrottler, UploadEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 事件统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    /// 收到的事件总数
    pub received: usize,
    /// 实际输出的分片进度行数
    pub progress_lines: usize,
    /// 被节流丢弃的分片进度数
    pub throttled: usize,
}

/// 日志展示适配器
#[derive(Debug, Default)]
pub struct LogReporter {
    throttler: ProgressThrottler,
}

impl LogReporter {
    pub fn new(throttler: ProgressThrottler) -> Self {
        Self { throttler }
    }

    /// 持续消费事件直到发送端全部关闭
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<UploadEvent>) -> ReporterStats {
        let mut stats = ReporterStats::default();
        while let Some(event) = rx.recv().await {
            self.handle(&event, &mut stats);
        }
        debug!("事件流结束: {:?}", stats);
        stats
    }

    /// 低优先级事件是否通过节流；文件的最后一个分片总是输出
    fn admit(&self, event: &UploadEvent) -> bool {
        if event.priority() > EventPriority::Low {
            return true;
        }
        let Some(file_key) = event.file_key() else {
            return true;
        };
        match event {
            UploadEvent::ChunkDone {
                uploaded, total, ..
            } if uploaded >= total => self.throttler.force_emit(file_key),
            _ => self.throttler.should_emit(file_key),
        }
    }

    fn handle(&self, event: &UploadEvent, stats: &mut ReporterStats) {
        stats.received += 1;

        if !self.admit(event) {
            stats.throttled += 1;
            return;
        }
        // 高优先级事件是文件的终态，节流记录不再需要
        if event.priority() == EventPriority::High {
            if let Some(file_key) = event.file_key() {
                self.throttler.forget(file_key);
            }
        }

        match event {
            UploadEvent::RunState { run_id, state } => {
                info!("运行 {} 状态: {:?}", run_id, state);
            }
            UploadEvent::Planned {
                file_key,
                total_chunks,
                size,
            } => {
                debug!("{} 规划完成: {} 个分片, {} bytes", file_key, total_chunks, size);
            }
            UploadEvent::ChunkDone {
                file_key,
                chunk_index,
                uploaded,
                total,
                percent,
            } => {
                stats.progress_lines += 1;
                info!(
                    "{} 分片 #{} 完成 ({}/{}, {:.1}%)",
                    file_key, chunk_index, uploaded, total, percent
                );
            }
            UploadEvent::FileDone {
                file_key,
                size,
                elapsed_ms,
            } => {
                info!("✓ {} 上传完成 ({} bytes, 耗时 {}ms)", file_key, size, elapsed_ms);
            }
            UploadEvent::Failed { file_key, error } => {
                warn!("✗ {} 上传失败: {}", file_key, error);
            }
            UploadEvent::Skipped { file_key, reason } => {
                info!("跳过 {}: {}", file_key, reason);
            }
            UploadEvent::OverallProgress {
                completed,
                total,
                percent,
                message,
            } => {
                info!("整体进度 {}/{} ({:.1}%) {}", completed, total, percent, message);
            }
        }
    }
}
