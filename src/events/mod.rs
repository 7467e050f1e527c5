//! 事件模块
//!
//! 编排器通过无界 mpsc 通道发出事件，发送永不阻塞；
//! 接收端关闭后事件直接丢弃，不影响上传

mod reporter;
mod throttle;
mod types;

pub use reporter::{LogReporter, ReporterStats};
pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
pub use types::{EventPriority, UploadEvent};

use tokio::sync::mpsc;

/// 事件发送端
///
/// 未配置接收方时所有事件被忽略
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<UploadEvent>>,
}

impl EventSink {
    pub fn new(sender: mpsc::UnboundedSender<UploadEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// 不发送任何事件
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: UploadEvent) {
        if let Some(sender) = &self.sender {
            // 接收端已关闭时忽略
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        drop(rx);
        sink.emit(UploadEvent::Failed {
            file_key: "a|.".to_string(),
            error: "x".to_string(),
        });

        EventSink::disabled().emit(UploadEvent::Failed {
            file_key: "a|.".to_string(),
            error: "x".to_string(),
        });
    }

    #[test]
    fn test_sink_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.emit(UploadEvent::Skipped {
            file_key: "e|.".to_string(),
            reason: "空文件".to_string(),
        });
        assert!(matches!(rx.try_recv(), Ok(UploadEvent::Skipped { .. })));
    }
}
