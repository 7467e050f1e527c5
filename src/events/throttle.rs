//! 进度事件节流器
//!
//! 按文件键控制分片进度的输出频率，避免大文件刷屏
//! 文件完成、失败等关键事件不经过节流

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 每个文件键独立计时，并发调用只锁定自己文件的条目
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 各文件上次输出时间
    last_emit: DashMap<String, Instant>,
    /// 节流间隔
    interval: Duration,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: DashMap::new(),
            interval,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查该文件是否应该输出进度
    ///
    /// 距上次输出超过节流间隔（或首次）时返回 true 并更新时间
    pub fn should_emit(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.last_emit.get_mut(key) {
            Some(mut last) => {
                if now.duration_since(*last) >= self.interval {
                    *last = now;
                    true
                } else {
                    false
                }
            }
            None => {
                self.last_emit.insert(key.to_string(), now);
                true
            }
        }
    }

    /// 强制输出（文件最后一个分片）
    pub fn force_emit(&self, key: &str) -> bool {
        self.last_emit.insert(key.to_string(), Instant::now());
        true
    }

    /// 文件结束后清理
    pub fn forget(&self, key: &str) {
        self.last_emit.remove(key);
    }

    /// 正在跟踪的文件数
    pub fn tracked(&self) -> usize {
        self.last_emit.len()
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
