//! 并发限制器
//!
//! 限制同时执行的异步任务数（已准入未结束），超出的任务排队等待
//!
//! - 准入顺序 FIFO（tokio Semaphore 公平排队），完成顺序不保证
//! - 队列无上限，不丢弃任务
//! - 槽位由 RAII 守卫持有，成功、失败、panic 展开或 future 被丢弃时都会归还

use crate::uploader::error::{UploadError, UploadResult};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// 默认最大并发数
pub const DEFAULT_CONCURRENCY: usize = 10;

/// 并发限制器
///
/// 克隆后共享同一组槽位
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    /// 当前已准入的任务数
    active: Arc<AtomicUsize>,
    /// 历史最大准入数（诊断用）
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// 创建限制器，容量至少为 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// 准入并执行任务
    ///
    /// 任务自身的错误原样作为 `T` 返回给调用方，不影响限制器计数
    pub async fn run<F, T>(&self, task: F) -> UploadResult<T>
    where
        F: Future<Output = T>,
    {
        let _slot = self.admit().await?;
        Ok(task.await)
    }

    /// 可取消的准入并执行
    ///
    /// 等待准入期间或任务执行期间取消令牌触发时，放弃任务并返回 `Cancelled`
    pub async fn run_cancellable<F, T>(&self, cancel: &CancellationToken, task: F) -> UploadResult<T>
    where
        F: Future<Output = T>,
    {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            slot = self.admit() => slot?,
        };

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            output = task => Ok(output),
        };

        drop(slot);
        output
    }

    async fn admit(&self) -> UploadResult<LimiterSlot> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UploadError::Cancelled)?;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(LimiterSlot {
            _permit: permit,
            active: self.active.clone(),
        })
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

/// 准入槽位（RAII）
///
/// drop 时先减少计数，再归还许可
struct LimiterSlot {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for LimiterSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
