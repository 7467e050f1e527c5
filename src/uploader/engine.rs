// 分片上传引擎
//
// 核心功能：
// 1. 并发上传单个文件的全部分片（每个分片独立占用限制器槽位）
// 2. 失败分片按指数退避重试，每次重试前刷新上传地址
// 3. 文件进度只随整片完成推进
//
// 并发上传策略：
// - 使用 ConcurrencyLimiter 控制全局并发数（与规划请求共享）
// - 使用 JoinSet 管理同一文件的分片任务
// - 任一分片最终失败时通过子令牌取消同文件的其余分片

use crate::backend::{TransferErrorKind, UploadBackend};
use crate::common::ConcurrencyLimiter;
use crate::config::UploadConfig;
use crate::events::{EventSink, UploadEvent};
use crate::session::SessionContext;
use crate::uploader::chunk::{ChunkAttempt, ChunkDescriptor, ChunkProgressMap, ChunkState};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::planner::{ChunkPlanner, PlanScope};
use crate::uploader::target::UploadTarget;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// =====================================================
// 重试配置
// =====================================================

/// 限流时的最短等待时间（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 计算指数退避延迟
///
/// # 延迟序列（base=100, max=5000）
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - 最大: 5000ms
///
/// base 为 0 时不等待（包括限流）
fn calculate_backoff_delay(
    retry_count: u32,
    error_kind: TransferErrorKind,
    base_ms: u64,
    max_ms: u64,
) -> u64 {
    if base_ms == 0 {
        return 0;
    }

    let factor = 2u64.saturating_pow(retry_count);
    let delay = base_ms.saturating_mul(factor).min(max_ms.max(base_ms));

    // 限流时使用更长的等待时间
    if error_kind == TransferErrorKind::RateLimited {
        delay.max(RATE_LIMIT_BACKOFF_MS)
    } else {
        delay
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 每个分片最多传输次数（含首次）
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// 第 `failed_attempts` 次失败后的等待时间
    pub fn delay(&self, failed_attempts: u32, error_kind: TransferErrorKind) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            failed_attempts.saturating_sub(1),
            error_kind,
            self.backoff_ms,
            self.max_backoff_ms,
        ))
    }
}

impl From<&UploadConfig> for RetryPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_ms: config.retry_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

// =====================================================
// 分片上传器
// =====================================================

/// 单个文件的上传上下文
#[derive(Debug, Clone)]
pub struct FileUploadContext {
    pub session: SessionContext,
    /// 规划范围，刷新地址时沿用
    pub scope: PlanScope,
    pub target: UploadTarget,
}

impl FileUploadContext {
    pub fn file_key(&self) -> String {
        self.target.file_key()
    }
}

/// 分片上传器
///
/// 克隆后共享同一个限制器和进度表
#[derive(Clone)]
pub struct ChunkUploader {
    backend: Arc<dyn UploadBackend>,
    planner: ChunkPlanner,
    limiter: ConcurrencyLimiter,
    progress: Arc<ChunkProgressMap>,
    events: EventSink,
    retry: RetryPolicy,
}

impl ChunkUploader {
    pub fn new(
        backend: Arc<dyn UploadBackend>,
        limiter: ConcurrencyLimiter,
        progress: Arc<ChunkProgressMap>,
        events: EventSink,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            planner: ChunkPlanner::new(backend.clone()),
            backend,
            limiter,
            progress,
            events,
            retry,
        }
    }

    /// 上传一个文件的全部分片
    ///
    /// 分片并发执行，每个分片占用一个限制器槽位直到成功或最终失败；
    /// 第一个失败的分片决定文件的错误，其余分片随之取消
    pub async fn upload_file(
        &self,
        ctx: Arc<FileUploadContext>,
        chunks: Vec<ChunkDescriptor>,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        let key = ctx.file_key();
        self.progress.set_total(&key, chunks.len());

        let file_cancel = cancel.child_token();
        let mut join_set = JoinSet::new();

        for descriptor in chunks {
            let uploader = self.clone();
            let ctx = ctx.clone();
            let token = file_cancel.clone();

            join_set.spawn(async move {
                uploader
                    .limiter
                    .run_cancellable(&token, uploader.upload_chunk(&ctx, descriptor, &token))
                    .await
                    .and_then(|outcome| outcome)
            });
        }

        let mut first_error: Option<UploadError> = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined
                .unwrap_or_else(|e| Err(UploadError::Io(format!("分片任务异常: {}", e))));

            if let Err(e) = outcome {
                if first_error.is_none() {
                    // 文件已失败，取消同文件的其余分片
                    file_cancel.cancel();
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(_) if cancel.is_cancelled() => Err(UploadError::Cancelled),
            Some(e) => Err(e),
        }
    }

    /// 上传单个分片（带重试和地址刷新）
    ///
    /// 只有后端明确返回成功才算完成
    pub async fn upload_chunk(
        &self,
        ctx: &FileUploadContext,
        descriptor: ChunkDescriptor,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        let key = ctx.file_key();

        debug!(
            "[{}][分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
            key,
            descriptor.chunk_index,
            descriptor.start_byte,
            descriptor.end_byte.saturating_sub(1),
            descriptor.len()
        );

        // 读取分片数据（重试时复用）
        let data = ctx
            .target
            .content
            .read_range(descriptor.start_byte, descriptor.end_byte)
            .await?;

        let mut attempt = ChunkAttempt::new(descriptor, self.retry.max_attempts);

        while attempt.begin() {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = self.backend.put_chunk(&attempt.descriptor, data.clone()) => result,
            };

            let e = match result {
                Ok(()) => {
                    attempt.succeed();
                    self.on_chunk_done(&key, attempt.descriptor.chunk_index);
                    return Ok(());
                }
                Err(e) => e,
            };

            let error_kind = e.kind();
            if attempt.fail(e.to_string()) == ChunkState::Failed {
                break;
            }

            let backoff = self.retry.delay(attempt.attempt, error_kind);
            warn!(
                "[{}][分片#{}] 上传失败 ({:?})，等待 {}ms 后刷新地址重试 ({}/{}): {}",
                key,
                attempt.descriptor.chunk_index,
                error_kind,
                backoff.as_millis(),
                attempt.attempt,
                attempt.max_attempts(),
                e
            );

            if !backoff.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let refreshed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                refreshed = self.planner.refresh(&ctx.session, &ctx.scope, &ctx.target, &attempt.descriptor) => refreshed,
            };

            match refreshed {
                Ok(replacement) => {
                    if !attempt.replace_descriptor(replacement) {
                        let reason = "替换分片与原分片位置不一致".to_string();
                        attempt.abandon(reason.clone());
                        return Err(UploadError::Refresh {
                            chunk_index: attempt.descriptor.chunk_index,
                            reason,
                        });
                    }
                }
                Err(refresh_error) => {
                    error!(
                        "[{}][分片#{}] 刷新上传地址失败，放弃重试: {}",
                        key, attempt.descriptor.chunk_index, refresh_error
                    );
                    attempt.abandon(refresh_error.to_string());
                    return Err(refresh_error);
                }
            }
        }

        let reason = attempt
            .last_error
            .clone()
            .unwrap_or_else(|| "上传失败".to_string());
        error!(
            "[{}][分片#{}] 上传失败，已达最大尝试次数 ({}): {}",
            key, attempt.descriptor.chunk_index, attempt.attempt, reason
        );

        Err(UploadError::Transfer {
            chunk_index: attempt.descriptor.chunk_index,
            attempts: attempt.attempt,
            reason,
        })
    }

    fn on_chunk_done(&self, key: &str, chunk_index: u32) {
        let Some(counters) = self.progress.mark_uploaded(key) else {
            return;
        };

        debug!(
            "[{}][分片#{}] ✓ 上传成功 ({}/{} 完成)",
            key, chunk_index, counters.uploaded, counters.total
        );

        self.events.emit(UploadEvent::ChunkDone {
            file_key: key.to_string(),
            chunk_index,
            uploaded: counters.uploaded,
            total: counters.total,
            percent: counters.percent(),
        });
    }
}
