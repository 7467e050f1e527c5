// 上传编排器
//
// 一次运行：Idle → Preparing → Uploading → { Completed | PartiallyFailed }
//
// - 单文件模式：每个文件规划时占用一个限制器槽位，规划完成即释放；
//   之后每个分片各自占用槽位。所有文件并发执行
// - 文件夹模式：按批规划，批与批顺序执行；批内文件并发，文件内分片并发
// - 规划请求、分片传输共享同一个限制器，同时进行的操作数不超过上限
// - 单个文件的任何失败都在文件边界转为失败记录，不影响其他文件

use crate::backend::UploadBackend;
use crate::common::ConcurrencyLimiter;
use crate::config::UploadConfig;
use crate::events::{EventSink, UploadEvent};
use crate::session::SessionContext;
use crate::uploader::chunk::{ChunkDescriptor, ChunkProgressMap};
use crate::uploader::engine::{ChunkUploader, FileUploadContext, RetryPolicy};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::folder::{format_bytes, partition_batches, ScanOutcome};
use crate::uploader::planner::{ChunkPlanner, PlanScope};
use crate::uploader::summary::{
    FileRecord, ResultAggregator, RunState, UploadMode, UploadRunSummary,
};
use crate::uploader::target::{dedupe_file_keys, join_remote_path, sanitize_name, UploadTarget};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 一次运行的共享状态
struct RunShared {
    run_id: String,
    /// 需要上传的文件总数（不含跳过）
    total: usize,
    aggregator: ResultAggregator,
}

impl RunShared {
    fn new(run_id: String, total: usize) -> Self {
        Self {
            run_id,
            total,
            aggregator: ResultAggregator::new(),
        }
    }
}

/// 文件的规划来源
enum FilePlan {
    /// 需要自己发起规划请求（单文件模式、重试）
    Pending,
    /// 已由批量规划得到
    Ready(UploadResult<Vec<ChunkDescriptor>>),
}

/// 上传编排器
#[derive(Clone)]
pub struct UploadOrchestrator {
    backend: Arc<dyn UploadBackend>,
    planner: ChunkPlanner,
    uploader: ChunkUploader,
    limiter: ConcurrencyLimiter,
    progress: Arc<ChunkProgressMap>,
    events: EventSink,
    retry: RetryPolicy,
    batch_size: usize,
}

impl UploadOrchestrator {
    pub fn new(backend: Arc<dyn UploadBackend>, config: &UploadConfig) -> Self {
        let limiter = ConcurrencyLimiter::new(config.max_concurrent);
        let progress = Arc::new(ChunkProgressMap::new());
        let events = EventSink::disabled();
        let retry = RetryPolicy::from(config);

        Self {
            planner: ChunkPlanner::new(backend.clone()),
            uploader: ChunkUploader::new(
                backend.clone(),
                limiter.clone(),
                progress.clone(),
                events.clone(),
                retry,
            ),
            backend,
            limiter,
            progress,
            events,
            retry,
            batch_size: config.batch_size.max(1),
        }
    }

    /// 设置事件接收方
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<UploadEvent>) -> Self {
        self.events = EventSink::new(sender);
        self.uploader = ChunkUploader::new(
            self.backend.clone(),
            self.limiter.clone(),
            self.progress.clone(),
            self.events.clone(),
            self.retry,
        );
        self
    }

    #[cfg(test)]
    fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    #[cfg(test)]
    fn progress(&self) -> &Arc<ChunkProgressMap> {
        &self.progress
    }

    // =====================================================
    // 单文件模式
    // =====================================================

    /// 上传一组文件到目标目录
    ///
    /// 部分文件失败不会返回错误，结果记录在汇总中；
    /// 只有前置条件不满足或被取消时返回 Err
    pub async fn upload_files(
        &self,
        session: &SessionContext,
        destination: &str,
        targets: Vec<UploadTarget>,
        cancel: &CancellationToken,
    ) -> UploadResult<UploadRunSummary> {
        validate_session(session)?;
        let destination = validate_destination(destination)?;
        if targets.is_empty() {
            return Err(UploadError::Precondition("没有选择要上传的文件".to_string()));
        }
        if let Some(empty) = targets.iter().find(|t| t.size == 0) {
            return Err(UploadError::Precondition(format!(
                "文件大小无效（0 字节）: {}",
                empty.name
            )));
        }

        // 前置条件全部通过后才进入 Preparing，拒绝的运行不产生任何状态事件
        let run_id = Uuid::new_v4().to_string();
        self.emit_state(&run_id, RunState::Preparing);

        let mut targets = targets;
        dedupe_file_keys(&mut targets, &mut HashSet::new());

        info!(
            "开始上传 {} 个文件到 {} (run_id={})",
            targets.len(),
            destination,
            run_id
        );
        self.emit_state(&run_id, RunState::Uploading);

        let run = Arc::new(RunShared::new(run_id, targets.len()));
        let scope = PlanScope::Single {
            folder_name: destination.clone(),
        };

        let mut join_set = JoinSet::new();
        for target in targets {
            let ctx = Arc::new(FileUploadContext {
                session: session.clone(),
                scope: scope.clone(),
                target,
            });
            self.spawn_file(&mut join_set, ctx, FilePlan::Pending, &run, cancel);
        }
        drain_file_tasks(&mut join_set, cancel).await?;

        Ok(self.finish_run(run, UploadMode::Single, destination))
    }

    // =====================================================
    // 文件夹模式
    // =====================================================

    /// 上传文件夹（目标目录下创建同名子目录）
    pub async fn upload_folder(
        &self,
        session: &SessionContext,
        destination: &str,
        folder_name: &str,
        targets: Vec<UploadTarget>,
        cancel: &CancellationToken,
    ) -> UploadResult<UploadRunSummary> {
        self.run_folder(session, destination, folder_name, targets, Vec::new(), cancel)
            .await
    }

    /// 上传扫描结果，超出大小限制的文件记为跳过
    pub async fn upload_scanned(
        &self,
        session: &SessionContext,
        destination: &str,
        outcome: ScanOutcome,
        cancel: &CancellationToken,
    ) -> UploadResult<UploadRunSummary> {
        let ScanOutcome {
            folder_name,
            mut targets,
            mut oversized,
        } = outcome;

        // 超限文件的记录与待上传文件共用一组文件键
        let mut taken = HashSet::new();
        dedupe_file_keys(&mut targets, &mut taken);
        dedupe_file_keys(&mut oversized, &mut taken);

        let skipped = oversized
            .iter()
            .map(|t| {
                FileRecord::skipped(
                    &t.sanitized_name,
                    &t.relative_path,
                    t.size,
                    format!("超出大小限制 ({})", format_bytes(t.size)),
                )
            })
            .collect();

        self.run_folder(
            session,
            destination,
            &folder_name,
            targets,
            skipped,
            cancel,
        )
        .await
    }

    async fn run_folder(
        &self,
        session: &SessionContext,
        destination: &str,
        folder_name: &str,
        targets: Vec<UploadTarget>,
        pre_skipped: Vec<FileRecord>,
        cancel: &CancellationToken,
    ) -> UploadResult<UploadRunSummary> {
        validate_session(session)?;
        let destination = validate_destination(destination)?;
        if folder_name.trim().is_empty() {
            return Err(UploadError::Precondition("缺少文件夹名称".to_string()));
        }
        if targets.is_empty() && pre_skipped.is_empty() {
            return Err(UploadError::Precondition("文件夹中没有文件".to_string()));
        }
        if !targets.iter().any(|t| t.size > 0) {
            return Err(UploadError::Precondition(
                "文件夹中没有可上传的非空文件".to_string(),
            ));
        }

        let run_id = Uuid::new_v4().to_string();
        self.emit_state(&run_id, RunState::Preparing);

        // 同一批次内按文件键重新分组，键必须唯一
        let mut targets = targets;
        let mut taken: HashSet<String> = pre_skipped.iter().map(FileRecord::file_key).collect();
        dedupe_file_keys(&mut targets, &mut taken);

        // 空文件在准入前记为跳过
        let (targets, empty): (Vec<UploadTarget>, Vec<UploadTarget>) =
            targets.into_iter().partition(|t| t.size > 0);

        let base_folder = join_remote_path(&destination, &sanitize_name(folder_name));
        let run = Arc::new(RunShared::new(run_id, targets.len()));

        let skipped = pre_skipped.into_iter().chain(
            empty
                .iter()
                .map(|t| FileRecord::skipped(&t.sanitized_name, &t.relative_path, 0, "空文件")),
        );
        for record in skipped {
            self.events.emit(UploadEvent::Skipped {
                file_key: record.file_key(),
                reason: record.error.clone().unwrap_or_default(),
            });
            run.aggregator.push(record);
        }

        let batches = partition_batches(targets, self.batch_size);
        info!(
            "开始上传文件夹 {} 到 {}: {} 个文件, {} 批 (run_id={})",
            folder_name,
            base_folder,
            run.total,
            batches.len(),
            run.run_id
        );
        self.emit_state(&run.run_id, RunState::Uploading);

        let scope = PlanScope::Batch {
            base_folder_name: base_folder.clone(),
        };

        for (batch_no, batch) in batches.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let planned = self
                .limiter
                .run_cancellable(cancel, self.planner.plan_batch(session, &base_folder, &batch))
                .await
                .and_then(|groups| groups);

            let mut groups = match planned {
                Ok(groups) => groups,
                Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
                Err(e) => {
                    error!("第 {} 批规划失败，整批标记为失败: {}", batch_no + 1, e);
                    for target in &batch {
                        self.record_failure(target, 0, &e, &run);
                    }
                    continue;
                }
            };

            let mut join_set = JoinSet::new();
            for target in batch {
                let plan = ChunkPlanner::take_file_plan(&mut groups, &target);
                let ctx = Arc::new(FileUploadContext {
                    session: session.clone(),
                    scope: scope.clone(),
                    target,
                });
                self.spawn_file(&mut join_set, ctx, FilePlan::Ready(plan), &run, cancel);
            }
            drain_file_tasks(&mut join_set, cancel).await?;
        }

        Ok(self.finish_run(run, UploadMode::Folder, base_folder))
    }

    // =====================================================
    // 单条记录重试
    // =====================================================

    /// 重新上传汇总中的一条失败记录
    ///
    /// 前置条件与新运行相同；只规划这一个文件（文件夹模式下为单文件批次），
    /// 完成后原地替换记录并重新计算汇总，其他记录不变。
    /// 按 `target.file_key()` 查找记录；运行中被改名的文件需先
    /// `with_sanitized_name(&record.name)`
    pub async fn retry_record(
        &self,
        session: &SessionContext,
        summary: &mut UploadRunSummary,
        target: UploadTarget,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        validate_session(session)?;
        let destination = validate_destination(&summary.destination)?;
        if target.size == 0 {
            return Err(UploadError::Precondition(format!(
                "文件大小无效（0 字节）: {}",
                target.name
            )));
        }
        if summary
            .find_failed(&target.sanitized_name, &target.relative_path)
            .is_none()
        {
            return Err(UploadError::Precondition(format!(
                "汇总中没有该文件的失败记录: {}",
                target.file_key()
            )));
        }

        let scope = match summary.mode {
            UploadMode::Single => PlanScope::Single {
                folder_name: destination,
            },
            UploadMode::Folder => PlanScope::Batch {
                base_folder_name: destination,
            },
        };

        info!("重试失败文件: {} (run_id={})", target.file_key(), summary.run_id);
        self.emit_state(&summary.run_id, RunState::Uploading);

        let run = Arc::new(RunShared::new(summary.run_id.clone(), 1));
        let ctx = Arc::new(FileUploadContext {
            session: session.clone(),
            scope,
            target,
        });

        let mut join_set = JoinSet::new();
        self.spawn_file(&mut join_set, ctx, FilePlan::Pending, &run, cancel);
        drain_file_tasks(&mut join_set, cancel).await?;

        for record in run.aggregator.snapshot() {
            summary.replace_record(record);
        }

        self.emit_state(&summary.run_id, summary.state);
        info!("重试完成: {}", summary.message);
        Ok(())
    }

    // =====================================================
    // 文件任务
    // =====================================================

    fn spawn_file(
        &self,
        join_set: &mut JoinSet<UploadResult<()>>,
        ctx: Arc<FileUploadContext>,
        plan: FilePlan,
        run: &Arc<RunShared>,
        cancel: &CancellationToken,
    ) {
        let this = self.clone();
        let run = run.clone();
        let cancel = cancel.clone();

        join_set.spawn(async move {
            let started = Instant::now();
            let work = this.upload_one_file(ctx.clone(), plan, &cancel);
            let outcome = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(UploadError::Io("上传任务异常退出".to_string())));
            this.finish_file(&ctx, started, outcome, &run)
        });
    }

    async fn upload_one_file(
        &self,
        ctx: Arc<FileUploadContext>,
        plan: FilePlan,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        let chunks = match plan {
            // 规划请求占用一个槽位，完成后立即释放，分片各自重新准入
            FilePlan::Pending => self
                .limiter
                .run_cancellable(
                    cancel,
                    self.planner
                        .plan_in_scope(&ctx.session, &ctx.scope, &ctx.target),
                )
                .await
                .and_then(|planned| planned)?,
            FilePlan::Ready(planned) => planned?,
        };

        self.events.emit(UploadEvent::Planned {
            file_key: ctx.file_key(),
            total_chunks: chunks.len(),
            size: ctx.target.size,
        });

        self.uploader.upload_file(ctx, chunks, cancel).await
    }

    /// 文件到达终态：写入记录、发出事件并清除分片计数
    ///
    /// 取消不产生记录，原样返回
    fn finish_file(
        &self,
        ctx: &FileUploadContext,
        started: Instant,
        outcome: UploadResult<()>,
        run: &RunShared,
    ) -> UploadResult<()> {
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = self.record_outcome(ctx, elapsed_ms, outcome, run);
        // 文件已到终态，分片计数不再需要
        self.progress.remove(&ctx.file_key());
        result
    }

    fn record_outcome(
        &self,
        ctx: &FileUploadContext,
        elapsed_ms: u64,
        outcome: UploadResult<()>,
        run: &RunShared,
    ) -> UploadResult<()> {
        let target = &ctx.target;

        match outcome {
            Ok(()) => {
                let completed = run.aggregator.push(FileRecord::uploaded(
                    &target.sanitized_name,
                    &target.relative_path,
                    target.size,
                    elapsed_ms,
                ));
                info!(
                    "✓ 文件上传完成: {} ({}, 耗时 {}ms)",
                    ctx.file_key(),
                    format_bytes(target.size),
                    elapsed_ms
                );

                self.events.emit(UploadEvent::FileDone {
                    file_key: ctx.file_key(),
                    size: target.size,
                    elapsed_ms,
                });
                self.events.emit(UploadEvent::OverallProgress {
                    completed,
                    total: run.total,
                    percent: percent(completed, run.total),
                    message: format!("已上传 {}/{} 个文件", completed, run.total),
                });
                Ok(())
            }
            Err(UploadError::Cancelled) => Err(UploadError::Cancelled),
            Err(e) => {
                self.record_failure(target, elapsed_ms, &e, run);
                Ok(())
            }
        }
    }

    fn record_failure(
        &self,
        target: &UploadTarget,
        elapsed_ms: u64,
        error: &UploadError,
        run: &RunShared,
    ) {
        warn!("✗ 文件上传失败: {}: {}", target.file_key(), error);
        run.aggregator.push(FileRecord::failed(
            &target.sanitized_name,
            &target.relative_path,
            target.size,
            elapsed_ms,
            error.to_string(),
        ));
        self.events.emit(UploadEvent::Failed {
            file_key: target.file_key(),
            error: error.to_string(),
        });
    }

    fn finish_run(
        &self,
        run: Arc<RunShared>,
        mode: UploadMode,
        destination: String,
    ) -> UploadRunSummary {
        let summary = run.aggregator.summarize(&run.run_id, mode, destination);

        self.emit_state(&summary.run_id, summary.state);
        if summary.is_success() {
            info!("{} (run_id={})", summary.message, summary.run_id);
        } else {
            warn!(
                "{} (run_id={}), 失败原因: {:?}",
                summary.message, summary.run_id, summary.failure_reasons
            );
        }
        summary
    }

    fn emit_state(&self, run_id: &str, state: RunState) {
        self.events.emit(UploadEvent::RunState {
            run_id: run_id.to_string(),
            state,
        });
    }
}

/// 等待一组文件任务结束，任一任务被取消时整体返回 Cancelled
async fn drain_file_tasks(
    join_set: &mut JoinSet<UploadResult<()>>,
    cancel: &CancellationToken,
) -> UploadResult<()> {
    let mut cancelled = false;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(_)) => cancelled = true,
            Err(e) => error!("文件任务异常: {}", e),
        }
    }

    if cancelled || cancel.is_cancelled() {
        warn!("上传已取消");
        return Err(UploadError::Cancelled);
    }
    Ok(())
}

fn validate_session(session: &SessionContext) -> UploadResult<()> {
    if session.is_usable() {
        Ok(())
    } else {
        Err(UploadError::Precondition("会话缺少用户名或邮箱".to_string()))
    }
}

fn validate_destination(destination: &str) -> UploadResult<String> {
    let trimmed = destination.trim();
    if trimmed.is_empty() {
        return Err(UploadError::Precondition("没有选择目标目录".to_string()));
    }
    Ok(trimmed.to_string())
}

fn percent(completed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    }
}
