// 测试用上传后端
//
// 按固定分片大小规划，记录所有请求，并可按文件名注入失败

use crate::backend::{
    BackendError, PlanErrorMessage, PlanResponse, PlanUploadBatchRequest, PlanUploadRequest,
    RawDestination, UploadBackend,
};
use crate::session::SessionContext;
use crate::uploader::chunk::{calculate_chunk_ranges, ChunkDescriptor};
use crate::uploader::target::file_key;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 一次 PUT 记录
#[derive(Debug, Clone)]
pub struct PutRecord {
    pub file_key: String,
    pub chunk_index: u32,
    pub start_byte: u64,
    pub end_byte: u64,
    pub total_size: u64,
    pub upload_url: String,
    pub body: Vec<u8>,
    pub ok: bool,
}

#[derive(Debug, Default)]
struct MockState {
    plan_calls: usize,
    batch_sizes: Vec<usize>,
    /// 每个文件被规划的次数
    plan_versions: HashMap<String, usize>,
    /// 每个文件已注入的失败次数
    injected_failures: HashMap<String, u32>,
    puts: Vec<PutRecord>,
}

#[derive(Debug)]
pub struct MockBackend {
    chunk_size: u64,
    put_delay: Duration,
    fail_status: u16,
    always_fail: HashSet<String>,
    fail_first: HashMap<String, u32>,
    fail_planning: HashSet<String>,
    /// 返回 500 的批量规划请求序号（从 0 开始）
    fail_batch_calls: HashSet<usize>,
    shift_on_replan: bool,
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockBackend {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            put_delay: Duration::ZERO,
            fail_status: 503,
            always_fail: HashSet::new(),
            fail_first: HashMap::new(),
            fail_planning: HashSet::new(),
            fail_batch_calls: HashSet::new(),
            shift_on_replan: false,
            state: Mutex::new(MockState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn with_fail_status(mut self, status: u16) -> Self {
        self.fail_status = status;
        self
    }

    /// 该文件的所有 PUT 都失败
    pub fn always_fail(mut self, name: &str) -> Self {
        self.always_fail.insert(name.to_string());
        self
    }

    /// 该文件的前 n 次 PUT 失败
    pub fn fail_first(mut self, name: &str, times: u32) -> Self {
        self.fail_first.insert(name.to_string(), times);
        self
    }

    /// 该文件规划失败（单文件返回 500，批量中缺失并附带错误信息）
    pub fn fail_planning(mut self, name: &str) -> Self {
        self.fail_planning.insert(name.to_string());
        self
    }

    /// 第 `call` 次批量规划请求（从 0 开始）整体失败
    pub fn fail_batch_request(mut self, call: usize) -> Self {
        self.fail_batch_calls.insert(call);
        self
    }

    /// 重新规划时改变分片边界
    pub fn shift_on_replan(mut self) -> Self {
        self.shift_on_replan = true;
        self
    }

    pub fn plan_calls(&self) -> usize {
        self.state.lock().plan_calls
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.state.lock().puts.clone()
    }

    pub fn puts_for(&self, key: &str) -> Vec<PutRecord> {
        self.puts().into_iter().filter(|p| p.file_key == key).collect()
    }

    /// 规划请求与 PUT 同时进行的最大数量
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    async fn put_pause(&self) {
        if self.put_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.put_delay).await;
        }
    }

    fn rows_for(&self, name: &str, relative_path: &str, size: u64) -> Vec<RawDestination> {
        let key = file_key(name, relative_path);
        let version = {
            let mut state = self.state.lock();
            let version = state.plan_versions.entry(key).or_insert(0);
            *version += 1;
            *version
        };

        let chunk_size = if self.shift_on_replan && version > 1 {
            (self.chunk_size - 1).max(1)
        } else {
            self.chunk_size
        };

        calculate_chunk_ranges(size, chunk_size)
            .into_iter()
            .enumerate()
            .map(|(index, range)| RawDestination {
                file_name: Some(name.to_string()),
                relative_path: Some(relative_path.to_string()),
                upload_url: Some(format!(
                    "mock://{}/{}/{}?v={}",
                    relative_path, name, index, version
                )),
                chunk_index: Some(index.to_string()),
                start_byte: Some(range.start.to_string()),
                end_byte: Some(range.end.to_string()),
                total_size: Some(size.to_string()),
                session_id: Some(format!("session-{}", name)),
            })
            .collect()
    }

    fn should_fail_put(&self, descriptor: &ChunkDescriptor) -> bool {
        if self.always_fail.contains(&descriptor.file_name) {
            return true;
        }
        if let Some(times) = self.fail_first.get(&descriptor.file_name) {
            let mut state = self.state.lock();
            let injected = state
                .injected_failures
                .entry(descriptor.file_name.clone())
                .or_insert(0);
            if *injected < *times {
                *injected += 1;
                return true;
            }
        }
        false
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UploadBackend for MockBackend {
    async fn plan_upload(
        &self,
        _session: &SessionContext,
        request: &PlanUploadRequest,
    ) -> Result<PlanResponse, BackendError> {
        let _guard = self.enter();
        self.state.lock().plan_calls += 1;
        tokio::task::yield_now().await;

        if self.fail_planning.contains(&request.file_name) {
            return Err(BackendError::Status {
                status: 500,
                body: "planning unavailable".to_string(),
            });
        }

        Ok(PlanResponse {
            success_urls: self.rows_for(&request.file_name, ".", request.file_size),
            error_messages: Vec::new(),
        })
    }

    async fn plan_upload_batch(
        &self,
        _session: &SessionContext,
        request: &PlanUploadBatchRequest,
    ) -> Result<PlanResponse, BackendError> {
        let _guard = self.enter();
        let call = {
            let mut state = self.state.lock();
            state.batch_sizes.push(request.file_count());
            state.batch_sizes.len() - 1
        };
        tokio::task::yield_now().await;

        if self.fail_batch_calls.contains(&call) {
            return Err(BackendError::Status {
                status: 500,
                body: "batch planning unavailable".to_string(),
            });
        }

        let names = request.file_names.split(',');
        let sizes = request.file_sizes.split(',');
        let paths = request.relative_paths.split(',');

        let mut response = PlanResponse::default();
        for ((name, size), path) in names.zip(sizes).zip(paths) {
            if self.fail_planning.contains(name) {
                response.error_messages.push(PlanErrorMessage {
                    error: format!("{} rejected", name),
                });
                continue;
            }
            let size: u64 = size.parse().map_err(|_| BackendError::Status {
                status: 400,
                body: format!("bad size {}", size),
            })?;
            response.success_urls.extend(self.rows_for(name, path, size));
        }

        // 打乱顺序：后端不保证按序返回
        response.success_urls.reverse();
        Ok(response)
    }

    async fn put_chunk(
        &self,
        descriptor: &ChunkDescriptor,
        body: Vec<u8>,
    ) -> Result<(), BackendError> {
        let _guard = self.enter();
        self.put_pause().await;

        let ok = !self.should_fail_put(descriptor);
        self.state.lock().puts.push(PutRecord {
            file_key: descriptor.file_key(),
            chunk_index: descriptor.chunk_index,
            start_byte: descriptor.start_byte,
            end_byte: descriptor.end_byte,
            total_size: descriptor.total_size,
            upload_url: descriptor.upload_url.clone(),
            body,
            ok,
        });

        if ok {
            Ok(())
        } else {
            Err(BackendError::Status {
                status: self.fail_status,
                body: "injected failure".to_string(),
            })
        }
    }
}
