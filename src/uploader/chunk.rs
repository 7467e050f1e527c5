// 上传分片管理
//
// - ChunkDescriptor: 后端规划接口返回的单个分片目标（字节范围 + 预签名地址）
// - ChunkProgressMap: 按文件键记录分片计数，文件进度只随整片完成推进
// - ChunkAttempt: 单个分片的重试状态机
//   Pending → InFlight → { Done | RetryPending | Failed }，RetryPending 换地址后回到 InFlight

use crate::backend::RawDestination;
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::target::file_key;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// 分片目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// 所属文件名
    pub file_name: String,
    /// 所属文件的相对目录
    pub relative_path: String,
    /// 分片序号（从 0 开始）
    pub chunk_index: u32,
    /// 起始字节（含）
    pub start_byte: u64,
    /// 结束字节（不含）
    pub end_byte: u64,
    /// 文件声明总大小
    pub total_size: u64,
    /// 预签名上传地址，只用于一次传输尝试
    pub upload_url: String,
    /// 上传会话 ID
    pub session_id: String,
}

impl ChunkDescriptor {
    /// 分片大小
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self) -> Range<u64> {
        self.start_byte..self.end_byte
    }

    /// 所属文件键
    pub fn file_key(&self) -> String {
        file_key(&self.file_name, &self.relative_path)
    }

    /// Content-Range 请求头：`bytes {start}-{end-1}/{total}`
    pub fn content_range(&self) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start_byte,
            self.end_byte.saturating_sub(1),
            self.total_size
        )
    }

    /// 是否与另一个分片占据同一位置（同文件、同序号、同范围、同总大小）
    ///
    /// 刷新上传地址时用它在新的规划结果中找到对应分片
    pub fn same_slot(&self, other: &ChunkDescriptor) -> bool {
        self.file_name == other.file_name
            && self.relative_path == other.relative_path
            && self.chunk_index == other.chunk_index
            && self.start_byte == other.start_byte
            && self.end_byte == other.end_byte
            && self.total_size == other.total_size
    }
}

impl TryFrom<&RawDestination> for ChunkDescriptor {
    type Error = UploadError;

    fn try_from(raw: &RawDestination) -> UploadResult<Self> {
        let file_name = required(&raw.file_name, "fileName")?.to_string();
        let relative_path = raw
            .relative_path
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(".")
            .to_string();
        let upload_url = required(&raw.upload_url, "uploadUrl")?.to_string();
        let chunk_index = parse_number::<u32>(&raw.chunk_index, "chunkIndex")?;
        let start_byte = parse_number::<u64>(&raw.start_byte, "startByte")?;
        let end_byte = parse_number::<u64>(&raw.end_byte, "endByte")?;
        let total_size = parse_number::<u64>(&raw.total_size, "totalSize")?;
        let session_id = raw.session_id.clone().unwrap_or_default();

        if end_byte <= start_byte {
            return Err(UploadError::Planning(format!(
                "分片 #{} 字节范围无效: {}-{}",
                chunk_index, start_byte, end_byte
            )));
        }

        Ok(Self {
            file_name,
            relative_path,
            chunk_index,
            start_byte,
            end_byte,
            total_size,
            upload_url,
            session_id,
        })
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> UploadResult<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UploadError::Planning(format!("规划结果缺少字段: {}", field)))
}

fn parse_number<T: std::str::FromStr>(value: &Option<String>, field: &str) -> UploadResult<T> {
    let raw = required(value, field)?;
    raw.parse::<T>()
        .map_err(|_| UploadError::Planning(format!("规划结果字段 {} 不是有效数字: {}", field, raw)))
}

/// 按分片大小计算字节范围（末片可能较小）
pub fn calculate_chunk_ranges(total_size: u64, chunk_size: u64) -> Vec<Range<u64>> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::new();
    let mut offset = 0u64;

    while offset < total_size {
        let end = std::cmp::min(offset + chunk_size, total_size);
        ranges.push(offset..end);
        offset = end;
    }

    ranges
}

/// 校验已排序的分片恰好覆盖 [0, expected_size)，无缝隙、无重叠
pub fn validate_tiling(chunks: &[ChunkDescriptor], expected_size: u64) -> UploadResult<()> {
    if chunks.is_empty() {
        return Err(UploadError::Planning("分片列表为空".to_string()));
    }

    let mut offset = 0u64;
    for (position, chunk) in chunks.iter().enumerate() {
        if chunk.chunk_index as usize != position {
            return Err(UploadError::Planning(format!(
                "分片序号不连续: 期望 #{}, 实际 #{}",
                position, chunk.chunk_index
            )));
        }
        if chunk.total_size != expected_size {
            return Err(UploadError::Planning(format!(
                "分片 #{} 声明的文件大小 {} 与实际大小 {} 不一致",
                chunk.chunk_index, chunk.total_size, expected_size
            )));
        }
        if chunk.start_byte != offset {
            return Err(UploadError::Planning(format!(
                "分片 #{} 起始字节 {} 与上一分片结束位置 {} 不衔接",
                chunk.chunk_index, chunk.start_byte, offset
            )));
        }
        offset = chunk.end_byte;
    }

    if offset != expected_size {
        return Err(UploadError::Planning(format!(
            "分片覆盖到 {} 字节，文件大小为 {}",
            offset, expected_size
        )));
    }

    Ok(())
}

/// 单个文件的分片计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCounters {
    /// 分片总数
    pub total: usize,
    /// 已确认完成的分片数
    pub uploaded: usize,
}

impl ChunkCounters {
    /// 进度百分比，只在 uploaded == total 时为 100
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        if self.uploaded >= self.total {
            return 100.0;
        }
        (self.uploaded as f64 / self.total as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.uploaded == self.total
    }
}

/// 各文件分片计数表（键为 `fileName|relativePath`）
///
/// 每个文件独占一个条目，并发分片只修改自己文件的计数
#[derive(Debug, Default)]
pub struct ChunkProgressMap {
    counters: DashMap<String, ChunkCounters>,
}

impl ChunkProgressMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 规划完成时设置分片总数（同时清零已完成数）
    pub fn set_total(&self, key: &str, total: usize) {
        self.counters
            .insert(key.to_string(), ChunkCounters { total, uploaded: 0 });
    }

    /// 记录一个分片完成，返回更新后的计数
    pub fn mark_uploaded(&self, key: &str) -> Option<ChunkCounters> {
        let mut entry = self.counters.get_mut(key)?;
        if entry.uploaded < entry.total {
            entry.uploaded += 1;
        }
        Some(*entry)
    }

    pub fn get(&self, key: &str) -> Option<ChunkCounters> {
        self.counters.get(key).map(|c| *c)
    }

    pub fn percent(&self, key: &str) -> f64 {
        self.get(key).map(|c| c.percent()).unwrap_or(0.0)
    }

    pub fn remove(&self, key: &str) {
        self.counters.remove(key);
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InFlight,
    Done,
    RetryPending,
    Failed,
}

/// 分片重试状态
#[derive(Debug, Clone)]
pub struct ChunkAttempt {
    /// 当前使用的分片目标（刷新后替换）
    pub descriptor: ChunkDescriptor,
    /// 已发起的传输次数
    pub attempt: u32,
    /// 最近一次错误
    pub last_error: Option<String>,
    state: ChunkState,
    max_attempts: u32,
}

impl ChunkAttempt {
    pub fn new(descriptor: ChunkDescriptor, max_attempts: u32) -> Self {
        Self {
            descriptor,
            attempt: 0,
            last_error: None,
            state: ChunkState::Pending,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 开始一次传输，返回是否允许开始
    pub fn begin(&mut self) -> bool {
        match self.state {
            ChunkState::Pending | ChunkState::RetryPending => {
                self.state = ChunkState::InFlight;
                self.attempt += 1;
                true
            }
            _ => false,
        }
    }

    /// 传输成功
    pub fn succeed(&mut self) {
        if self.state == ChunkState::InFlight {
            self.state = ChunkState::Done;
        }
    }

    /// 传输失败，返回新状态（还有次数则 RetryPending，否则 Failed）
    pub fn fail(&mut self, error: impl Into<String>) -> ChunkState {
        self.last_error = Some(error.into());
        if self.state == ChunkState::InFlight {
            self.state = if self.attempt < self.max_attempts {
                ChunkState::RetryPending
            } else {
                ChunkState::Failed
            };
        }
        self.state
    }

    /// 换上新的上传地址（字节范围不变）
    pub fn replace_descriptor(&mut self, replacement: ChunkDescriptor) -> bool {
        if self.state != ChunkState::RetryPending || !self.descriptor.same_slot(&replacement) {
            return false;
        }
        self.descriptor = replacement;
        true
    }

    /// 放弃重试（例如未找到替换地址）
    pub fn abandon(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.state = ChunkState::Failed;
    }
}
