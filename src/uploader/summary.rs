// 上传结果汇总
//
// 编排器在每个文件到达终态时写入一条记录，运行结束后生成不可变汇总
// 记录按完成顺序追加，不保证与提交顺序一致

use crate::uploader::target::file_key;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// 单个文件的终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploaded,
    Skipped,
    Failed,
}

/// 上传模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// 单文件模式（每个文件单独规划）
    Single,
    /// 文件夹模式（分批规划）
    Folder,
}

/// 运行状态
///
/// Idle → Preparing → Uploading → { Completed | PartiallyFailed }
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Preparing,
    Uploading,
    Completed,
    PartiallyFailed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::PartiallyFailed)
    }
}

/// 单个文件的结果记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// 文件名（清理后）
    pub name: String,
    /// 相对目录
    pub relative_path: String,
    pub size: u64,
    /// 到达终态的时间（Unix 时间戳，秒）
    pub upload_time: i64,
    /// 耗时（毫秒）
    pub elapsed_ms: u64,
    pub status: FileStatus,
    /// 失败或跳过原因
    pub error: Option<String>,
}

impl FileRecord {
    pub fn uploaded(name: &str, relative_path: &str, size: u64, elapsed_ms: u64) -> Self {
        Self::new(name, relative_path, size, elapsed_ms, FileStatus::Uploaded, None)
    }

    pub fn skipped(name: &str, relative_path: &str, size: u64, reason: impl Into<String>) -> Self {
        Self::new(name, relative_path, size, 0, FileStatus::Skipped, Some(reason.into()))
    }

    pub fn failed(
        name: &str,
        relative_path: &str,
        size: u64,
        elapsed_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            relative_path,
            size,
            elapsed_ms,
            FileStatus::Failed,
            Some(error.into()),
        )
    }

    fn new(
        name: &str,
        relative_path: &str,
        size: u64,
        elapsed_ms: u64,
        status: FileStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            relative_path: relative_path.to_string(),
            size,
            upload_time: Utc::now().timestamp(),
            elapsed_ms,
            status,
            error,
        }
    }

    /// 文件键：`fileName|relativePath`
    pub fn file_key(&self) -> String {
        file_key(&self.name, &self.relative_path)
    }
}

/// 一次运行的汇总
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRunSummary {
    pub run_id: String,
    pub mode: UploadMode,
    /// 实际上传目录（文件夹模式为拼接后的目录）
    pub destination: String,
    pub state: RunState,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub records: Vec<FileRecord>,
    /// 失败原因（`文件键: 原因`）
    pub failure_reasons: Vec<String>,
    /// 汇总信息
    pub message: String,
}

impl UploadRunSummary {
    pub fn new(
        run_id: impl Into<String>,
        mode: UploadMode,
        destination: impl Into<String>,
        records: Vec<FileRecord>,
    ) -> Self {
        let mut summary = Self {
            run_id: run_id.into(),
            mode,
            destination: destination.into(),
            state: RunState::Completed,
            uploaded: 0,
            skipped: 0,
            failed: 0,
            records,
            failure_reasons: Vec::new(),
            message: String::new(),
        };
        summary.recount();
        summary
    }

    /// 根据记录重新计算计数、状态和信息
    pub fn recount(&mut self) {
        self.uploaded = self.count(FileStatus::Uploaded);
        self.skipped = self.count(FileStatus::Skipped);
        self.failed = self.count(FileStatus::Failed);

        self.failure_reasons = self
            .records
            .iter()
            .filter(|r| r.status == FileStatus::Failed)
            .map(|r| {
                format!(
                    "{}: {}",
                    r.file_key(),
                    r.error.as_deref().unwrap_or("未知错误")
                )
            })
            .collect();

        self.state = if self.failed == 0 {
            RunState::Completed
        } else {
            RunState::PartiallyFailed
        };
        self.message = summary_message(self.uploaded, self.skipped, self.failed);
    }

    fn count(&self, status: FileStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    /// 查找失败记录
    pub fn find_failed(&self, name: &str, relative_path: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| {
            r.status == FileStatus::Failed && r.name == name && r.relative_path == relative_path
        })
    }

    /// 原地替换同一文件键的记录，返回是否找到
    pub fn replace_record(&mut self, record: FileRecord) -> bool {
        let key = record.file_key();
        match self.records.iter_mut().find(|r| r.file_key() == key) {
            Some(slot) => {
                *slot = record;
                self.recount();
                true
            }
            None => false,
        }
    }
}

/// 汇总信息文本
pub fn summary_message(uploaded: usize, skipped: usize, failed: usize) -> String {
    format!(
        "上传完成：成功 {} 个，跳过 {} 个，失败 {} 个",
        uploaded, skipped, failed
    )
}

/// 运行期间的结果收集器
///
/// 多个文件任务并发写入
#[derive(Debug, Default)]
pub struct ResultAggregator {
    records: Mutex<Vec<FileRecord>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条终态记录，返回当前已成功的文件数
    pub fn push(&self, record: FileRecord) -> usize {
        let mut records = self.records.lock();
        records.push(record);
        records
            .iter()
            .filter(|r| r.status == FileStatus::Uploaded)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// 当前全部记录（按完成顺序）
    pub fn snapshot(&self) -> Vec<FileRecord> {
        self.records.lock().clone()
    }

    /// 生成汇总
    pub fn summarize(
        &self,
        run_id: impl Into<String>,
        mode: UploadMode,
        destination: impl Into<String>,
    ) -> UploadRunSummary {
        UploadRunSummary::new(run_id, mode, destination, self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UploadRunSummary {
        UploadRunSummary::new(
            "run-1",
            UploadMode::Single,
            "/backup",
            vec![
                FileRecord::uploaded("a.txt", ".", 10, 5),
                FileRecord::failed("b.txt", ".", 20, 7, "分片 #0 上传失败"),
                FileRecord::skipped("c.txt", ".", 0, "空文件"),
            ],
        )
    }

    #[test]
    fn test_recount() {
        let summary = sample();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.state, RunState::PartiallyFailed);
        assert_eq!(summary.failure_reasons, vec!["b.txt|.: 分片 #0 上传失败"]);
        assert_eq!(summary.message, "上传完成：成功 1 个，跳过 1 个，失败 1 个");
    }

    #[test]
    fn test_skipped_does_not_fail_run() {
        let summary = UploadRunSummary::new(
            "run-2",
            UploadMode::Folder,
            "/backup/photos",
            vec![
                FileRecord::uploaded("a.jpg", ".", 10, 1),
                FileRecord::skipped("empty.jpg", ".", 0, "空文件"),
            ],
        );
        assert_eq!(summary.state, RunState::Completed);
        assert!(summary.is_success());
    }

    #[test]
    fn test_replace_record_in_place() {
        let mut summary = sample();
        let before = summary.records.clone();

        assert!(summary.find_failed("b.txt", ".").is_some());
        assert!(summary.find_failed("a.txt", ".").is_none());

        assert!(summary.replace_record(FileRecord::uploaded("b.txt", ".", 20, 3)));
        assert_eq!(summary.records.len(), 3);
        assert_eq!(summary.records[0], before[0]);
        assert_eq!(summary.records[2], before[2]);
        assert_eq!(summary.records[1].status, FileStatus::Uploaded);
        assert_eq!(summary.state, RunState::Completed);
        assert!(summary.failure_reasons.is_empty());

        assert!(!summary.replace_record(FileRecord::uploaded("zzz", ".", 1, 1)));
    }

    #[test]
    fn test_aggregator() {
        let aggregator = ResultAggregator::new();
        assert!(aggregator.is_empty());
        assert_eq!(aggregator.push(FileRecord::uploaded("a", ".", 1, 1)), 1);
        assert_eq!(aggregator.push(FileRecord::failed("b", ".", 1, 1, "x")), 1);
        assert_eq!(aggregator.push(FileRecord::uploaded("c", "sub", 1, 1)), 2);
        assert_eq!(aggregator.len(), 3);

        let summary = aggregator.summarize("r", UploadMode::Folder, "/d");
        assert_eq!(summary.uploaded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.mode, UploadMode::Folder);
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::PartiallyFailed.is_terminal());
        assert!(!RunState::Uploading.is_terminal());
    }
}
