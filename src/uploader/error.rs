// 上传错误分类
//
// - Precondition: 前置条件不满足，运行不会开始，不发起任何网络请求
// - Planning / NoDestinations: 规划失败，只影响对应文件（单文件模式）或整批（文件夹模式）
// - Transfer: 分片传输重试耗尽，只影响所属文件
// - Refresh: 未找到可替换的上传地址，立即终止该分片的重试

use thiserror::Error;

/// 上传错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("前置条件不满足: {0}")]
    Precondition(String),

    #[error("规划上传失败: {0}")]
    Planning(String),

    #[error("未获取到上传地址: {file_key}")]
    NoDestinations { file_key: String },

    #[error("分片 #{chunk_index} 上传失败（已尝试 {attempts} 次）: {reason}")]
    Transfer {
        chunk_index: u32,
        attempts: u32,
        reason: String,
    },

    #[error("分片 #{chunk_index} 刷新上传地址失败: {reason}")]
    Refresh { chunk_index: u32, reason: String },

    #[error("读取文件内容失败: {0}")]
    Io(String),

    #[error("上传已取消")]
    Cancelled,
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e.to_string())
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
