// 后端接口模块
//
// 规划接口（单文件 / 批量）与分片 PUT 传输，均为外部服务
// 通过 UploadBackend trait 注入，便于替换为测试实现

pub mod client;
pub mod types;

pub use client::HttpUploadBackend;
pub use types::{
    PlanErrorMessage, PlanResponse, PlanUploadBatchRequest, PlanUploadRequest, RawDestination,
};

use crate::session::SessionContext;
use crate::uploader::ChunkDescriptor;
use async_trait::async_trait;
use thiserror::Error;

/// 后端请求错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("响应解析失败: {0}")]
    Decode(String),
}

impl BackendError {
    /// 错误分类
    pub fn kind(&self) -> TransferErrorKind {
        match self {
            BackendError::Status { status, .. } => TransferErrorKind::from_status(*status),
            BackendError::Timeout(_) => TransferErrorKind::Timeout,
            BackendError::Network(_) => TransferErrorKind::Network,
            BackendError::Decode(_) => TransferErrorKind::Unknown,
        }
    }
}

/// 传输错误分类（用于日志和退避策略）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// 网络错误
    Network,
    /// 超时
    Timeout,
    /// 服务器错误（5xx）
    ServerError,
    /// 限流（429，需要更长等待时间）
    RateLimited,
    /// 预签名地址过期或无权限（401/403）
    Forbidden,
    /// 其他客户端错误（4xx）
    BadRequest,
    /// 未知错误
    Unknown,
}

impl TransferErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => TransferErrorKind::RateLimited,
            401 | 403 => TransferErrorKind::Forbidden,
            408 => TransferErrorKind::Timeout,
            400..=499 => TransferErrorKind::BadRequest,
            500..=599 => TransferErrorKind::ServerError,
            _ => TransferErrorKind::Unknown,
        }
    }
}

/// 上传后端
#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// 单文件规划：返回该文件每个分片的上传地址
    async fn plan_upload(
        &self,
        session: &SessionContext,
        request: &PlanUploadRequest,
    ) -> Result<PlanResponse, BackendError>;

    /// 批量规划：一次返回整批文件所有分片的上传地址
    async fn plan_upload_batch(
        &self,
        session: &SessionContext,
        request: &PlanUploadBatchRequest,
    ) -> Result<PlanResponse, BackendError>;

    /// 把一个分片的字节 PUT 到它的预签名地址，只有 2xx 视为成功
    async fn put_chunk(&self, descriptor: &ChunkDescriptor, body: Vec<u8>)
        -> Result<(), BackendError>;
}
