// 上传后端 HTTP 客户端实现

use crate::backend::{
    BackendError, PlanResponse, PlanUploadBatchRequest, PlanUploadRequest, UploadBackend,
};
use crate::config::BackendConfig;
use crate::session::SessionContext;
use crate::uploader::ChunkDescriptor;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

/// 响应体在错误信息中保留的最大长度
const MAX_ERROR_BODY_LEN: usize = 512;

/// 上传后端 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpUploadBackend {
    /// HTTP客户端
    client: Client,
    /// 后端根地址（不带末尾 /）
    base_url: String,
    plan_upload_path: String,
    plan_upload_batch_path: String,
    /// 分片 PUT 的 Content-Type
    content_type: String,
}

impl HttpUploadBackend {
    /// 根据配置创建客户端
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("创建 HTTP 客户端失败")?;

        info!(
            "初始化上传后端客户端: base_url={}, timeout={}s",
            config.base_url, config.request_timeout_secs
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            plan_upload_path: config.plan_upload_path.clone(),
            plan_upload_batch_path: config.plan_upload_batch_path.clone(),
            content_type: config.content_type.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// 发送规划请求
    async fn post_plan<T: Serialize + ?Sized>(
        &self,
        session: &SessionContext,
        path: &str,
        body: &T,
    ) -> Result<PlanResponse, BackendError> {
        let url = self.endpoint(path);

        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &session.access_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;

        debug!("规划响应: url={}, status={}, body_len={}", url, status, text.len());

        if !status.is_success() {
            error!("规划请求失败: url={}, status={}", url, status);
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl UploadBackend for HttpUploadBackend {
    async fn plan_upload(
        &self,
        session: &SessionContext,
        request: &PlanUploadRequest,
    ) -> Result<PlanResponse, BackendError> {
        info!(
            "请求上传规划: file={}, size={}, folder={}",
            request.file_name, request.file_size, request.folder_name
        );
        self.post_plan(session, &self.plan_upload_path, request)
            .await
    }

    async fn plan_upload_batch(
        &self,
        session: &SessionContext,
        request: &PlanUploadBatchRequest,
    ) -> Result<PlanResponse, BackendError> {
        info!(
            "请求批量上传规划: files={}, base_folder={}",
            request.file_count(),
            request.base_folder_name
        );
        self.post_plan(session, &self.plan_upload_batch_path, request)
            .await
    }

    async fn put_chunk(
        &self,
        descriptor: &ChunkDescriptor,
        body: Vec<u8>,
    ) -> Result<(), BackendError> {
        let content_range = descriptor.content_range();

        debug!(
            "PUT 分片: file={}, chunk=#{}, range={}",
            descriptor.file_key(),
            descriptor.chunk_index,
            content_range
        );

        // 预签名地址自带授权，不附加会话令牌
        let response = self
            .client
            .put(&descriptor.upload_url)
            .header(CONTENT_TYPE, self.content_type.as_str())
            .header(CONTENT_RANGE, content_range)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body: truncate(&text),
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(e.to_string())
    } else if e.is_decode() {
        BackendError::Decode(e.to_string())
    } else {
        BackendError::Network(e.to_string())
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY_LEN {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
