// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 后端接口配置
    #[serde(default)]
    pub backend: BackendConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 文件夹扫描配置
    #[serde(default)]
    pub scan: ScanConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天，按天滚动，超出的旧文件自动删除）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info，RUST_LOG 环境变量优先）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 后端接口配置
///
/// 只描述规划接口的位置，分片上传地址（预签名 URL）由规划接口返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 后端根地址，如 https://backup.example.com
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 单文件规划接口路径
    #[serde(default = "default_plan_upload_path")]
    pub plan_upload_path: String,
    /// 批量规划接口路径（文件夹上传）
    #[serde(default = "default_plan_upload_batch_path")]
    pub plan_upload_batch_path: String,
    /// 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 分片 PUT 请求的 Content-Type
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_plan_upload_path() -> String {
    "/api/upload/plan".to_string()
}

fn default_plan_upload_batch_path() -> String {
    "/api/upload/plan-batch".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            plan_upload_path: default_plan_upload_path(),
            plan_upload_batch_path: default_plan_upload_batch_path(),
            request_timeout_secs: default_request_timeout_secs(),
            content_type: default_content_type(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 全局最大并发数（文件规划请求与分片上传共享）
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 文件夹上传时每批规划的文件数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 单个分片最多尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 重试退避基准（毫秒），0 表示立即重试
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 重试退避上限（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_batch_size() -> usize {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// 文件夹扫描配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    /// 上传文件夹时是否跳过隐藏文件（以.开头的文件/文件夹）
    #[serde(default)]
    pub skip_hidden_files: bool,
    /// 是否跟随符号链接
    #[serde(default)]
    pub follow_symlinks: bool,
    /// 单文件大小上限（字节），超出的文件不上传
    #[serde(default)]
    pub max_file_size: Option<u64>,
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }

        fs::write(path, content).await.context("写入配置文件失败")?;

        Ok(())
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.upload.max_concurrent == 0 {
            anyhow::bail!("upload.max_concurrent 必须大于 0");
        }
        if self.upload.batch_size == 0 {
            anyhow::bail!("upload.batch_size 必须大于 0");
        }
        if self.upload.max_attempts == 0 {
            anyhow::bail!("upload.max_attempts 必须大于 0");
        }
        let base_url = self.backend.base_url.trim();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            anyhow::bail!("backend.base_url 必须以 http:// 或 https:// 开头: {}", base_url);
        }
        if self.log.retention_days == 0 {
            anyhow::bail!("log.retention_days 必须大于 0");
        }
        Ok(())
    }
}
