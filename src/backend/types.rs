// 后端规划接口数据类型

use crate::session::SessionContext;
use crate::uploader::UploadTarget;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// 单文件规划请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanUploadRequest {
    pub username: String,
    /// 目标目录
    pub folder_name: String,
    pub file_name: String,
    pub file_size: u64,
}

impl PlanUploadRequest {
    pub fn new(session: &SessionContext, folder_name: &str, target: &UploadTarget) -> Self {
        Self {
            username: session.username.clone(),
            folder_name: folder_name.to_string(),
            file_name: target.sanitized_name.clone(),
            file_size: target.size,
        }
    }
}

/// 批量规划请求（文件夹上传）
///
/// 文件名、大小、相对路径以逗号分隔，三者按位置一一对应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanUploadBatchRequest {
    pub email: String,
    /// 目标根目录（已拼接顶层文件夹名）
    pub base_folder_name: String,
    pub file_names: String,
    pub file_sizes: String,
    pub relative_paths: String,
}

impl PlanUploadBatchRequest {
    pub fn new(session: &SessionContext, base_folder_name: &str, batch: &[UploadTarget]) -> Self {
        Self {
            email: session.email.clone(),
            base_folder_name: base_folder_name.to_string(),
            file_names: join_csv(batch, |t| t.sanitized_name.clone()),
            file_sizes: join_csv(batch, |t| t.size.to_string()),
            relative_paths: join_csv(batch, |t| t.relative_path.clone()),
        }
    }

    /// 请求中的文件数
    pub fn file_count(&self) -> usize {
        if self.file_names.is_empty() {
            0
        } else {
            self.file_names.split(',').count()
        }
    }
}

fn join_csv<F>(batch: &[UploadTarget], field: F) -> String
where
    F: Fn(&UploadTarget) -> String,
{
    batch.iter().map(field).collect::<Vec<_>>().join(",")
}

/// 规划响应中的一行（一个分片）
///
/// 数值字段按不透明字符串处理，数字形式也接受
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDestination {
    #[serde(default, deserialize_with = "opaque_field")]
    pub file_name: Option<String>,
    #[serde(default, deserialize_with = "opaque_field")]
    pub relative_path: Option<String>,
    #[serde(default, deserialize_with = "opaque_field")]
    pub upload_url: Option<String>,
    #[serde(default, deserialize_with = "opaque_field")]
    pub chunk_index: Option<String>,
    #[serde(default, deserialize_with = "opaque_field")]
    pub start_byte: Option<String>,
    #[serde(default, deserialize_with = "opaque_field")]
    pub end_byte: Option<String>,
    #[serde(default, deserialize_with = "opaque_field")]
    pub total_size: Option<String>,
    #[serde(default, deserialize_with = "opaque_field")]
    pub session_id: Option<String>,
}

/// 规划响应中的错误信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanErrorMessage {
    #[serde(default)]
    pub error: String,
}

/// 规划响应
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    #[serde(default)]
    pub success_urls: Vec<RawDestination>,
    #[serde(default)]
    pub error_messages: Vec<PlanErrorMessage>,
}

impl PlanResponse {
    /// 合并后端返回的错误信息
    pub fn error_summary(&self) -> Option<String> {
        let errors: Vec<&str> = self
            .error_messages
            .iter()
            .map(|m| m.error.trim())
            .filter(|e| !e.is_empty())
            .collect();

        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}

/// 字符串或数字统一读成字符串，null/缺失为 None
fn opaque_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}
