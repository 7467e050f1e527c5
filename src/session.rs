// 会话上下文
//
// 上传调用方显式传入，不再从全局存储读取当前用户

use serde::{Deserialize, Serialize};

/// 会话上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    /// 用户名（单文件规划请求使用）
    pub username: String,
    /// 邮箱（批量规划请求使用）
    pub email: String,
    /// 访问令牌（作为 Bearer 发送，可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl SessionContext {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            access_token: None,
        }
    }

    /// 附带访问令牌
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// 会话是否可用于上传（用户名和邮箱都不能为空）
    pub fn is_usable(&self) -> bool {
        !self.username.trim().is_empty() && !self.email.trim().is_empty()
    }
}
