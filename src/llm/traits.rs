//! 模型客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ModelClient::send(规范消息, 可用工具) -> ModelReply；
//! 引擎对所有 Provider 一视同仁，Provider 差异只在消息契约层归一。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::{CanonicalRecord, MessageView, RawContent, RawToolCalls, ToolCallRequest};

/// Provider 错误分类：前四类为瞬时错误（可退避重试），其余立即致命
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelError::Timeout
                | ModelError::RateLimited { .. }
                | ModelError::Server { .. }
                | ModelError::Connection(_)
        )
    }
}

/// 单次调用的 token 统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// 提供给模型的工具声明（名称、描述、参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 模型回复：content 与可选的结构化 tool_calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            usage: None,
        }
    }
}

impl MessageView for ModelReply {
    fn raw_role(&self) -> Option<&str> {
        Some("assistant")
    }
    fn raw_content(&self) -> RawContent<'_> {
        RawContent::Text(&self.content)
    }
    fn raw_tool_calls(&self) -> RawToolCalls<'_> {
        RawToolCalls::Parsed(&self.tool_calls)
    }
    fn raw_tool_call_id(&self) -> Option<&str> {
        None
    }
}

/// 模型客户端协作者
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// 发送规范化对话；tools 为空表示本次不启用工具调用
    async fn send(
        &self,
        messages: &[CanonicalRecord],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "model"
    }
}
