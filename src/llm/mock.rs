//! Mock 模型客户端（用于测试与无 API Key 场景）
//!
//! - MockModelClient：回显最后一条 user 消息为纯文本回复，便于本地跑通会话
//! - ScriptedModelClient：按脚本依次返回回复/错误，并记录每次调用收到的消息与工具数

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ModelClient, ModelError, ModelReply, ToolSpec};
use crate::memory::{CanonicalRecord, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockModelClient;

#[async_trait]
impl ModelClient for MockModelClient {
    async fn send(
        &self,
        messages: &[CanonicalRecord],
        _tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(ModelReply::text(format!("Echo from Mock: {}", last_user)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<CanonicalRecord>,
    pub tool_count: usize,
}

/// 脚本客户端：脚本耗尽后返回 MalformedResponse
#[derive(Debug, Clone, Default)]
pub struct ScriptedModelClient {
    script: Arc<Mutex<VecDeque<Result<ModelReply, ModelError>>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    delay: Option<Duration>,
}

impl ScriptedModelClient {
    pub fn new(script: Vec<Result<ModelReply, ModelError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// 仅含成功回复的脚本
    pub fn replies(replies: Vec<ModelReply>) -> Self {
        Self::new(replies.into_iter().map(Ok).collect())
    }

    /// 每次调用前等待（模拟网络延迟，用于取消测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn send(
        &self,
        messages: &[CanonicalRecord],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                messages: messages.to_vec(),
                tool_count: tools.len(),
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Err(ModelError::MalformedResponse("script exhausted".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
