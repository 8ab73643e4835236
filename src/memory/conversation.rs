//! 会话历史：消息、工具调用请求与只追加的 Conversation
//!
//! Conversation 由引擎独占；追加时校验 tool 消息必须引用之前某条 assistant 消息中的 tool_call id。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 消息角色（与 LLM API 一致）；Unknown 仅由消息契约在缺失/无法识别时返回
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Unknown,
}

impl Role {
    /// 宽松解析角色名（大小写不敏感；function 视为 tool）
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" | "developer" => Role::System,
            "user" | "human" => Role::User,
            "assistant" | "model" | "ai" => Role::Assistant,
            "tool" | "function" => Role::Tool,
            _ => Role::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Unknown => "unknown",
        }
    }
}

/// 一次工具调用请求：id 在产生它的 assistant 回合内唯一；arguments 尚未校验
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "name")]
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// 单条消息（属性风格）；content 永不为 null，缺失即空串
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    /// 携带结构化 tool_calls 的 assistant 消息
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// 工具结果消息，通过 tool_call_id 关联请求
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// 只追加的对话序列（会话期间由引擎独占）
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以初始消息构建；同样执行 tool 消息引用校验
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, AgentError> {
        let mut conversation = Self::new();
        for m in messages {
            conversation.append(m)?;
        }
        Ok(conversation)
    }

    /// 追加一条消息；tool 消息必须引用已出现的 assistant tool_call id
    pub fn append(&mut self, message: Message) -> Result<(), AgentError> {
        if message.role == Role::Tool {
            let id = message.tool_call_id.as_deref().unwrap_or("");
            if !self.has_tool_call(id) {
                return Err(AgentError::Invariant(format!(
                    "tool result references unknown tool_call_id '{id}'"
                )));
            }
        }
        self.messages.push(message);
        Ok(())
    }

    fn has_tool_call(&self, id: &str) -> bool {
        !id.is_empty()
            && self
                .messages
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .any(|m| m.tool_calls.iter().any(|c| c.id == id))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 第一条 system 消息（检查点重置时唯一保留的消息）
    pub fn system_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.role == Role::System)
    }

    /// 所有 assistant 结构化调用中尚无对应 tool 结果的 id
    pub fn unresolved_tool_calls(&self) -> Vec<String> {
        let mut pending: Vec<String> = Vec::new();
        for m in &self.messages {
            match m.role {
                Role::Assistant => pending.extend(m.tool_calls.iter().map(|c| c.id.clone())),
                Role::Tool => {
                    if let Some(id) = &m.tool_call_id {
                        pending.retain(|p| p != id);
                    }
                }
                _ => {}
            }
        }
        pending
    }

    /// 整体替换（仅检查点重置使用：新序列在调用前已完整构建）
    pub(crate) fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// 清空对话，仅保留 system 消息
    pub fn clear_to_system(&mut self) {
        let system = self.system_message().cloned();
        self.messages = system.into_iter().collect();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_parse_lenient() {
        assert_eq!(Role::parse("ASSISTANT"), Role::Assistant);
        assert_eq!(Role::parse("function"), Role::Tool);
        assert_eq!(Role::parse("narrator"), Role::Unknown);
    }

    #[test]
    fn test_tool_message_requires_prior_request() {
        let mut conv = Conversation::new();
        conv.append(Message::system("sys")).unwrap();
        let err = conv.append(Message::tool("call-1", "out")).unwrap_err();
        assert!(matches!(err, AgentError::Invariant(_)));

        conv.append(Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest::new("call-1", "read_file", json!({"path": "a"}))],
        ))
        .unwrap();
        assert_eq!(conv.unresolved_tool_calls(), vec!["call-1".to_string()]);
        conv.append(Message::tool("call-1", "out")).unwrap();
        assert!(conv.unresolved_tool_calls().is_empty());
    }

    #[test]
    fn test_clear_to_system_keeps_only_system() {
        let mut conv = Conversation::from_messages(vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant("hello"),
        ])
        .unwrap();
        conv.clear_to_system();
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].role, Role::System);
    }
}
