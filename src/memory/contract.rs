//! 消息契约：统一读取两种消息形态
//!
//! 属性风格（`Message`、`ModelReply` 等结构体）与键值记录风格（`serde_json::Value`，各家 provider 原始 JSON）
//! 只需实现 MessageView 的四个原始读取方法；get_role / get_content / get_tool_calls / to_canonical_record
//! 在其上提供全函数语义：缺失字段给默认值，从不失败。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::{Message, Role, ToolCallRequest};

/// content 字段的原始形态
pub enum RawContent<'a> {
    Missing,
    Text(&'a str),
    Value(&'a Value),
}

/// tool_calls 字段的原始形态
pub enum RawToolCalls<'a> {
    Missing,
    Parsed(&'a [ToolCallRequest]),
    Value(&'a Value),
}

/// 最小读取契约：has-role / has-content / has-tool-calls / tool_call_id
pub trait MessageView {
    fn raw_role(&self) -> Option<&str>;
    fn raw_content(&self) -> RawContent<'_>;
    fn raw_tool_calls(&self) -> RawToolCalls<'_>;
    fn raw_tool_call_id(&self) -> Option<&str>;
}

impl<T: MessageView + ?Sized> MessageView for &T {
    fn raw_role(&self) -> Option<&str> {
        (**self).raw_role()
    }
    fn raw_content(&self) -> RawContent<'_> {
        (**self).raw_content()
    }
    fn raw_tool_calls(&self) -> RawToolCalls<'_> {
        (**self).raw_tool_calls()
    }
    fn raw_tool_call_id(&self) -> Option<&str> {
        (**self).raw_tool_call_id()
    }
}

/// 规范记录：role / content / tool_calls / tool_call_id，可直接持久化或送入摘要
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl CanonicalRecord {
    /// 转回会话消息（Unknown 角色按 user 处理）
    pub fn into_message(self) -> Message {
        Message {
            role: match self.role {
                Role::Unknown => Role::User,
                r => r,
            },
            content: self.content,
            tool_calls: self.tool_calls,
            tool_call_id: self.tool_call_id,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn get_role(message: &impl MessageView) -> Role {
    message.raw_role().map(Role::parse).unwrap_or(Role::Unknown)
}

/// 文本内容；缺失或 null 返回空串，非文本值转为其文本表示
pub fn get_content(message: &impl MessageView) -> String {
    match message.raw_content() {
        RawContent::Missing => String::new(),
        RawContent::Text(s) => s.to_string(),
        RawContent::Value(v) => value_to_text(v),
    }
}

/// 工具调用序列；无论底层值多畸形都返回 Vec（单对象包成一个元素，无法识别的元素丢弃）
pub fn get_tool_calls(message: &impl MessageView) -> Vec<ToolCallRequest> {
    match message.raw_tool_calls() {
        RawToolCalls::Missing => Vec::new(),
        RawToolCalls::Parsed(calls) => calls.to_vec(),
        RawToolCalls::Value(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, v)| parse_tool_call(v, i))
            .collect(),
        RawToolCalls::Value(v @ Value::Object(_)) => parse_tool_call(v, 0).into_iter().collect(),
        RawToolCalls::Value(_) => Vec::new(),
    }
}

pub fn get_tool_call_id(message: &impl MessageView) -> Option<String> {
    message
        .raw_tool_call_id()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 生成规范记录；对自身输出再次调用得到相同记录
pub fn to_canonical_record(message: &impl MessageView) -> CanonicalRecord {
    CanonicalRecord {
        role: get_role(message),
        content: get_content(message),
        tool_calls: get_tool_calls(message),
        tool_call_id: get_tool_call_id(message),
    }
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        // OpenAI / Anthropic 内容分段：拼接各段 text
        Value::Array(parts) if parts.iter().all(|p| p.get("text").is_some()) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        other => other.to_string(),
    }
}

/// 解析单个工具调用：兼容 {"id","type":"function","function":{"name","arguments"}} 与扁平 {"id","name","arguments"}
fn parse_tool_call(v: &Value, index: usize) -> Option<ToolCallRequest> {
    let obj = v.as_object()?;
    let inner = obj.get("function").and_then(Value::as_object).unwrap_or(obj);
    let name = inner
        .get("name")
        .or_else(|| inner.get("tool"))
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())?;
    let raw_args = inner
        .get("arguments")
        .or_else(|| inner.get("args"))
        .or_else(|| inner.get("input"))
        .cloned()
        .unwrap_or(Value::Null);
    let arguments = match raw_args {
        Value::String(s) if s.trim().is_empty() => Value::Object(Default::default()),
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call-{index}"));
    Some(ToolCallRequest::new(id, name.trim(), arguments))
}

impl MessageView for Message {
    fn raw_role(&self) -> Option<&str> {
        Some(self.role.as_str())
    }
    fn raw_content(&self) -> RawContent<'_> {
        RawContent::Text(&self.content)
    }
    fn raw_tool_calls(&self) -> RawToolCalls<'_> {
        RawToolCalls::Parsed(&self.tool_calls)
    }
    fn raw_tool_call_id(&self) -> Option<&str> {
        self.tool_call_id.as_deref()
    }
}

impl MessageView for CanonicalRecord {
    fn raw_role(&self) -> Option<&str> {
        Some(self.role.as_str())
    }
    fn raw_content(&self) -> RawContent<'_> {
        RawContent::Text(&self.content)
    }
    fn raw_tool_calls(&self) -> RawToolCalls<'_> {
        RawToolCalls::Parsed(&self.tool_calls)
    }
    fn raw_tool_call_id(&self) -> Option<&str> {
        self.tool_call_id.as_deref()
    }
}

impl MessageView for Value {
    fn raw_role(&self) -> Option<&str> {
        self.get("role").and_then(Value::as_str)
    }
    fn raw_content(&self) -> RawContent<'_> {
        match self.get("content") {
            None => RawContent::Missing,
            Some(Value::String(s)) => RawContent::Text(s),
            Some(v) => RawContent::Value(v),
        }
    }
    fn raw_tool_calls(&self) -> RawToolCalls<'_> {
        match self.get("tool_calls") {
            None | Some(Value::Null) => RawToolCalls::Missing,
            Some(v) => RawToolCalls::Value(v),
        }
    }
    fn raw_tool_call_id(&self) -> Option<&str> {
        self.get("tool_call_id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_attribute_shapes_agree() {
        let attr = Message::assistant_with_tool_calls(
            "reading",
            vec![ToolCallRequest::new("c1", "read_file", json!({"path": "src/lib.rs"}))],
        );
        let record = json!({
            "role": "assistant",
            "content": "reading",
            "tool_calls": [{
                "id": "c1",
                "type": "function",
                "function": {"name": "read_file", "arguments": "{\"path\":\"src/lib.rs\"}"}
            }]
        });
        assert_eq!(get_role(&attr), get_role(&record));
        assert_eq!(get_content(&attr), get_content(&record));
        assert_eq!(get_tool_calls(&attr), get_tool_calls(&record));
        assert_eq!(to_canonical_record(&attr), to_canonical_record(&record));
    }

    #[test]
    fn test_missing_fields_default() {
        let v = json!({"content": null});
        assert_eq!(get_role(&v), Role::Unknown);
        assert_eq!(get_content(&v), "");
        assert!(get_tool_calls(&v).is_empty());
        assert_eq!(get_content(&json!({})), "");
    }

    #[test]
    fn test_non_text_content_coerced() {
        assert_eq!(get_content(&json!({"content": 42})), "42");
        let parts = json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(get_content(&parts), "ab");
    }

    #[test]
    fn test_tool_calls_always_sequence() {
        let single = json!({"tool_calls": {"name": "ls", "arguments": {}}});
        let calls = get_tool_calls(&single);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "ls");

        assert!(get_tool_calls(&json!({"tool_calls": "garbage"})).is_empty());
        assert!(get_tool_calls(&json!({"tool_calls": 7})).is_empty());
        let mixed = json!({"tool_calls": [1, {"name": "ls"}, {"function": {}}]});
        assert_eq!(get_tool_calls(&mixed).len(), 1);
    }

    #[test]
    fn test_canonical_record_idempotent() {
        let raw = json!({
            "role": "tool",
            "content": {"ok": true},
            "tool_call_id": "c9"
        });
        let once = to_canonical_record(&raw);
        let twice = to_canonical_record(&once);
        assert_eq!(once, twice);
        assert_eq!(to_canonical_record(&once.to_value()), once);
    }
}
