//! 工具调用提取
//!
//! 优先使用模型回复中的结构化 tool_calls；为空时从文本中按顺序尝试两种回退格式：
//! 1. XML 风格：`<tool_call>{"name": "...", "arguments": {...}}</tool_call>`
//!    或 `<tool_call name="...">{...args...}</tool_call>`
//! 2. JSON 风格：```json 代码块或裸 JSON，`{"tool"|"name": ..., "args"|"arguments": {...}}`，单个对象或数组
//!
//! 回退格式解析失败不是错误，只是「没有工具调用」。

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::memory::{get_tool_calls, MessageView, ToolCallRequest};

/// 调用来自哪种形式；决定结果以 role=tool 还是汇总 role=user 回灌
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallForm {
    Structured,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCalls {
    pub form: CallForm,
    pub calls: Vec<ToolCallRequest>,
}

fn xml_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<tool_call(?:\s+name\s*=\s*["']([^"']+)["'])?\s*>(.*?)</tool_call>"#).ok()
    })
    .as_ref()
}

fn fence_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").ok())
        .as_ref()
}

/// 从一条模型回复中提取工具调用；无调用时返回 None（即纯文本回答）
pub fn extract_tool_calls(reply: &impl MessageView, text: &str) -> Option<ExtractedCalls> {
    let structured = get_tool_calls(reply);
    if !structured.is_empty() {
        return Some(ExtractedCalls {
            form: CallForm::Structured,
            calls: structured,
        });
    }
    let calls = parse_fallback_calls(text);
    if calls.is_empty() {
        None
    } else {
        Some(ExtractedCalls {
            form: CallForm::Fallback,
            calls,
        })
    }
}

/// 回退格式解析：XML 优先，其次 JSON；id 为 `fallback-<n>`
pub fn parse_fallback_calls(text: &str) -> Vec<ToolCallRequest> {
    let found = find_fallback_calls(text);
    if !found.is_empty() {
        tracing::debug!(count = found.len(), "extracted fallback tool calls");
    }
    found
        .into_iter()
        .enumerate()
        .map(|(i, f)| ToolCallRequest::new(format!("fallback-{i}"), f.name, f.args))
        .collect()
}

/// 去掉文本中被识别为回退调用的片段，保留其余说明文字
pub fn strip_fallback_calls(text: &str) -> String {
    let mut spans: Vec<Range<usize>> =
        find_fallback_calls(text).into_iter().map(|f| f.span).collect();
    if spans.is_empty() {
        return text.trim().to_string();
    }
    spans.sort_by_key(|r| r.start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        if span.start >= cursor {
            out.push_str(&text[cursor..span.start]);
        }
        cursor = cursor.max(span.end);
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}

/// 一个回退调用及其在原文中的位置
struct FoundCall {
    name: String,
    args: Value,
    span: Range<usize>,
}

fn find_fallback_calls(text: &str) -> Vec<FoundCall> {
    let found = parse_xml_calls(text);
    if found.is_empty() {
        parse_json_calls(text)
    } else {
        found
    }
}

fn parse_xml_calls(text: &str) -> Vec<FoundCall> {
    let Some(re) = xml_re() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for caps in re.captures_iter(text) {
        let span = caps.get(0).map(|m| m.range()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        match caps.get(1) {
            Some(name) => {
                let args = if body.is_empty() {
                    Value::Object(Default::default())
                } else {
                    match serde_json::from_str::<Value>(body) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::debug!(error = %e, "skipping malformed <tool_call> body");
                            continue;
                        }
                    }
                };
                out.push(FoundCall {
                    name: name.as_str().trim().to_string(),
                    args,
                    span,
                });
            }
            None => match serde_json::from_str::<Value>(body) {
                Ok(v) => out.extend(call_from_value(&v).map(|(name, args)| FoundCall {
                    name,
                    args,
                    span: span.clone(),
                })),
                Err(e) => tracing::debug!(error = %e, "skipping malformed <tool_call> body"),
            },
        }
    }
    out
}

fn parse_json_calls(text: &str) -> Vec<FoundCall> {
    if let Some(re) = fence_re() {
        for caps in re.captures_iter(text) {
            let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if let Ok(v) = serde_json::from_str::<Value>(body.as_str().trim()) {
                let calls = calls_from_value(&v, whole.range());
                if !calls.is_empty() {
                    return calls;
                }
            }
        }
    }
    bare_json_calls(text)
}

/// 从每个 `{` / `[` 起尝试解析一个完整 JSON 值，取第一个构成调用的；
/// 正文里零散的括号（如 `{name}`、`[1]`）只会让该起点失败，不影响后面的调用
fn bare_json_calls(text: &str) -> Vec<FoundCall> {
    let mut from = 0;
    while let Some(offset) = text[from..].find(['{', '[']) {
        let start = from + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(v)) => {
                let end = start + stream.byte_offset();
                let calls = calls_from_value(&v, start..end);
                if !calls.is_empty() {
                    return calls;
                }
                from = end;
            }
            _ => from = start + 1,
        }
    }
    Vec::new()
}

fn calls_from_value(v: &Value, span: Range<usize>) -> Vec<FoundCall> {
    let items: Vec<&Value> = match v {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(call_from_value)
        .map(|(name, args)| FoundCall {
            name,
            args,
            span: span.clone(),
        })
        .collect()
}

/// 单个调用对象：名称取 tool / name，参数取 args / arguments（字符串参数按 JSON 再解析）
fn call_from_value(v: &Value) -> Option<(String, Value)> {
    let obj = v.as_object()?;
    let name = obj
        .get("tool")
        .or_else(|| obj.get("name"))
        .and_then(|n| n.as_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())?;
    let args = match obj.get("args").or_else(|| obj.get("arguments")) {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(other) => other.clone(),
    };
    Some((name.to_string(), args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelReply;
    use serde_json::json;

    #[test]
    fn test_structured_calls_win() {
        let reply = ModelReply::with_tool_calls(
            r#"<tool_call>{"name": "shell", "arguments": {}}</tool_call>"#,
            vec![ToolCallRequest::new("call_1", "read_file", json!({"path": "a"}))],
        );
        let extracted = extract_tool_calls(&reply, &reply.content).unwrap();
        assert_eq!(extracted.form, CallForm::Structured);
        assert_eq!(extracted.calls[0].tool_name, "read_file");
    }

    #[test]
    fn test_xml_json_body() {
        let text = "I'll look.\n<tool_call>{\"name\": \"read_file\", \"arguments\": {\"path\": \"src/main.rs\"}}</tool_call>";
        let calls = parse_fallback_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "fallback-0");
        assert_eq!(calls[0].tool_name, "read_file");
        assert_eq!(calls[0].arguments, json!({"path": "src/main.rs"}));
    }

    #[test]
    fn test_xml_name_attribute_and_multiple() {
        let text = r#"<tool_call name="list_dir">{"path": "."}</tool_call>
<tool_call name='finish'>{"answer": "ok"}</tool_call>"#;
        let calls = parse_fallback_calls(text);
        let names: Vec<_> = calls.iter().map(|c| c.tool_name.as_str()).collect();
        assert_eq!(names, vec!["list_dir", "finish"]);
        assert_eq!(calls[1].id, "fallback-1");
    }

    #[test]
    fn test_xml_beats_json() {
        let text = r#"{"tool": "shell", "args": {"command": "ls"}}
<tool_call>{"name": "read_file", "arguments": {"path": "a"}}</tool_call>"#;
        let calls = parse_fallback_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "read_file");
    }

    #[test]
    fn test_json_fenced_array_and_string_arguments() {
        let text = "Plan:\n```json\n[{\"tool\": \"read_file\", \"args\": {\"path\": \"a\"}}, {\"name\": \"shell\", \"arguments\": \"{\\\"command\\\": \\\"ls\\\"}\"}]\n```";
        let calls = parse_fallback_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].arguments, json!({"command": "ls"}));
    }

    #[test]
    fn test_bare_json_object() {
        let calls = parse_fallback_calls(r#"Sure: {"tool": "list_dir", "args": {}} done"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "list_dir");
    }

    #[test]
    fn test_bare_json_after_stray_braces_in_prose() {
        let calls = parse_fallback_calls(
            r#"Config keys look like {name}. Calling: {"tool": "list_dir", "args": {"path": "."}}"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"path": "."}));

        let calls = parse_fallback_calls(
            r#"See item [1]. {"tool": "read_file", "args": {"path": "a"}} and {"x": 1}"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "read_file");
    }

    #[test]
    fn test_non_call_json_is_skipped_before_call() {
        let calls = parse_fallback_calls(
            r#"Current settings {"depth": 2}; next step [{"name": "shell", "arguments": {"command": "ls"}}]"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "shell");
    }

    #[test]
    fn test_strip_fallback_calls_keeps_prose() {
        let text = r#"Summary so far. <tool_call name="write_file">{"path": "NOTES.md", "content": "x"}</tool_call>"#;
        assert_eq!(strip_fallback_calls(text), "Summary so far.");
        let text = "Done:\n```json\n{\"tool\": \"finish\", \"args\": {}}\n```\nthanks";
        assert_eq!(strip_fallback_calls(text), "Done:\n\nthanks");
        assert_eq!(strip_fallback_calls("  plain  "), "plain");
    }

    #[test]
    fn test_malformed_means_no_calls() {
        assert!(parse_fallback_calls("<tool_call>{not json</tool_call>").is_empty());
        assert!(parse_fallback_calls(r#"{"tool": "x", "args": "#).is_empty());
        assert!(parse_fallback_calls(r#"config is {"a": 1}"#).is_empty());
        assert!(parse_fallback_calls("The answer is 42.").is_empty());
        let reply = ModelReply::text("just text");
        assert!(extract_tool_calls(&reply, &reply.content).is_none());
    }
}
