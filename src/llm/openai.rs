//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url，DeepSeek / OpenAI / 自建代理）；
//! 请求携带结构化 tools，回复的 ChatCompletionResponseMessage 经消息契约归一为 ModelReply。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{CreateChatCompletionRequest, CreateChatCompletionResponse};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{ModelClient, ModelError, ModelReply, TokenUsage, ToolSpec};
use crate::memory::{get_content, get_tool_calls, CanonicalRecord, Role};

/// 429 未给出等待时间时的默认退避
const DEFAULT_RATE_LIMIT_WAIT_MS: u64 = 1_000;

/// 累计 token 统计
#[derive(Debug, Clone, Default)]
pub struct UsageCounter {
    prompt_tokens: Arc<AtomicU64>,
    completion_tokens: Arc<AtomicU64>,
}

impl UsageCounter {
    pub fn add(&self, usage: TokenUsage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
        }
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: UsageCounter,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, timeout_secs: u64) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .unwrap_or_default();

        Self {
            client: Client::with_config(config).with_http_client(http),
            model: model.to_string(),
            usage: UsageCounter::default(),
        }
    }

    /// 规范记录与工具描述 -> 请求体；wire JSON 经 serde 进入 async_openai 的请求类型
    fn build_request(
        &self,
        messages: &[CanonicalRecord],
        tools: &[ToolSpec],
    ) -> Result<CreateChatCompletionRequest, ModelError> {
        let messages: Vec<Value> = messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        serde_json::from_value(body).map_err(|e| ModelError::BadRequest(e.to_string()))
    }
}

/// 规范记录 -> OpenAI wire 格式
fn wire_message(m: &CanonicalRecord) -> Value {
    let role = match m.role {
        Role::Unknown => "user",
        r => r.as_str(),
    };
    let mut v = json!({ "role": role, "content": m.content });
    if !m.tool_calls.is_empty() {
        v["tool_calls"] = m
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.tool_name, "arguments": c.arguments.to_string()}
                })
            })
            .collect();
    }
    if let Some(id) = &m.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    v
}

/// 响应 -> ModelReply；首条 choice 的 message 直接走消息契约（content 可为 null）
fn reply_from_response(response: CreateChatCompletionResponse) -> Result<ModelReply, ModelError> {
    let usage = response.usage.as_ref().map(|u| TokenUsage {
        prompt_tokens: u.prompt_tokens as u64,
        completion_tokens: u.completion_tokens as u64,
    });
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::MalformedResponse("response has no choices".to_string()))?;
    let message = serde_json::to_value(&choice.message)
        .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
    Ok(ModelReply {
        content: get_content(&message),
        tool_calls: get_tool_calls(&message),
        usage,
    })
}

fn classify_error(err: OpenAIError) -> ModelError {
    match err {
        OpenAIError::Reqwest(e) if e.is_timeout() => ModelError::Timeout,
        OpenAIError::Reqwest(e) => ModelError::Connection(e.to_string()),
        OpenAIError::ApiError(api) => classify_api_message(api.to_string()),
        other => ModelError::MalformedResponse(other.to_string()),
    }
}

/// API 错误体只带文字说明，按关键字归类
fn classify_api_message(message: String) -> ModelError {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        ModelError::RateLimited {
            retry_after_ms: DEFAULT_RATE_LIMIT_WAIT_MS,
        }
    } else if lower.contains("api key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("401")
    {
        ModelError::Auth(message)
    } else if lower.contains("overloaded")
        || lower.contains("server error")
        || lower.contains("internal error")
        || lower.contains("503")
        || lower.contains("502")
        || lower.contains("500")
    {
        ModelError::Server {
            status: 500,
            message,
        }
    } else {
        ModelError::BadRequest(message)
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn send(
        &self,
        messages: &[CanonicalRecord],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError> {
        let request = self.build_request(messages, tools)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify_error)?;

        let reply = reply_from_response(response)?;
        if let Some(usage) = reply.usage {
            self.usage.add(usage);
        }
        Ok(reply)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCallRequest;

    fn client() -> OpenAiClient {
        OpenAiClient::new(Some("http://localhost:9/v1/"), "gpt-test", "sk-test", 5)
    }

    #[test]
    fn test_build_request_carries_history_and_tools() {
        let records = vec![
            CanonicalRecord {
                role: Role::System,
                content: "sys".to_string(),
                tool_calls: vec![],
                tool_call_id: None,
            },
            CanonicalRecord {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: vec![ToolCallRequest::new("c1", "read_file", json!({"path": "a"}))],
                tool_call_id: None,
            },
            CanonicalRecord {
                role: Role::Tool,
                content: "contents".to_string(),
                tool_calls: vec![],
                tool_call_id: Some("c1".to_string()),
            },
        ];
        let tools = vec![ToolSpec {
            name: "read_file".to_string(),
            description: "read".to_string(),
            parameters: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        }];
        let request = client().build_request(&records, &tools).unwrap();
        assert_eq!(request.model, "gpt-test");
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.tools.map(|t| t.len()), Some(1));
    }

    #[test]
    fn test_reply_from_response_null_content_with_tool_calls() {
        let response: CreateChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-test",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"a.rs\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13}
        }))
        .unwrap();
        let reply = reply_from_response(response).unwrap();
        assert_eq!(reply.content, "");
        assert_eq!(
            reply.tool_calls,
            vec![ToolCallRequest::new("call_1", "read_file", json!({"path": "a.rs"}))]
        );
        assert_eq!(reply.usage.map(|u| u.total()), Some(13));
    }

    #[test]
    fn test_reply_from_response_without_choices() {
        let response: CreateChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-test",
            "choices": []
        }))
        .unwrap();
        assert!(matches!(
            reply_from_response(response),
            Err(ModelError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_wire_message_roundtrips_tool_fields() {
        let record = CanonicalRecord {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: vec![ToolCallRequest::new("c1", "ls", json!({}))],
            tool_call_id: None,
        };
        let wire = wire_message(&record);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "ls");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{}");
        assert!(wire.get("tool_call_id").is_none());
    }

    #[test]
    fn test_api_error_classification() {
        assert!(classify_api_message("Rate limit reached for requests".to_string()).is_transient());
        assert!(classify_api_message("The server is overloaded".to_string()).is_transient());
        assert!(matches!(
            classify_api_message("Incorrect API key provided".to_string()),
            ModelError::Auth(_)
        ));
        assert!(matches!(
            classify_api_message("Invalid parameter: messages".to_string()),
            ModelError::BadRequest(_)
        ));
    }
}
