//! 工具参数校验与回退格式 Schema
//!
//! validate_arguments 用 jsonschema 校验模型给出的参数，返回出错字段列表；
//! fallback_call_schema_json 用 schemars 生成回退格式（文本内嵌 JSON 调用）的 Schema，拼入 system prompt。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 回退格式的工具调用：与解析器接受的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct FallbackCallFormat {
    /// 工具名，如 read_file、list_dir、write_file、edit_file、shell、finish
    pub tool: String,
    /// 工具参数，依工具不同而不同（path、content、command、answer 等）
    pub args: HashMap<String, Value>,
}

/// 返回回退格式工具调用的 JSON Schema 字符串
pub fn fallback_call_schema_json() -> String {
    let schema = schema_for!(FallbackCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 按工具声明的 JSON Schema 校验参数；失败时返回每个出错位置的描述（含字段名）
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), Vec<String>> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            // 工具自身 schema 写错不应阻断调用
            tracing::warn!(error = %e, "invalid tool schema, skipping validation");
            return Ok(());
        }
    };
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let at = e.instance_path.to_string();
            if at.is_empty() {
                e.to_string()
            } else {
                format!("{at}: {e}")
            }
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
