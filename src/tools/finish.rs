//! finish：终结类工具，模型用它给出最终答案并结束会话

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{PermissionCategory, Tool};

pub struct FinishTool;

#[async_trait]
impl Tool for FinishTool {
    fn name(&self) -> &str {
        "finish"
    }

    fn description(&self) -> &str {
        "End the session with a final answer for the user. Args: {\"answer\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "answer": {"type": "string", "description": "Final answer shown to the user"}
            },
            "required": ["answer"]
        })
    }

    fn permission(&self) -> PermissionCategory {
        PermissionCategory::ReadOnly
    }

    fn is_terminal(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        Ok(args
            .get("answer")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}
