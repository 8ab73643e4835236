//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / permission / execute），
//! 由 ToolRegistry 按名注册与查找；ToolExecutor 在其上执行统一的权限与确认策略。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ToolSpec;

/// 工具的静态权限分类；运行期不可变
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    /// 只读（读文件、列目录）
    ReadOnly,
    /// 写文件；确认时附带 diff
    Write,
    /// 执行命令
    Execute,
    /// 访问网络
    Network,
}

impl fmt::Display for PermissionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionCategory::ReadOnly => "read_only",
            PermissionCategory::Write => "write",
            PermissionCategory::Execute => "execute",
            PermissionCategory::Network => "network",
        };
        f.write_str(s)
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、权限分类、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（结构化调用中的 function.name，回退格式中的 "tool"/"name"）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 权限分类；未声明的工具按执行类处理
    fn permission(&self) -> PermissionCategory {
        PermissionCategory::Execute
    }

    /// 成功执行后是否结束会话（如 finish）
    fn is_terminal(&self) -> bool {
        false
    }

    /// 写类工具：为确认提示生成拟议改动的 diff（参数已通过校验）
    async fn propose_diff(&self, _args: &Value) -> Option<String> {
        None
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称有序存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 名称解析：精确匹配优先，其次忽略大小写与首尾空白
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let trimmed = name.trim();
        self.get(trimmed).or_else(|| {
            self.tools
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(trimmed))
                .map(|(_, t)| t.clone())
        })
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 给模型的工具声明
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
