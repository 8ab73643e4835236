//! 引擎构建器：统一的引擎初始化逻辑
//!
//! CLI 与 TUI 共用同一套模型、工具、权限策略与检查点存储，只有前端协作者不同。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{RecoveryEngine, TaskScheduler};
use crate::engine::{ChatEngine, CheckpointOrchestrator};
use crate::llm::{MockModelClient, ModelClient, OpenAiClient};
use crate::memory::{CheckpointStore, FileCheckpointStore};
use crate::tools::{builtin_registry, fallback_call_schema_json, ToolExecutor, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Beecode, a careful coding assistant working inside the user's workspace. \
Use the provided tools to inspect and change files. When the task is complete, reply with a plain answer or call the finish tool.";

/// 按配置创建模型客户端：provider = mock，或找不到 API Key 时回退 Mock
pub fn create_model_from_config(config: &AppConfig) -> Arc<dyn ModelClient> {
    let llm = &config.llm;
    if llm.provider.eq_ignore_ascii_case("mock") {
        return Arc::new(MockModelClient);
    }
    match std::env::var(&llm.api_key_env) {
        Ok(key) if !key.trim().is_empty() => Arc::new(OpenAiClient::new(
            llm.base_url.as_deref(),
            &llm.model,
            key.trim(),
            llm.request_timeout_secs,
        )),
        _ => {
            tracing::warn!(
                env = %llm.api_key_env,
                "API key not set, falling back to mock model"
            );
            Arc::new(MockModelClient)
        }
    }
}

/// 引擎构建器：统一配置和初始化引擎的各个组件
pub struct AgentBuilder {
    config: AppConfig,
    workspace: PathBuf,
    system_prompt: String,
    model: Option<Arc<dyn ModelClient>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    registry: Option<ToolRegistry>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            model: None,
            checkpoint_store: None,
            registry: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// 从 [app].system_prompt_path 加载系统提示词；文件不存在时保留默认
    pub fn with_system_prompt_from_file(mut self) -> Self {
        let Some(rel) = self.config.app.system_prompt_path.clone() else {
            return self;
        };
        let path = if rel.is_absolute() {
            rel
        } else {
            self.workspace.join(rel)
        };
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => self.system_prompt = text,
            Ok(_) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "system prompt not loaded"),
        }
        self
    }

    /// 替换模型客户端（测试用脚本模型）
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_turns_limit(mut self, turns_limit: u32) -> Self {
        self.config.engine.turns_limit = turns_limit;
        self
    }

    pub fn with_restore_on_start(mut self, enabled: bool) -> Self {
        self.config.checkpoint.restore_on_start = enabled;
        self
    }

    pub fn with_auto_approve_all(mut self, enabled: bool) -> Self {
        self.config.tools.auto_approve_all = enabled;
        self
    }

    /// 构建统一的工具注册表（CLI 与 TUI 共享同一套工具）
    pub fn build_tool_registry(&self) -> ToolRegistry {
        match &self.registry {
            Some(r) => r.clone(),
            None => builtin_registry(
                &self.workspace,
                self.config.tools.shell.allowed_commands.clone(),
            ),
        }
    }

    pub fn build_model(&self) -> Arc<dyn ModelClient> {
        match &self.model {
            Some(m) => m.clone(),
            None => create_model_from_config(&self.config),
        }
    }

    /// 完整系统提示词：基础提示 + 工具清单 + 回退调用格式 Schema
    pub fn build_full_system_prompt(&self, registry: &ToolRegistry) -> String {
        if registry.is_empty() {
            return self.system_prompt.clone();
        }
        let tools = registry
            .specs()
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "{}\n\n## Tools\n{}\n\n## Text tool call format\nIf native tool calls are unavailable, emit a JSON object (or <tool_call> block) matching this schema:\n```json\n{}\n```",
            self.system_prompt,
            tools,
            fallback_call_schema_json()
        )
    }

    pub fn build_executor(&self, registry: ToolRegistry) -> ToolExecutor {
        ToolExecutor::new(registry, self.config.tools.tool_timeout_secs)
            .with_policy(self.config.tools.permission_policy())
            .with_scheduler(TaskScheduler::new(self.config.engine.max_concurrent_tools))
    }

    pub fn build_checkpoint(&self) -> CheckpointOrchestrator {
        let store = match &self.checkpoint_store {
            Some(s) => s.clone(),
            None => Arc::new(
                FileCheckpointStore::new(self.config.checkpoint_path(&self.workspace))
                    .with_stale_after(Duration::from_secs(self.config.checkpoint.lock_stale_secs)),
            ),
        };
        CheckpointOrchestrator::new(store, self.config.checkpoint.options())
    }

    /// 构建完整的 ChatEngine
    pub fn build_engine(&self) -> ChatEngine {
        let registry = self.build_tool_registry();
        let system_prompt = self.build_full_system_prompt(&registry);
        let executor = self.build_executor(registry);
        ChatEngine::new(
            self.build_model(),
            Arc::new(executor),
            self.build_checkpoint(),
            system_prompt,
        )
        .with_turns_limit(self.config.engine.turns_limit)
        .with_recovery(RecoveryEngine::new(self.config.engine.retry))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// 便捷函数：加载配置、确定工作区并创建 AgentBuilder
pub fn create_agent_builder(
    config_path: Option<&Path>,
    workspace_override: Option<PathBuf>,
) -> AgentBuilder {
    let config = crate::config::load_config_or_default(config_path);
    let workspace = workspace_override.unwrap_or_else(|| config.workspace());
    let workspace = workspace.canonicalize().unwrap_or(workspace);
    AgentBuilder::new(config, workspace).with_system_prompt_from_file()
}
