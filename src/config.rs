//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEECODE__*` 覆盖（双下划线表示嵌套，如 `BEECODE__ENGINE__TURNS_LIMIT=30`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::recovery::RetryPolicy;
use crate::engine::CheckpointOptions;
use crate::memory::DEFAULT_LOCK_STALE_AFTER;
use crate::tools::{PermissionCategory, PermissionDecision, PermissionPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub checkpoint: CheckpointSection,
}

/// [app] 段：应用名、工作区、system prompt 文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工作区根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
    /// 自定义 system prompt 文件（相对工作区）
    pub system_prompt_path: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任何 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// [engine] 段：轮数上限、工具并发、重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub turns_limit: u32,
    pub max_concurrent_tools: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            turns_limit: 20,
            max_concurrent_tools: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// [tools] 段：工具超时、Shell 白名单、权限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub shell: ShellSection,
    pub permissions: PermissionsSection,
    /// 所有需确认的调用自动放行（不覆盖 deny）
    pub auto_approve_all: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            shell: ShellSection::default(),
            permissions: PermissionsSection::default(),
            auto_approve_all: false,
        }
    }
}

impl ToolsSection {
    pub fn permission_policy(&self) -> PermissionPolicy {
        let p = &self.permissions;
        PermissionPolicy::default()
            .with_decision(PermissionCategory::ReadOnly, p.read_only)
            .with_decision(PermissionCategory::Write, p.write)
            .with_decision(PermissionCategory::Execute, p.execute)
            .with_decision(PermissionCategory::Network, p.network)
            .with_auto_approve_all(self.auto_approve_all)
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: [
                "ls", "grep", "cat", "head", "tail", "wc", "find", "cargo", "rustc", "git",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// [tools.permissions] 段：各权限分类的处理方式 auto | confirm | deny
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PermissionsSection {
    pub read_only: PermissionDecision,
    pub write: PermissionDecision,
    pub execute: PermissionDecision,
    pub network: PermissionDecision,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self {
            read_only: PermissionDecision::Auto,
            write: PermissionDecision::Confirm,
            execute: PermissionDecision::Confirm,
            network: PermissionDecision::Confirm,
        }
    }
}

/// [checkpoint] 段：检查点文件与编排参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// 检查点文件（相对工作区）
    pub path: PathBuf,
    /// 生成摘要时取最近多少条消息
    pub window_messages: usize,
    /// 生成检查点时是否允许执行写类工具
    pub allow_write_tools: bool,
    pub lock_attempts: u32,
    pub lock_retry_ms: u64,
    /// 锁文件超过该秒数未更新即视为陈旧锁（持有进程崩溃遗留）
    pub lock_stale_secs: u64,
    /// 启动时若存在检查点则先恢复
    pub restore_on_start: bool,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        let options = CheckpointOptions::default();
        Self {
            path: PathBuf::from(".beecode/checkpoint.json"),
            window_messages: options.window_messages,
            allow_write_tools: options.allow_write_tools,
            lock_attempts: options.lock_attempts,
            lock_retry_ms: options.lock_retry_ms,
            lock_stale_secs: DEFAULT_LOCK_STALE_AFTER.as_secs(),
            restore_on_start: options.restore_on_start,
        }
    }
}

impl CheckpointSection {
    pub fn options(&self) -> CheckpointOptions {
        CheckpointOptions {
            window_messages: self.window_messages,
            allow_write_tools: self.allow_write_tools,
            lock_attempts: self.lock_attempts,
            lock_retry_ms: self.lock_retry_ms,
            restore_on_start: self.restore_on_start,
        }
    }
}

impl AppConfig {
    /// 工作区：配置值优先，否则当前目录
    pub fn workspace(&self) -> PathBuf {
        self.app
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// 检查点文件的绝对位置
    pub fn checkpoint_path(&self, workspace: &Path) -> PathBuf {
        if self.checkpoint.path.is_absolute() {
            self.checkpoint.path.clone()
        } else {
            workspace.join(&self.checkpoint.path)
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEECODE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEECODE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEECODE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时回退默认配置并告警
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    })
}
