//! 会话级错误类型与恢复动作
//!
//! 只有不可恢复的错误（Provider 致命失败、检查点锁拿不到等）会从引擎 run() 中传出；
//! 工具级错误在 ToolExecutor 内折叠为结果消息，不走这里。

use thiserror::Error;

use crate::llm::ModelError;
use crate::memory::CheckpointError;

/// 会话运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 瞬时 Provider 错误（重试用尽前由 RecoveryEngine 消化）
    #[error("Transient provider error: {0}")]
    TransientProvider(ModelError),

    /// 会话终止：重试耗尽或不可重试的 Provider 错误等
    #[error("Fatal session error: {0}")]
    FatalSession(String),

    /// 仅对检查点步骤致命；引擎报告后不带检查点继续
    #[error("Checkpoint io error: {0}")]
    CheckpointIo(#[from] CheckpointError),

    #[error("Checkpoint lock unavailable after {attempts} attempts")]
    CheckpointLockUnavailable { attempts: u32 },

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 对话不变量被破坏（如孤立的 tool 结果）
    #[error("Conversation invariant violated: {0}")]
    Invariant(String),

    #[error("Cancelled by user")]
    Cancelled,
}

impl AgentError {
    /// 是否应结束会话
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AgentError::TransientProvider(_) | AgentError::CheckpointIo(_))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后重试同一请求
    RetryAfter { delay_ms: u64, attempt: u32 },
    /// 放弃，升级为 FatalSession
    Escalate(String),
}
