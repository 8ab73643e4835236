//! 核心编排层：错误与恢复、引擎构建、状态投影、会话监管、任务调度、主控循环

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use builder::{create_agent_builder, create_model_from_config, AgentBuilder};
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{create_agent, ChannelConfirmer, Command, ConfirmRequest};
pub use recovery::{RecoveryEngine, RetryPolicy};
pub use session_supervisor::SessionSupervisor;
pub use state::{AgentPhase, PendingConfirmation, UiState};
pub use task_scheduler::TaskScheduler;
