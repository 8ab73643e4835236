//! 对话编排引擎：主循环、工具调用提取、检查点编排、事件与两种调度驱动

pub mod checkpoint;
pub mod driver;
pub mod events;
pub mod loop_;
pub mod parser;

pub use checkpoint::{
    restore_message, CheckpointOptions, CheckpointOrchestrator, CheckpointPhase, CheckpointReport,
};
pub use driver::{ctrl_c_signal, run_blocking, run_blocking_until, spawn_cooperative, SessionHandle};
pub use events::{CheckpointBranch, EngineEvent, EventSink, SessionOutcome};
pub use loop_::{ChatEngine, IterationState, SessionContext};
pub use parser::{extract_tool_calls, parse_fallback_calls, CallForm, ExtractedCalls};
