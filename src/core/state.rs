//! 状态定义：UiState 投影
//!
//! UI 只持有轻量的 UiState（阶段、历史、活动日志、待确认调用、错误）；
//! 编排器把引擎事件与会话结束结果投影到 UiState，前端从不直接改动对话。

use serde::Serialize;

use crate::engine::{CheckpointBranch, EngineEvent, IterationState, SessionOutcome};
use crate::memory::Message;
use crate::tools::ToolStatus;

/// 活动日志最多保留的条数
const MAX_ACTIVITY: usize = 200;

/// UI 看到的「投影」状态，轻量且易于渲染
#[derive(Clone, Debug, Default, Serialize)]
pub struct UiState {
    pub phase: AgentPhase,
    pub history: Vec<Message>,
    /// 由引擎事件生成的活动日志
    pub activity: Vec<String>,
    pub active_tool: Option<String>,
    pub input_locked: bool,
    /// 行内错误提示；不会导致界面退出
    pub error_message: Option<String>,
    pub pending_confirmation: Option<PendingConfirmation>,
    pub iteration: IterationState,
    pub model_name: String,
}

/// Agent 阶段（UI 投影用）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum AgentPhase {
    #[default]
    Idle,
    Thinking,
    ToolExecuting,
    AwaitingConfirmation,
    Checkpointing,
    Error,
}

/// 等待用户 y/n 的工具调用
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingConfirmation {
    pub tool_name: String,
    pub arguments: String,
    pub diff: Option<String>,
}

impl UiState {
    pub fn log(&mut self, line: impl Into<String>) {
        self.activity.push(line.into());
        if self.activity.len() > MAX_ACTIVITY {
            let overflow = self.activity.len() - MAX_ACTIVITY;
            self.activity.drain(..overflow);
        }
    }

    /// 把一个引擎事件投影到 UI 状态
    pub fn apply_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::TurnStarted { turn, turns_limit } => {
                self.phase = AgentPhase::Thinking;
                self.iteration.turns_taken = turn.saturating_sub(1);
                self.iteration.turns_limit = *turns_limit;
            }
            EngineEvent::ModelRetry {
                attempt,
                delay_ms,
                reason,
            } => self.log(format!("retry #{attempt} in {delay_ms}ms: {reason}")),
            EngineEvent::AssistantMessage { .. } => {}
            EngineEvent::ToolStarted {
                tool, permission, ..
            } => {
                if self.pending_confirmation.is_none() {
                    self.phase = AgentPhase::ToolExecuting;
                }
                self.active_tool = Some(tool.clone());
                self.log(format!("▶ {tool} [{permission}]"));
            }
            EngineEvent::ToolCompleted {
                tool,
                status,
                preview,
                ..
            } => {
                let mark = match status {
                    ToolStatus::Success => "✓",
                    ToolStatus::Declined => "⊘",
                    ToolStatus::Error => "✗",
                };
                self.active_tool = None;
                self.log(format!("{mark} {tool}: {}", first_line(preview)));
            }
            EngineEvent::CheckpointTriggered { turns_taken } => {
                self.phase = AgentPhase::Checkpointing;
                self.log(format!("checkpoint after {turns_taken} turns"));
            }
            EngineEvent::CheckpointCompleted {
                branch,
                cycle_count,
            } => {
                let what = match branch {
                    CheckpointBranch::Restored => "restored",
                    CheckpointBranch::Created => "created",
                    CheckpointBranch::ResetOnly => "reset",
                };
                let cycle = cycle_count.map(|c| format!(" #{c}")).unwrap_or_default();
                self.iteration.turns_taken = 0;
                self.log(format!("checkpoint {what}{cycle}"));
            }
            EngineEvent::CheckpointFailed { reason } => {
                self.log(format!("checkpoint failed: {reason}"));
            }
            EngineEvent::TurnCompleted {
                turn,
                tokens_accumulated,
            } => {
                self.iteration.turns_taken = *turn;
                self.iteration.tokens_accumulated = *tokens_accumulated;
            }
            EngineEvent::SessionTerminated { outcome } => {
                let line = match outcome {
                    SessionOutcome::FinalAnswer { .. } => "session finished".to_string(),
                    SessionOutcome::TerminalTool { tool, .. } => format!("session ended by {tool}"),
                    SessionOutcome::Cancelled => "session cancelled".to_string(),
                };
                self.log(line);
            }
            EngineEvent::SessionFailed { error } => {
                self.phase = AgentPhase::Error;
                self.error_message = Some(error.clone());
            }
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::PermissionCategory;

    #[test]
    fn test_tool_events_drive_phase_and_log() {
        let mut s = UiState::default();
        s.apply_event(&EngineEvent::ToolStarted {
            tool_call_id: "1".into(),
            tool: "shell".into(),
            permission: PermissionCategory::Execute,
        });
        assert_eq!(s.phase, AgentPhase::ToolExecuting);
        assert_eq!(s.active_tool.as_deref(), Some("shell"));

        s.apply_event(&EngineEvent::ToolCompleted {
            tool_call_id: "1".into(),
            tool: "shell".into(),
            status: ToolStatus::Declined,
            preview: "declined\nmore".into(),
        });
        assert!(s.active_tool.is_none());
        assert_eq!(s.activity.last().map(String::as_str), Some("⊘ shell: declined"));
    }

    #[test]
    fn test_failure_sets_inline_error() {
        let mut s = UiState::default();
        s.apply_event(&EngineEvent::SessionFailed { error: "boom".into() });
        assert_eq!(s.phase, AgentPhase::Error);
        assert_eq!(s.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_activity_is_bounded() {
        let mut s = UiState::default();
        for i in 0..(MAX_ACTIVITY + 5) {
            s.log(format!("{i}"));
        }
        assert_eq!(s.activity.len(), MAX_ACTIVITY);
        assert_eq!(s.activity[0], "5");
    }
}
