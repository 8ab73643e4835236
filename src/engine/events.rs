//! 引擎事件：引擎 → 前端的唯一输出面
//!
//! 引擎只产出结构化事件，不格式化展示文本；CLI 打印到 stderr，TUI 转为活动日志与状态栏。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::tools::{PermissionCategory, ToolStatus};

/// 会话结束原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// 模型给出纯文本回答
    FinalAnswer { text: String },
    /// 终结类工具（finish）结束会话
    TerminalTool { tool: String, answer: String },
    /// 用户取消
    Cancelled,
}

impl SessionOutcome {
    /// 呈现给用户的最终文本
    pub fn answer(&self) -> Option<&str> {
        match self {
            SessionOutcome::FinalAnswer { text } => Some(text),
            SessionOutcome::TerminalTool { answer, .. } => Some(answer),
            SessionOutcome::Cancelled => None,
        }
    }
}

/// 检查点走了哪个分支
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBranch {
    Restored,
    Created,
    /// 检查点 I/O 失败，仅重置对话
    ResetOnly,
}

/// 单个引擎事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 开始新一轮（turn 从 1 计）
    TurnStarted { turn: u32, turns_limit: u32 },
    /// 瞬时 Provider 错误，等待后重试
    ModelRetry {
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// 模型回复的文本部分（可能伴随工具调用）
    AssistantMessage { content: String },
    ToolStarted {
        tool_call_id: String,
        tool: String,
        permission: PermissionCategory,
    },
    ToolCompleted {
        tool_call_id: String,
        tool: String,
        status: ToolStatus,
        preview: String,
    },
    CheckpointTriggered { turns_taken: u32 },
    CheckpointCompleted {
        branch: CheckpointBranch,
        cycle_count: Option<u64>,
    },
    /// 检查点步骤失败；会话继续
    CheckpointFailed { reason: String },
    TurnCompleted {
        turn: u32,
        tokens_accumulated: u64,
    },
    SessionTerminated { outcome: SessionOutcome },
    /// 致命错误（随后 run() 返回 Err）
    SessionFailed { error: String },
}

/// 事件出口：无接收方时静默丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// 返回 sink 与对应接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// 截断预览（按字符）
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let v = serde_json::to_value(EngineEvent::CheckpointTriggered { turns_taken: 20 }).unwrap();
        assert_eq!(v["type"], "checkpoint_triggered");
        assert_eq!(v["turns_taken"], 20);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo", 2), "hé...");
        assert_eq!(preview("hi", 5), "hi");
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(EngineEvent::TurnStarted { turn: 1, turns_limit: 3 });
        sink.emit(EngineEvent::CheckpointFailed { reason: "disk".into() });
        assert!(matches!(rx.recv().await, Some(EngineEvent::TurnStarted { turn: 1, .. })));
        assert!(matches!(rx.recv().await, Some(EngineEvent::CheckpointFailed { .. })));
        EventSink::disabled().emit(EngineEvent::CheckpointFailed { reason: "x".into() });
    }
}
