//! 控制台协作者：阻塞式确认提示与事件打印
//!
//! 提示与事件写 stderr，stdout 只留给最终回答，便于管道使用。

use std::io::{self, BufRead, Write};

use async_trait::async_trait;

use crate::engine::{CheckpointBranch, EngineEvent, SessionOutcome};
use crate::memory::ToolCallRequest;
use crate::tools::{ConfirmDecision, Confirmer};

/// 控制台确认：打印调用与 diff，读一行 y/N；读失败或 EOF 视为拒绝
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleConfirmer;

/// 只有 y / yes（大小写不敏感）算同意
pub fn parse_answer(line: &str) -> ConfirmDecision {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ConfirmDecision::Approved,
        _ => ConfirmDecision::Denied,
    }
}

pub fn confirmation_prompt(call: &ToolCallRequest, diff: Option<&str>) -> String {
    let mut out = format!("\n? Run {} {}\n", call.tool_name, call.arguments);
    if let Some(diff) = diff {
        out.push_str(diff);
        if !diff.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str("Approve? [y/N] ");
    out
}

#[async_trait]
impl Confirmer for ConsoleConfirmer {
    async fn confirm(&self, call: &ToolCallRequest, diff: Option<&str>) -> ConfirmDecision {
        let prompt = confirmation_prompt(call, diff);
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(prompt.as_bytes());
            let _ = stderr.flush();
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line),
            }
        })
        .await;
        match answer {
            Ok(Some(line)) => parse_answer(&line),
            _ => ConfirmDecision::Denied,
        }
    }
}

/// 事件 → 一行进度文本；不需要展示的事件返回 None
pub fn format_event(event: &EngineEvent) -> Option<String> {
    let line = match event {
        EngineEvent::TurnStarted { turn, turns_limit } => format!("· turn {turn}/{turns_limit}"),
        EngineEvent::ModelRetry {
            attempt,
            delay_ms,
            reason,
        } => format!("! model error ({reason}), retry #{attempt} in {delay_ms}ms"),
        EngineEvent::AssistantMessage { .. } | EngineEvent::TurnCompleted { .. } => return None,
        EngineEvent::ToolStarted {
            tool, permission, ..
        } => format!("▶ {tool} [{permission}]"),
        EngineEvent::ToolCompleted {
            tool,
            status,
            preview,
            ..
        } => format!(
            "  {tool} {status}: {}",
            preview.lines().next().unwrap_or_default()
        ),
        EngineEvent::CheckpointTriggered { turns_taken } => {
            format!("· checkpoint after {turns_taken} turns")
        }
        EngineEvent::CheckpointCompleted {
            branch,
            cycle_count,
        } => match (branch, cycle_count) {
            (CheckpointBranch::ResetOnly, _) => "· conversation reset without checkpoint".to_string(),
            (_, Some(c)) => format!("· checkpoint ready (cycle {c})"),
            (_, None) => "· checkpoint ready".to_string(),
        },
        EngineEvent::CheckpointFailed { reason } => format!("! checkpoint failed: {reason}"),
        EngineEvent::SessionTerminated { outcome } => match outcome {
            SessionOutcome::Cancelled => "· cancelled".to_string(),
            _ => return None,
        },
        EngineEvent::SessionFailed { error } => format!("✗ {error}"),
    };
    Some(line)
}
