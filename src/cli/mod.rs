//! CLI 前端：单次阻塞式会话
//!
//! 在调用线程上阻塞驱动引擎；事件由独立线程打印到 stderr，确认走控制台提示（--yes 时自动同意）。
//! Ctrl-C 取消会话而不是直接杀进程：未决调用记为 cancelled，检查点锁照常释放。

pub mod console;

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{AgentBuilder, AgentError};
use crate::engine::{ctrl_c_signal, run_blocking_until, EventSink, SessionContext, SessionOutcome};
use crate::memory::Message;
use crate::tools::{AutoApprove, Confirmer};

pub use console::{format_event, ConsoleConfirmer};

/// 执行一次会话并返回结果；engine 结束前事件已全部打印
pub fn run_once(
    builder: &AgentBuilder,
    prompt: &str,
    auto_approve: bool,
) -> Result<SessionOutcome, AgentError> {
    let confirmer: Arc<dyn Confirmer> = if auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(ConsoleConfirmer)
    };
    run_with(builder, prompt, confirmer, ctrl_c_signal(), |line| {
        eprintln!("{line}")
    })
}

/// 可注入确认者、中断信号与输出的版本（测试用）
pub fn run_with(
    builder: &AgentBuilder,
    prompt: &str,
    confirmer: Arc<dyn Confirmer>,
    interrupt: impl Future<Output = ()> + Send + 'static,
    print: impl Fn(String) + Send + 'static,
) -> Result<SessionOutcome, AgentError> {
    let mut engine = builder.build_engine();
    let session_id = Uuid::new_v4();
    tracing::info!(%session_id, model = engine.model_name(), "cli session started");

    let (sink, mut rx) = EventSink::channel();
    let printer = std::thread::spawn(move || {
        while let Some(event) = rx.blocking_recv() {
            if let Some(line) = format_event(&event) {
                print(line);
            }
        }
    });

    let result = {
        let session = SessionContext::new(confirmer, CancellationToken::new(), sink);
        run_blocking_until(&mut engine, vec![Message::user(prompt)], &session, interrupt)
    };
    if printer.join().is_err() {
        tracing::warn!("event printer thread panicked");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::llm::{ModelReply, ScriptedModelClient};
    use crate::memory::{InMemoryCheckpointStore, ToolCallRequest};
    use crate::tools::DenyAll;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_run_with_prints_progress_and_returns_answer() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModelClient::replies(vec![
            ModelReply::with_tool_calls(
                "",
                vec![ToolCallRequest::new("s1", "shell", json!({"command": "ls"}))],
            ),
            ModelReply::text("done"),
        ]);
        let builder = AgentBuilder::new(AppConfig::default(), dir.path().to_path_buf())
            .with_model(Arc::new(model))
            .with_checkpoint_store(Arc::new(InMemoryCheckpointStore::new()));

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let out = run_with(
            &builder,
            "list",
            Arc::new(DenyAll),
            std::future::pending(),
            move |l| sink.lock().unwrap().push(l),
        )
        .unwrap();

        assert_eq!(out.answer(), Some("done"));
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.starts_with("  shell declined")));
        assert!(lines.iter().any(|l| l == "· turn 2/20"));
    }

    struct NeverAnswers;

    #[async_trait::async_trait]
    impl Confirmer for NeverAnswers {
        async fn confirm(
            &self,
            _call: &ToolCallRequest,
            _diff: Option<&str>,
        ) -> crate::tools::ConfirmDecision {
            std::future::pending().await
        }
    }

    #[test]
    fn test_interrupt_during_confirmation_cancels_session() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModelClient::replies(vec![
            ModelReply::with_tool_calls(
                "",
                vec![ToolCallRequest::new("s1", "shell", json!({"command": "ls"}))],
            ),
            ModelReply::text("never reached"),
        ]);
        let builder = AgentBuilder::new(AppConfig::default(), dir.path().to_path_buf())
            .with_model(Arc::new(model))
            .with_checkpoint_store(Arc::new(InMemoryCheckpointStore::new()));

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let out = run_with(
            &builder,
            "list",
            Arc::new(NeverAnswers),
            async { tokio::time::sleep(std::time::Duration::from_millis(20)).await },
            move |l| sink.lock().unwrap().push(l),
        )
        .unwrap();

        assert_eq!(out, SessionOutcome::Cancelled);
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.starts_with("  shell declined")));
    }
}
