//! 两种调度方式驱动同一个引擎
//!
//! - run_blocking：在调用线程上建一个 current-thread 运行时并 block_on，直到会话结束（CLI 单次调用）
//! - run_blocking_until：同上，另有一个中断信号（CLI 传入 Ctrl-C），触发即取消会话
//! - spawn_cooperative：在当前运行时上 spawn 为协作任务，挂起点让出调度器，UI 重绘与输入可以穿插（TUI）
//!
//! 两者执行的是同一个 ChatEngine::run，策略完全一致；前端只提供 Confirmer 与事件接收。

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::engine::events::{EngineEvent, EventSink, SessionOutcome};
use crate::engine::loop_::{ChatEngine, SessionContext};
use crate::memory::Message;
use crate::tools::Confirmer;

/// 阻塞式：调用线程上完整执行一次会话。不能在已有 tokio 运行时内调用
pub fn run_blocking(
    engine: &mut ChatEngine,
    initial_messages: Vec<Message>,
    session: &SessionContext,
) -> Result<SessionOutcome, AgentError> {
    let runtime = current_thread_runtime()?;
    runtime.block_on(engine.run(initial_messages, session))
}

/// 阻塞式 + 中断：interrupt 完成时取消会话，引擎照常收尾（未决调用记为 cancelled）
pub fn run_blocking_until<F>(
    engine: &mut ChatEngine,
    initial_messages: Vec<Message>,
    session: &SessionContext,
    interrupt: F,
) -> Result<SessionOutcome, AgentError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = current_thread_runtime()?;
    let result = runtime.block_on(async {
        let cancel = session.cancel.clone();
        let watcher = tokio::spawn(async move {
            interrupt.await;
            tracing::warn!("interrupt received, cancelling session");
            cancel.cancel();
        });
        let result = engine.run(initial_messages, session).await;
        watcher.abort();
        result
    });
    // 控制台确认可能还阻塞在 stdin 上，不等它
    runtime.shutdown_background();
    result
}

/// Ctrl-C 作为中断；平台不支持信号时永不触发
pub async fn ctrl_c_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime, AgentError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AgentError::FatalSession(format!("failed to start runtime: {e}")))
}

/// 协作式会话句柄：事件流 + 取消 + 结束后取回引擎
pub struct SessionHandle {
    events: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    cancel: CancellationToken,
    join: JoinHandle<(ChatEngine, Result<SessionOutcome, AgentError>)>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 非阻塞取一条事件（UI 每帧轮询）
    pub fn try_next_event(&mut self) -> Option<EngineEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    /// 等待下一条事件；事件通道关闭（会话结束）或已被取走时返回 None
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// 取出事件流；会话结束且事件读完后流结束。只能取一次
    pub fn take_event_stream(&mut self) -> Option<impl Stream<Item = EngineEvent>> {
        let rx = self.events.take()?;
        Some(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    /// 等待会话结束，取回引擎（对话与状态保留，可继续下一次 run）
    pub async fn join(self) -> Result<(ChatEngine, Result<SessionOutcome, AgentError>), JoinError> {
        self.join.await
    }
}

/// 协作式：spawn 到当前运行时；需在 tokio 运行时上下文中调用
pub fn spawn_cooperative(
    engine: ChatEngine,
    initial_messages: Vec<Message>,
    confirmer: Arc<dyn Confirmer>,
    cancel: CancellationToken,
) -> SessionHandle {
    let (sink, rx) = EventSink::channel();
    let session = SessionContext::new(confirmer, cancel.clone(), sink);
    let join = tokio::spawn(async move {
        let mut engine = engine;
        let result = engine.run(initial_messages, &session).await;
        (engine, result)
    });
    SessionHandle {
        events: Some(rx),
        cancel,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CheckpointOptions, CheckpointOrchestrator};
    use crate::llm::{ModelReply, ScriptedModelClient};
    use crate::memory::InMemoryCheckpointStore;
    use crate::tools::{AutoApprove, ToolExecutor, ToolRegistry};
    use futures_util::StreamExt;

    fn engine(reply: &str) -> ChatEngine {
        ChatEngine::new(
            Arc::new(ScriptedModelClient::replies(vec![ModelReply::text(reply)])),
            Arc::new(ToolExecutor::new(ToolRegistry::new(), 5)),
            CheckpointOrchestrator::new(
                Arc::new(InMemoryCheckpointStore::new()),
                CheckpointOptions::default(),
            ),
            "sys",
        )
    }

    #[test]
    fn test_run_blocking_completes_on_calling_thread() {
        let mut e = engine("blocking answer");
        let session = SessionContext::new(
            Arc::new(AutoApprove),
            CancellationToken::new(),
            EventSink::disabled(),
        );
        let out = run_blocking(&mut e, vec![Message::user("q")], &session).unwrap();
        assert_eq!(out.answer(), Some("blocking answer"));
        assert_eq!(e.conversation().len(), 3);
    }

    struct HangingModel;

    #[async_trait::async_trait]
    impl crate::llm::ModelClient for HangingModel {
        async fn send(
            &self,
            _messages: &[crate::memory::CanonicalRecord],
            _tools: &[crate::llm::ToolSpec],
        ) -> Result<ModelReply, crate::llm::ModelError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_interrupt_cancels_blocking_session() {
        let mut e = ChatEngine::new(
            Arc::new(HangingModel),
            Arc::new(ToolExecutor::new(ToolRegistry::new(), 5)),
            CheckpointOrchestrator::new(
                Arc::new(InMemoryCheckpointStore::new()),
                CheckpointOptions::default(),
            ),
            "sys",
        );
        let session = SessionContext::new(
            Arc::new(AutoApprove),
            CancellationToken::new(),
            EventSink::disabled(),
        );
        let out = run_blocking_until(&mut e, vec![Message::user("q")], &session, async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        })
        .unwrap();
        assert!(matches!(out, SessionOutcome::Cancelled));
        assert!(session.cancel.is_cancelled());
        assert!(e.conversation().unresolved_tool_calls().is_empty());
    }

    #[test]
    fn test_interrupt_that_never_fires_leaves_session_alone() {
        let mut e = engine("answer");
        let session = SessionContext::new(
            Arc::new(AutoApprove),
            CancellationToken::new(),
            EventSink::disabled(),
        );
        let out =
            run_blocking_until(&mut e, vec![Message::user("q")], &session, std::future::pending())
                .unwrap();
        assert_eq!(out.answer(), Some("answer"));
        assert!(!session.cancel.is_cancelled());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cooperative_streams_events_and_returns_engine() {
        let mut handle = spawn_cooperative(
            engine("coop answer"),
            vec![Message::user("q")],
            Arc::new(AutoApprove),
            CancellationToken::new(),
        );
        let events: Vec<EngineEvent> = handle.take_event_stream().unwrap().collect().await;
        assert!(matches!(events.first(), Some(EngineEvent::TurnStarted { turn: 1, .. })));
        assert!(matches!(events.last(), Some(EngineEvent::SessionTerminated { .. })));

        let (engine, result) = handle.join().await.unwrap();
        assert_eq!(result.unwrap().answer(), Some("coop answer"));
        assert_eq!(engine.conversation().len(), 3);
    }
}
