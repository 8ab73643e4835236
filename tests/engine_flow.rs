//! 对话引擎端到端场景：检查点、混合批次、回退格式、取消、启动恢复

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beecode::config::AppConfig;
use beecode::core::{AgentBuilder, AgentError, TaskScheduler};
use beecode::engine::{
    spawn_cooperative, ChatEngine, CheckpointBranch, CheckpointOptions, CheckpointOrchestrator,
    EngineEvent, EventSink, SessionContext, SessionOutcome,
};
use beecode::llm::{ModelError, ModelReply, ScriptedModelClient};
use beecode::memory::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, Message, Role, ToolCallRequest,
};
use beecode::tools::{
    builtin_registry, AutoApprove, ConfirmDecision, PermissionCategory, ScriptedConfirmer, Tool,
    ToolExecutor, ToolRegistry, ToolStatus,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

fn engine_with(
    model: ScriptedModelClient,
    registry: ToolRegistry,
    store: Arc<dyn CheckpointStore>,
    turns_limit: u32,
) -> ChatEngine {
    ChatEngine::new(
        Arc::new(model),
        Arc::new(ToolExecutor::new(registry, 5)),
        CheckpointOrchestrator::new(store, CheckpointOptions::default()),
        "sys",
    )
    .with_turns_limit(turns_limit)
}

#[tokio::test]
async fn test_turn_limit_creates_checkpoint_with_single_toolless_call() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModelClient::replies(vec![
        ModelReply::with_tool_calls(
            "",
            vec![ToolCallRequest::new("r1", "read_file", json!({"path": "missing.txt"}))],
        ),
        ModelReply::text("Summary: looked for missing.txt, it does not exist."),
        ModelReply::text("done"),
    ]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let mut engine = engine_with(
        model.clone(),
        builtin_registry(dir.path(), vec![]),
        store.clone(),
        1,
    );
    let (sink, mut rx) = EventSink::channel();
    let session = SessionContext::new(Arc::new(AutoApprove), CancellationToken::new(), sink);

    let out = engine.run(vec![Message::user("find it")], &session).await.unwrap();
    assert_eq!(out.answer(), Some("done"));

    let calls = model.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].tool_count > 0);
    assert_eq!(calls[1].tool_count, 0, "summary call must not offer tools");
    // 检查点之后的首轮：恰好 [system, 恢复消息]
    assert_eq!(calls[2].messages.len(), 2);
    assert_eq!(calls[2].messages[0].role, Role::System);
    assert!(calls[2].messages[1].content.contains("missing.txt"));

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.cycle_count, 1);
    assert!(snapshot.active);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::CheckpointCompleted {
            branch: CheckpointBranch::Created,
            cycle_count: Some(1)
        }
    )));
    assert_eq!(engine.state().checkpoints, 1);
    assert_eq!(engine.state().turns_taken, 1);
}

#[tokio::test]
async fn test_mixed_batch_keeps_order_and_runs_after_denial() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModelClient::replies(vec![
        ModelReply::with_tool_calls(
            "writing three files",
            vec![
                ToolCallRequest::new("w1", "write_file", json!({"path": "a.txt", "content": "a"})),
                ToolCallRequest::new("w2", "write_file", json!({"path": "b.txt", "content": "b"})),
                ToolCallRequest::new("w3", "write_file", json!({"path": "c.txt", "content": "c"})),
            ],
        ),
        ModelReply::text("ok"),
    ]);
    let confirmer = ScriptedConfirmer::new(vec![
        ConfirmDecision::Approved,
        ConfirmDecision::Denied,
        ConfirmDecision::Approved,
    ]);
    let mut engine = engine_with(
        model,
        builtin_registry(dir.path(), vec![]),
        Arc::new(InMemoryCheckpointStore::new()),
        20,
    );
    let session = SessionContext::new(
        Arc::new(confirmer.clone()),
        CancellationToken::new(),
        EventSink::disabled(),
    );

    engine.run(vec![Message::user("go")], &session).await.unwrap();

    let tool_msgs: Vec<&Message> = engine
        .conversation()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    let ids: Vec<&str> = tool_msgs.iter().filter_map(|m| m.tool_call_id.as_deref()).collect();
    assert_eq!(ids, vec!["w1", "w2", "w3"]);
    assert!(tool_msgs[0].content.starts_with("Created"));
    assert!(tool_msgs[1].content.contains("did not run"));
    assert!(tool_msgs[2].content.starts_with("Created"));

    assert!(dir.path().join("a.txt").exists());
    assert!(!dir.path().join("b.txt").exists());
    assert!(dir.path().join("c.txt").exists());

    let asked = confirmer.asked();
    assert_eq!(asked.len(), 3);
    assert!(asked.iter().all(|(_, diff)| diff.is_some()));
}

/// 比 list_dir 慢一些才返回的只读工具
struct DelayedLookup;

#[async_trait]
impl Tool for DelayedLookup {
    fn name(&self) -> &str {
        "delayed_lookup"
    }

    fn description(&self) -> &str {
        "answers after a short delay"
    }

    fn permission(&self) -> PermissionCategory {
        PermissionCategory::ReadOnly
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok("looked up".to_string())
    }
}

#[tokio::test]
async fn test_auto_and_confirm_calls_interleaved_keep_request_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = builtin_registry(dir.path(), vec![]);
    registry.register(DelayedLookup);
    let model = ScriptedModelClient::replies(vec![
        ModelReply::with_tool_calls(
            "",
            vec![
                ToolCallRequest::new("d1", "delayed_lookup", json!({})),
                ToolCallRequest::new("w1", "write_file", json!({"path": "b.txt", "content": "b"})),
                ToolCallRequest::new("l1", "list_dir", json!({"path": "."})),
            ],
        ),
        ModelReply::text("ok"),
    ]);
    let confirmer = ScriptedConfirmer::new(vec![ConfirmDecision::Denied]);
    let mut engine = engine_with(model, registry, Arc::new(InMemoryCheckpointStore::new()), 20);
    let (sink, mut rx) = EventSink::channel();
    let session = SessionContext::new(Arc::new(confirmer.clone()), CancellationToken::new(), sink);

    engine.run(vec![Message::user("go")], &session).await.unwrap();

    let completed: Vec<(String, ToolStatus)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::ToolCompleted {
                tool_call_id,
                status,
                ..
            } => Some((tool_call_id, status)),
            _ => None,
        })
        .collect();
    let finished_at = |id: &str| completed.iter().position(|(c, _)| c == id).unwrap();
    assert!(
        finished_at("l1") < finished_at("d1"),
        "list_dir should finish before the delayed lookup: {completed:?}"
    );
    let status_of = |id: &str| completed[finished_at(id)].1;
    assert_eq!(status_of("d1"), ToolStatus::Success);
    assert_eq!(status_of("w1"), ToolStatus::Declined);
    assert_eq!(status_of("l1"), ToolStatus::Success);

    let tool_msgs: Vec<&Message> = engine
        .conversation()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    let ids: Vec<&str> = tool_msgs.iter().filter_map(|m| m.tool_call_id.as_deref()).collect();
    assert_eq!(ids, vec!["d1", "w1", "l1"]);
    assert!(tool_msgs[0].content.contains("looked up"));
    assert!(tool_msgs[1].content.contains("did not run"));
    assert!(!dir.path().join("b.txt").exists());
    assert_eq!(confirmer.asked().len(), 1, "only the write call asks for confirmation");
}

#[tokio::test]
async fn test_fallback_calls_are_aggregated_into_one_user_message() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "remember the milk").unwrap();
    let model = ScriptedModelClient::replies(vec![
        ModelReply::text(
            "Let me look.\n<tool_call>{\"name\": \"read_file\", \"arguments\": {\"path\": \"notes.txt\"}}</tool_call>\n\
<tool_call name=\"list_dir\">{\"path\": \".\"}</tool_call>",
        ),
        ModelReply::text("It says to remember the milk."),
    ]);
    let mut engine = engine_with(
        model.clone(),
        builtin_registry(dir.path(), vec![]),
        Arc::new(InMemoryCheckpointStore::new()),
        20,
    );
    let session = SessionContext::new(Arc::new(AutoApprove), CancellationToken::new(), EventSink::disabled());

    let out = engine.run(vec![Message::user("read notes")], &session).await.unwrap();
    assert_eq!(out.answer(), Some("It says to remember the milk."));

    let msgs = engine.conversation().messages();
    // system, user, assistant(文本调用), user(汇总结果), assistant
    assert_eq!(msgs.len(), 5);
    assert_eq!(msgs[2].role, Role::Assistant);
    assert!(msgs[2].tool_calls.is_empty());
    assert_eq!(msgs[3].role, Role::User);
    assert!(msgs[3].content.contains("remember the milk"));
    assert!(msgs[3].content.contains("notes.txt"));
    assert!(msgs.iter().all(|m| m.role != Role::Tool));
}

/// 长时间运行的只读工具：记录被真正执行的次数
struct SlowTool {
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "sleeps for a long time"
    }

    fn permission(&self) -> PermissionCategory {
        PermissionCategory::ReadOnly
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("woke up".to_string())
    }
}

#[tokio::test]
async fn test_cancel_mid_batch_settles_every_call() {
    let started = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry.register(SlowTool {
        started: started.clone(),
    });
    let model = ScriptedModelClient::replies(vec![ModelReply::with_tool_calls(
        "",
        vec![
            ToolCallRequest::new("s1", "slow", json!({})),
            ToolCallRequest::new("s2", "slow", json!({})),
            ToolCallRequest::new("s3", "slow", json!({})),
        ],
    )]);
    let executor = ToolExecutor::new(registry, 60).with_scheduler(TaskScheduler::new(1));
    let engine = ChatEngine::new(
        Arc::new(model),
        Arc::new(executor),
        CheckpointOrchestrator::new(
            Arc::new(InMemoryCheckpointStore::new()),
            CheckpointOptions::default(),
        ),
        "sys",
    );

    let mut handle = spawn_cooperative(
        engine,
        vec![Message::user("sleep")],
        Arc::new(AutoApprove),
        CancellationToken::new(),
    );
    let mut cancelled = false;
    while let Some(event) = handle.next_event().await {
        if !cancelled && matches!(event, EngineEvent::ToolStarted { .. }) {
            handle.cancel();
            cancelled = true;
        }
    }
    let (engine, result) = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("session did not stop after cancel")
        .unwrap();

    assert_eq!(result.unwrap(), SessionOutcome::Cancelled);
    assert_eq!(started.load(Ordering::SeqCst), 1, "queued calls must never start");
    assert!(engine.conversation().unresolved_tool_calls().is_empty());
    let tool_msgs: Vec<&Message> = engine
        .conversation()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_msgs.len(), 3);
    assert!(tool_msgs.iter().all(|m| m.content.contains("cancelled")));
}

#[tokio::test]
async fn test_restore_on_start_uses_saved_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".beecode").join("checkpoint.json");
    let store = Arc::new(FileCheckpointStore::new(&path));
    assert_eq!(store.write("edited src/lib.rs; tests still failing").unwrap(), 1);

    let model = ScriptedModelClient::replies(vec![ModelReply::text("continuing")]);
    let mut engine = AgentBuilder::new(AppConfig::default(), dir.path().to_path_buf())
        .with_model(Arc::new(model.clone()))
        .with_checkpoint_store(store.clone())
        .with_restore_on_start(true)
        .build_engine();
    let session = SessionContext::new(Arc::new(AutoApprove), CancellationToken::new(), EventSink::disabled());

    engine.run(vec![Message::user("go on")], &session).await.unwrap();

    let first = &model.calls()[0].messages;
    assert_eq!(first.len(), 3);
    assert!(first[1].content.contains("tests still failing"));
    assert!(first[1].content.contains("#1"));
    assert_eq!(first[2].content, "go on");
    assert!(!store.exists(), "restored checkpoint is cleared");
    assert!(!store.lock_path().exists(), "lock released");
}

#[tokio::test]
async fn test_held_lock_is_fatal_at_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path().join("cp.json")));
    let _held = store.try_lock().unwrap();

    let model = ScriptedModelClient::replies(vec![ModelReply::with_tool_calls(
        "",
        vec![ToolCallRequest::new("l1", "list_dir", json!({"path": "."}))],
    )]);
    let mut engine = ChatEngine::new(
        Arc::new(model),
        Arc::new(ToolExecutor::new(builtin_registry(dir.path(), vec![]), 5)),
        CheckpointOrchestrator::new(
            store,
            CheckpointOptions {
                lock_attempts: 2,
                lock_retry_ms: 1,
                ..CheckpointOptions::default()
            },
        ),
        "sys",
    )
    .with_turns_limit(1);
    let session = SessionContext::new(Arc::new(AutoApprove), CancellationToken::new(), EventSink::disabled());

    let err = engine.run(vec![Message::user("ls")], &session).await.unwrap_err();
    assert!(matches!(err, AgentError::CheckpointLockUnavailable { attempts: 2 }));
}

#[tokio::test]
async fn test_summary_failure_falls_back_to_plain_reset() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModelClient::new(vec![
        Ok(ModelReply::with_tool_calls(
            "",
            vec![ToolCallRequest::new("l1", "list_dir", json!({"path": "."}))],
        )),
        Err(ModelError::Auth("bad key".into())),
        Ok(ModelReply::text("recovered")),
    ]);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let mut engine = engine_with(model.clone(), builtin_registry(dir.path(), vec![]), store.clone(), 1);
    let (sink, mut rx) = EventSink::channel();
    let session = SessionContext::new(Arc::new(AutoApprove), CancellationToken::new(), sink);

    let out = engine.run(vec![Message::user("list files")], &session).await.unwrap();
    assert_eq!(out.answer(), Some("recovered"));
    assert!(store.snapshot().is_none());

    let third = &model.calls()[2].messages;
    assert_eq!(third.len(), 2);
    assert!(third[1].content.contains("list files"));
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::CheckpointFailed { .. })));
}
