//! 编排器：TUI 的主控循环
//!
//! 建立 cmd/state/confirm 三通道：UI 发命令（Submit/Cancel/Confirm/Clear/Quit），
//! 后台任务以协作方式驱动 ChatEngine，把引擎事件投影为 UiState 经 watch 推给 UI；
//! 需要确认的工具调用经 ChannelConfirmer 变成 UI 的模态框，用户按 y/n 回复。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::core::builder::AgentBuilder;
use crate::core::{AgentPhase, PendingConfirmation, SessionSupervisor, UiState};
use crate::engine::{spawn_cooperative, ChatEngine, EngineEvent, SessionHandle};
use crate::memory::{Message, ToolCallRequest};
use crate::tools::{ConfirmDecision, Confirmer};

/// 从 UI 发往编排器的用户命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 提交用户输入，开始一次会话
    Submit(String),
    /// 取消当前会话
    Cancel,
    /// 回复当前待确认的工具调用
    Confirm(bool),
    /// 清空对话（空闲时）
    Clear,
    Quit,
}

/// 一次确认请求：引擎侧等待 reply
#[derive(Debug)]
pub struct ConfirmRequest {
    pub call: ToolCallRequest,
    pub diff: Option<String>,
    pub reply: oneshot::Sender<ConfirmDecision>,
}

/// 把确认转成消息发给 UI 侧；应答端被丢弃（取消、退出）视为拒绝
#[derive(Debug, Clone)]
pub struct ChannelConfirmer {
    tx: mpsc::UnboundedSender<ConfirmRequest>,
}

impl ChannelConfirmer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConfirmRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Confirmer for ChannelConfirmer {
    async fn confirm(&self, call: &ToolCallRequest, diff: Option<&str>) -> ConfirmDecision {
        let (reply, rx) = oneshot::channel();
        let request = ConfirmRequest {
            call: call.clone(),
            diff: diff.map(str::to_string),
            reply,
        };
        if self.tx.send(request).is_err() {
            return ConfirmDecision::Denied;
        }
        rx.await.unwrap_or(ConfirmDecision::Denied)
    }
}

/// 等待运行中会话的下一条事件；无会话时永远挂起
async fn next_session_event(running: &mut Option<SessionHandle>) -> Option<EngineEvent> {
    match running.as_mut() {
        Some(handle) => handle.next_event().await,
        None => std::future::pending().await,
    }
}

fn idle_state(engine: &ChatEngine, previous: &UiState) -> UiState {
    UiState {
        phase: AgentPhase::Idle,
        history: engine.conversation().messages().to_vec(),
        activity: previous.activity.clone(),
        iteration: engine.state(),
        model_name: engine.model_name().to_string(),
        ..UiState::default()
    }
}

/// 创建引擎运行时：返回命令发送端与状态接收端；后台任务消费命令并更新 state。
/// 需在 tokio 运行时上下文中调用
pub fn create_agent(
    builder: AgentBuilder,
) -> (mpsc::UnboundedSender<Command>, watch::Receiver<UiState>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (confirmer, mut confirm_rx) = ChannelConfirmer::new();
    let confirmer: Arc<dyn Confirmer> = Arc::new(confirmer);

    let mut engine = Some(builder.build_engine());
    let mut state = engine
        .as_ref()
        .map(|e| idle_state(e, &UiState::default()))
        .unwrap_or_default();
    let (state_tx, state_rx) = watch::channel(state.clone());

    tokio::spawn(async move {
        let supervisor = SessionSupervisor::new();
        let mut running: Option<SessionHandle> = None;
        let mut pending: Option<oneshot::Sender<ConfirmDecision>> = None;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Submit(input) => {
                            let Some(e) = engine.take() else {
                                tracing::debug!("session already running, submit ignored");
                                continue;
                            };
                            let session_id = Uuid::new_v4();
                            tracing::info!(%session_id, "session started");
                            state.history.push(Message::user(input.clone()));
                            state.phase = AgentPhase::Thinking;
                            state.input_locked = true;
                            state.error_message = None;
                            running = Some(spawn_cooperative(
                                e,
                                vec![Message::user(input)],
                                confirmer.clone(),
                                supervisor.renew(),
                            ));
                        }
                        Command::Cancel => {
                            supervisor.cancel();
                            state.pending_confirmation = None;
                        }
                        Command::Confirm(approved) => {
                            if let Some(reply) = pending.take() {
                                let decision = if approved {
                                    ConfirmDecision::Approved
                                } else {
                                    ConfirmDecision::Denied
                                };
                                let _ = reply.send(decision);
                                state.pending_confirmation = None;
                                state.phase = AgentPhase::ToolExecuting;
                            }
                        }
                        Command::Clear => {
                            if let Some(e) = engine.as_mut() {
                                e.clear();
                                state = idle_state(e, &UiState::default());
                            }
                        }
                        Command::Quit => {
                            supervisor.cancel();
                            if let Some(handle) = running.take() {
                                let _ = handle.join().await;
                            }
                            break;
                        }
                    }
                }
                Some(request) = confirm_rx.recv() => {
                    state.pending_confirmation = Some(PendingConfirmation {
                        tool_name: request.call.tool_name.clone(),
                        arguments: request.call.arguments.to_string(),
                        diff: request.diff,
                    });
                    state.phase = AgentPhase::AwaitingConfirmation;
                    pending = Some(request.reply);
                }
                event = next_session_event(&mut running) => {
                    match event {
                        Some(ev) => state.apply_event(&ev),
                        None => {
                            let Some(handle) = running.take() else { continue };
                            pending = None;
                            match handle.join().await {
                                Ok((e, result)) => {
                                    state = idle_state(&e, &state);
                                    if let Err(err) = result {
                                        state.phase = AgentPhase::Error;
                                        state.error_message = Some(err.to_string());
                                    }
                                    engine = Some(e);
                                }
                                Err(join_err) => {
                                    tracing::error!(error = %join_err, "session task failed");
                                    let e = builder.build_engine();
                                    state = idle_state(&e, &state);
                                    state.phase = AgentPhase::Error;
                                    state.error_message = Some(format!("session task failed: {join_err}"));
                                    engine = Some(e);
                                }
                            }
                        }
                    }
                }
            }
            let _ = state_tx.send(state.clone());
        }
    });

    (cmd_tx, state_rx)
}
