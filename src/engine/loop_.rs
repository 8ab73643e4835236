//! 对话编排主循环
//!
//! 每轮：轮数达到上限则执行检查点（本轮不调用模型）-> 发送规范化对话 -> 提取工具调用
//! -> 按批次语义执行 -> 回灌结果 -> turns_taken + 1。
//! 结束条件（先到先得）：纯文本回答、终结类工具、取消、致命错误。
//! 结构化调用的结果以 role=tool（带 tool_call_id）回灌；回退格式的结果汇总为一条 role=user 消息。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::engine::checkpoint::CheckpointOrchestrator;
use crate::engine::events::{preview, CheckpointBranch, EngineEvent, EventSink, SessionOutcome};
use crate::engine::parser::{extract_tool_calls, CallForm};
use crate::llm::{ModelClient, ModelReply, TokenUsage};
use crate::memory::{get_content, to_canonical_record, CanonicalRecord, Conversation, Message};
use crate::tools::{
    aggregate_fallback_results, BatchContext, Confirmer, ToolExecutor, ToolProgress,
};

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 迭代状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IterationState {
    /// 自上次检查点以来的轮数
    pub turns_taken: u32,
    pub turns_limit: u32,
    /// 会话累计轮数（不随检查点清零）
    pub total_turns: u32,
    pub tokens_accumulated: u64,
    pub checkpoints: u32,
}

/// 一次 run() 的前端协作者：确认、取消、事件出口
#[derive(Clone)]
pub struct SessionContext {
    pub confirmer: Arc<dyn Confirmer>,
    pub cancel: CancellationToken,
    pub events: EventSink,
}

impl SessionContext {
    pub fn new(confirmer: Arc<dyn Confirmer>, cancel: CancellationToken, events: EventSink) -> Self {
        Self {
            confirmer,
            cancel,
            events,
        }
    }
}

/// 对话编排引擎：独占会话的 Conversation
pub struct ChatEngine {
    model: Arc<dyn ModelClient>,
    executor: Arc<ToolExecutor>,
    checkpoint: CheckpointOrchestrator,
    recovery: RecoveryEngine,
    conversation: Conversation,
    state: IterationState,
    started: bool,
}

impl ChatEngine {
    pub fn new(
        model: Arc<dyn ModelClient>,
        executor: Arc<ToolExecutor>,
        checkpoint: CheckpointOrchestrator,
        system_prompt: impl Into<String>,
    ) -> Self {
        let mut conversation = Conversation::new();
        conversation.replace(vec![Message::system(system_prompt)]);
        Self {
            model,
            executor,
            checkpoint,
            recovery: RecoveryEngine::default(),
            conversation,
            state: IterationState {
                turns_limit: 20,
                ..IterationState::default()
            },
            started: false,
        }
    }

    pub fn with_turns_limit(mut self, turns_limit: u32) -> Self {
        self.state.turns_limit = turns_limit.max(1);
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    /// 只读视图（前端展示用）
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn state(&self) -> IterationState {
        self.state
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn checkpoint(&self) -> &CheckpointOrchestrator {
        &self.checkpoint
    }

    /// 清空对话（保留 system），轮数归零；检查点不受影响
    pub fn clear(&mut self) {
        self.conversation.clear_to_system();
        self.state.turns_taken = 0;
    }

    /// 驱动一次会话直到结束。initial_messages 依次追加（一般是一条用户消息）
    pub async fn run(
        &mut self,
        initial_messages: Vec<Message>,
        session: &SessionContext,
    ) -> Result<SessionOutcome, AgentError> {
        let events = &session.events;
        let on_progress = |p: ToolProgress| match p {
            ToolProgress::Started {
                tool_call_id,
                tool_name,
                category,
            } => events.emit(EngineEvent::ToolStarted {
                tool_call_id,
                tool: tool_name,
                permission: category,
            }),
            ToolProgress::Completed(r) => events.emit(EngineEvent::ToolCompleted {
                preview: preview(&r.render(), RESULT_PREVIEW_CHARS),
                tool_call_id: r.tool_call_id,
                tool: r.tool_name,
                status: r.status,
            }),
        };
        let ctx = BatchContext {
            confirmer: session.confirmer.as_ref(),
            cancel: &session.cancel,
            on_progress: &on_progress,
            only_category: None,
        };

        if !self.started {
            self.started = true;
            if self.checkpoint.options().restore_on_start {
                match self.checkpoint.restore_at_start(&mut self.conversation, &ctx).await {
                    Ok(Some(cycle)) => {
                        tracing::info!(cycle_count = cycle, "session restored from checkpoint");
                        events.emit(EngineEvent::CheckpointCompleted {
                            branch: CheckpointBranch::Restored,
                            cycle_count: Some(cycle),
                        });
                    }
                    Ok(None) => {}
                    Err(AgentError::CheckpointIo(e)) => {
                        tracing::warn!(error = %e, "restore on start failed");
                        events.emit(EngineEvent::CheckpointFailed {
                            reason: e.to_string(),
                        });
                    }
                    Err(AgentError::Cancelled) => return Ok(self.finish(SessionOutcome::Cancelled, events)),
                    Err(e) => return self.fail(e, events),
                }
            }
        }

        for m in initial_messages {
            if let Err(e) = self.conversation.append(m) {
                return self.fail(e, events);
            }
        }

        loop {
            if session.cancel.is_cancelled() {
                return Ok(self.finish(SessionOutcome::Cancelled, events));
            }

            if self.state.turns_taken >= self.state.turns_limit {
                events.emit(EngineEvent::CheckpointTriggered {
                    turns_taken: self.state.turns_taken,
                });
                let report = self
                    .checkpoint
                    .run(
                        &mut self.conversation,
                        self.model.as_ref(),
                        &self.executor,
                        &ctx,
                        events,
                    )
                    .await;
                match report {
                    Ok(report) => {
                        self.add_usage(report.usage);
                        for r in &report.tool_results {
                            tracing::info!(
                                tool = %r.tool_name,
                                status = %r.status,
                                "tool ran during checkpoint"
                            );
                        }
                        self.state.turns_taken = 0;
                        self.state.checkpoints += 1;
                        events.emit(EngineEvent::CheckpointCompleted {
                            branch: report.branch,
                            cycle_count: report.cycle_count,
                        });
                    }
                    Err(AgentError::Cancelled) => {
                        return Ok(self.finish(SessionOutcome::Cancelled, events))
                    }
                    Err(e) => return self.fail(e, events),
                }
                continue;
            }

            let turn = self.state.turns_taken + 1;
            events.emit(EngineEvent::TurnStarted {
                turn,
                turns_limit: self.state.turns_limit,
            });

            let reply = match self.call_model(&session.cancel, events).await {
                Ok(reply) => reply,
                Err(AgentError::Cancelled) => {
                    return Ok(self.finish(SessionOutcome::Cancelled, events))
                }
                Err(e) => return self.fail(e, events),
            };
            self.add_usage(reply.usage);

            let content = get_content(&reply);
            let Some(extracted) = extract_tool_calls(&reply, &content) else {
                if let Err(e) = self.conversation.append(Message::assistant(content.clone())) {
                    return self.fail(e, events);
                }
                events.emit(EngineEvent::AssistantMessage {
                    content: content.clone(),
                });
                self.complete_turn(turn, events);
                return Ok(self.finish(SessionOutcome::FinalAnswer { text: content }, events));
            };

            if !content.trim().is_empty() {
                events.emit(EngineEvent::AssistantMessage {
                    content: content.clone(),
                });
            }
            let assistant = match extracted.form {
                CallForm::Structured => {
                    Message::assistant_with_tool_calls(content, extracted.calls.clone())
                }
                CallForm::Fallback => Message::assistant(content),
            };
            if let Err(e) = self.conversation.append(assistant) {
                return self.fail(e, events);
            }

            let outcome = self.executor.execute_batch(&extracted.calls, &ctx).await;
            let appended = match extracted.form {
                CallForm::Structured => outcome
                    .results
                    .iter()
                    .try_for_each(|r| self.conversation.append(r.to_tool_message())),
                CallForm::Fallback => self
                    .conversation
                    .append(aggregate_fallback_results(&outcome.results)),
            };
            if let Err(e) = appended {
                return self.fail(e, events);
            }
            self.complete_turn(turn, events);

            if outcome.cancelled {
                return Ok(self.finish(SessionOutcome::Cancelled, events));
            }
            if let Some(terminal) = outcome.terminal() {
                return Ok(self.finish(
                    SessionOutcome::TerminalTool {
                        tool: terminal.tool_name.clone(),
                        answer: terminal.output.clone(),
                    },
                    events,
                ));
            }
        }
    }

    /// 调用模型；瞬时错误按 RecoveryEngine 退避重试，其余升级为致命错误
    async fn call_model(
        &self,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<ModelReply, AgentError> {
        let records: Vec<CanonicalRecord> = self
            .conversation
            .messages()
            .iter()
            .map(to_canonical_record)
            .collect();
        let specs = self.executor.registry().specs();
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.model.send(&records, &specs) => r,
            };
            let err = match result {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };
            match self.recovery.handle(&err, attempt) {
                RecoveryAction::RetryAfter {
                    delay_ms,
                    attempt: next,
                } => {
                    tracing::warn!(attempt, delay_ms, error = %err, "model call failed, retrying");
                    events.emit(EngineEvent::ModelRetry {
                        attempt,
                        delay_ms,
                        reason: err.to_string(),
                    });
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                    attempt = next;
                }
                RecoveryAction::Escalate(reason) => {
                    return Err(AgentError::FatalSession(reason));
                }
            }
        }
    }

    fn add_usage(&mut self, usage: Option<TokenUsage>) {
        if let Some(u) = usage {
            self.state.tokens_accumulated += u.total();
        }
    }

    fn complete_turn(&mut self, turn: u32, events: &EventSink) {
        self.state.turns_taken += 1;
        self.state.total_turns += 1;
        events.emit(EngineEvent::TurnCompleted {
            turn,
            tokens_accumulated: self.state.tokens_accumulated,
        });
    }

    fn finish(&self, outcome: SessionOutcome, events: &EventSink) -> SessionOutcome {
        tracing::info!(outcome = ?outcome, turns = self.state.total_turns, "session finished");
        events.emit(EngineEvent::SessionTerminated {
            outcome: outcome.clone(),
        });
        outcome
    }

    fn fail(&self, err: AgentError, events: &EventSink) -> Result<SessionOutcome, AgentError> {
        tracing::error!(error = %err, "session failed");
        events.emit(EngineEvent::SessionFailed {
            error: err.to_string(),
        });
        Err(err)
    }
}
