//! 检查点编排：轮数达到上限时「摘要并重置」
//!
//! 状态机：Idle → Deciding → {Restoring | Creating} → Resetting → Idle
//! - Deciding：存储中已有检查点则 Restoring，否则 Creating
//! - Restoring：读取 summary_text，清除检查点记录（保留代数）
//! - Creating：用最近窗口构造摘要请求，调用一次模型（tools=[]）；可选地执行回复中的写类工具调用；
//!   摘要去掉调用标记并附上执行结果后写入新检查点（cycle_count + 1）
//! - Resetting：先完整构建新序列，再一次性替换，无 await，取消无法打断
//!
//! 无论走哪个分支，重置后的对话都恰好是 [system, 恢复消息]。
//! 检查点 I/O 失败时上报 CheckpointFailed 并退化为同样形状的普通重置；锁在有界重试后仍拿不到则为致命错误。

use std::sync::Arc;
use std::time::Duration;

use crate::core::AgentError;
use crate::engine::events::{preview, CheckpointBranch, EngineEvent, EventSink};
use crate::engine::parser::{extract_tool_calls, strip_fallback_calls};
use crate::llm::{ModelClient, ModelError, ModelReply, TokenUsage};
use crate::memory::{
    to_canonical_record, CheckpointError, CheckpointLock, CheckpointStore, Conversation, Message,
    Role,
};
use crate::tools::{BatchContext, PermissionCategory, ToolCallResult, ToolExecutor};

/// 编排参数（[checkpoint] 段）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOptions {
    pub window_messages: usize,
    pub allow_write_tools: bool,
    pub lock_attempts: u32,
    pub lock_retry_ms: u64,
    pub restore_on_start: bool,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            window_messages: 20,
            allow_write_tools: false,
            lock_attempts: 5,
            lock_retry_ms: 200,
            restore_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    Idle,
    Deciding,
    Restoring,
    Creating,
    Resetting,
}

/// 一次检查点步骤的结果
#[derive(Debug, Clone)]
pub struct CheckpointReport {
    pub branch: CheckpointBranch,
    /// Restored 为读到的代数，Created 为新代数，ResetOnly 为 None
    pub cycle_count: Option<u64>,
    pub usage: Option<TokenUsage>,
    /// Creating 期间执行的写类工具结果
    pub tool_results: Vec<ToolCallResult>,
}

/// Restoring / Creating 交给 Resetting 的恢复信息
struct Restore {
    message: Message,
    branch: CheckpointBranch,
    cycle_count: Option<u64>,
}

const SUMMARY_INSTRUCTIONS: &str = "You are creating a checkpoint of a long coding session. \
Summarize the conversation below so the work can continue from the summary alone. Include: \
the user's goal, what has been done (files read or changed, commands run), open problems, \
and the concrete next steps. Be concise and factual. Reply with the summary text only.";

/// 检查点编排器：独占检查点存储
pub struct CheckpointOrchestrator {
    store: Arc<dyn CheckpointStore>,
    options: CheckpointOptions,
    phase: CheckpointPhase,
}

impl CheckpointOrchestrator {
    pub fn new(store: Arc<dyn CheckpointStore>, options: CheckpointOptions) -> Self {
        Self {
            store,
            options,
            phase: CheckpointPhase::Idle,
        }
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    pub fn options(&self) -> &CheckpointOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// 执行一次完整的检查点步骤；只有锁不可得（或 Creating 期间被取消）时返回 Err
    pub async fn run(
        &mut self,
        conversation: &mut Conversation,
        model: &dyn ModelClient,
        executor: &ToolExecutor,
        ctx: &BatchContext<'_>,
        events: &EventSink,
    ) -> Result<CheckpointReport, AgentError> {
        let result = self.run_inner(conversation, model, executor, ctx, events).await;
        self.phase = CheckpointPhase::Idle;
        result
    }

    async fn run_inner(
        &mut self,
        conversation: &mut Conversation,
        model: &dyn ModelClient,
        executor: &ToolExecutor,
        ctx: &BatchContext<'_>,
        events: &EventSink,
    ) -> Result<CheckpointReport, AgentError> {
        self.phase = CheckpointPhase::Deciding;
        let _lock = match self.acquire_lock(ctx).await {
            Ok(lock) => lock,
            Err(AgentError::CheckpointIo(e)) => {
                return Ok(self.fallback_reset(conversation, events, e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let mut usage = None;
        let mut tool_results = Vec::new();
        let restore = if self.store.exists() {
            self.phase = CheckpointPhase::Restoring;
            self.restore_branch().map_err(|e| e.to_string())
        } else {
            self.phase = CheckpointPhase::Creating;
            match self.summarize(conversation, model, ctx).await? {
                Ok(reply) => {
                    usage = reply.usage;
                    if self.options.allow_write_tools {
                        tool_results = self.run_write_tools(&reply, executor, ctx).await;
                    }
                    let summary = summary_with_actions(&reply.content, &tool_results);
                    self.create_branch(&summary).map_err(|e| e.to_string())
                }
                Err(e) => Err(format!("summary request failed: {e}")),
            }
        };

        match restore {
            Ok(restore) => {
                self.reset(conversation, restore.message);
                tracing::info!(
                    branch = ?restore.branch,
                    cycle_count = ?restore.cycle_count,
                    "checkpoint complete"
                );
                Ok(CheckpointReport {
                    branch: restore.branch,
                    cycle_count: restore.cycle_count,
                    usage,
                    tool_results,
                })
            }
            Err(reason) => {
                let mut report = self.fallback_reset(conversation, events, reason);
                report.usage = usage;
                report.tool_results = tool_results;
                Ok(report)
            }
        }
    }

    /// 会话开始前：存储中有检查点则直接恢复为 [system, 恢复消息]
    pub async fn restore_at_start(
        &mut self,
        conversation: &mut Conversation,
        ctx: &BatchContext<'_>,
    ) -> Result<Option<u64>, AgentError> {
        if !self.store.exists() {
            return Ok(None);
        }
        self.phase = CheckpointPhase::Deciding;
        let result = async {
            let _lock = self.acquire_lock(ctx).await?;
            self.phase = CheckpointPhase::Restoring;
            let restore = self.restore_branch()?;
            self.reset(conversation, restore.message);
            Ok::<_, AgentError>(restore.cycle_count)
        }
        .await;
        self.phase = CheckpointPhase::Idle;
        result
    }

    /// 有界重试获取独占锁
    async fn acquire_lock(&self, ctx: &BatchContext<'_>) -> Result<CheckpointLock, AgentError> {
        let attempts = self.options.lock_attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.try_lock() {
                Ok(lock) => return Ok(lock),
                Err(CheckpointError::LockHeld) => {
                    tracing::warn!(attempt, attempts, "checkpoint lock held, retrying");
                    if attempt < attempts {
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(self.options.lock_retry_ms)) => {}
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AgentError::CheckpointLockUnavailable { attempts })
    }

    fn restore_branch(&self) -> Result<Restore, CheckpointError> {
        let checkpoint = self.store.read()?;
        self.store.clear()?;
        Ok(Restore {
            message: restore_message(&checkpoint.summary_text, Some(checkpoint.cycle_count)),
            branch: CheckpointBranch::Restored,
            cycle_count: Some(checkpoint.cycle_count),
        })
    }

    fn create_branch(&self, reply_text: &str) -> Result<Restore, CheckpointError> {
        let summary = reply_text.trim();
        let summary = if summary.is_empty() {
            "(the model returned an empty summary)"
        } else {
            summary
        };
        let cycle = self.store.write(summary)?;
        Ok(Restore {
            message: restore_message(summary, Some(cycle)),
            branch: CheckpointBranch::Created,
            cycle_count: Some(cycle),
        })
    }

    /// Creating：恰好一次模型调用，不提供工具。外层 Err 为取消，内层 Err 为模型失败（按检查点失败处理）
    async fn summarize(
        &self,
        conversation: &Conversation,
        model: &dyn ModelClient,
        ctx: &BatchContext<'_>,
    ) -> Result<Result<ModelReply, ModelError>, AgentError> {
        let prompt = summary_prompt(conversation, self.options.window_messages);
        let mut records = Vec::with_capacity(2);
        if let Some(system) = conversation.system_message() {
            records.push(to_canonical_record(system));
        }
        records.push(to_canonical_record(&Message::user(prompt)));

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            reply = model.send(&records, &[]) => Ok(reply),
        }
    }

    /// allow_write_tools 时：回复中的写类调用走同一执行策略，其余分类被拒绝
    async fn run_write_tools(
        &self,
        reply: &ModelReply,
        executor: &ToolExecutor,
        ctx: &BatchContext<'_>,
    ) -> Vec<ToolCallResult> {
        let Some(extracted) = extract_tool_calls(reply, &reply.content) else {
            return Vec::new();
        };
        let write_ctx = BatchContext {
            confirmer: ctx.confirmer,
            cancel: ctx.cancel,
            on_progress: ctx.on_progress,
            only_category: Some(PermissionCategory::Write),
        };
        executor.execute_batch(&extracted.calls, &write_ctx).await.results
    }

    /// Resetting：完整构建后一次性替换
    fn reset(&mut self, conversation: &mut Conversation, restore: Message) {
        self.phase = CheckpointPhase::Resetting;
        let system = conversation
            .system_message()
            .cloned()
            .unwrap_or_else(|| Message::system(""));
        conversation.replace(vec![system, restore]);
    }

    /// 检查点失败：上报后退化为普通重置，形状不变
    fn fallback_reset(
        &mut self,
        conversation: &mut Conversation,
        events: &EventSink,
        reason: String,
    ) -> CheckpointReport {
        tracing::warn!(reason = %reason, "checkpoint failed, resetting without a checkpoint");
        events.emit(EngineEvent::CheckpointFailed { reason });
        let last_request = conversation
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let message = Message::user(format!(
            "The conversation was reset after reaching its turn limit, but no checkpoint summary \
could be saved. Re-check the workspace state before acting, then continue with the most recent \
request:\n\n{last_request}"
        ));
        self.reset(conversation, message);
        CheckpointReport {
            branch: CheckpointBranch::ResetOnly,
            cycle_count: None,
            usage: None,
            tool_results: Vec::new(),
        }
    }
}

/// 两个分支共用的恢复消息
pub fn restore_message(summary: &str, cycle_count: Option<u64>) -> Message {
    let cycle = cycle_count
        .map(|c| format!(" (checkpoint #{c})"))
        .unwrap_or_default();
    Message::user(format!(
        "Context restored from a checkpoint{cycle}. Summary of the work so far:\n\n{summary}\n\n\
Continue the task from here. Do not repeat completed steps."
    ))
}

/// 去掉回复里的调用标记；检查点期间执行过的写操作附在摘要末尾
fn summary_with_actions(reply_text: &str, results: &[ToolCallResult]) -> String {
    let mut summary = strip_fallback_calls(reply_text);
    if results.is_empty() {
        return summary;
    }
    summary.push_str("\n\nActions taken while checkpointing:");
    for r in results {
        let output = preview(r.output.lines().next().unwrap_or_default(), 120);
        summary.push_str(&format!("\n- {} ({}): {}", r.tool_name, r.status, output));
    }
    summary
}

/// 最近 window 条非 system 消息的文本转写 + 摘要指令
fn summary_prompt(conversation: &Conversation, window: usize) -> String {
    let recent: Vec<&Message> = conversation
        .messages()
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();
    let start = recent.len().saturating_sub(window.max(1));
    let mut transcript = String::new();
    for m in &recent[start..] {
        transcript.push_str(&format!("[{}] {}\n", m.role.as_str(), m.content));
        for call in &m.tool_calls {
            transcript.push_str(&format!("  -> {}({})\n", call.tool_name, call.arguments));
        }
    }
    format!("{SUMMARY_INSTRUCTIONS}\n\n--- conversation ---\n{transcript}--- end ---")
}
