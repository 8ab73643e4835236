//! 工具执行器：统一的工具执行策略
//!
//! 单次调用流水线（任一步失败即短路为 error / declined 结果）：
//! 1. 名称解析（UnknownTool）
//! 2. 参数校验（ValidationError，携带出错字段）
//! 3. 权限确认（只读自动放行；写类附带 diff；其余需要确认；策略可直接拒绝）
//! 4. 执行（超时、工具返回 Err 都折叠为 error 结果，从不向上抛）
//!
//! 批次语义：自动放行的调用并发执行（受 TaskScheduler 限制），需确认的调用按请求顺序串行；
//! 结果始终按请求顺序返回。终结类工具成功后，尚未开始的调用以 declined 结束；
//! 取消时进行中的调用结果为 declined/cancelled，排队中的调用不再执行。
//! 每次执行输出一行结构化审计日志（JSON）。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::TaskScheduler;
use crate::memory::{Message, ToolCallRequest};
use crate::tools::schema::validate_arguments;
use crate::tools::{
    ConfirmDecision, Confirmer, PermissionCategory, PermissionDecision, PermissionPolicy, Tool,
    ToolRegistry,
};

/// 调用被拒绝的原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// 用户在确认时拒绝
    UserDenied,
    /// 权限策略拒绝，未询问用户
    Policy,
    /// 会话被取消
    Cancelled,
    /// 同批次中终结类工具已结束会话
    SessionFinished,
    /// 检查点生成阶段只允许写类工具
    CheckpointRestricted,
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeclineReason::UserDenied => "declined by user",
            DeclineReason::Policy => "denied by policy",
            DeclineReason::Cancelled => "cancelled",
            DeclineReason::SessionFinished => "session already finished",
            DeclineReason::CheckpointRestricted => "not permitted during checkpoint",
        };
        f.write_str(s)
    }
}

/// 单次调用的错误分类（全部非致命，折叠为 ToolCallResult 回灌给模型）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {}", fields.join("; "))]
    Validation { fields: Vec<String> },

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Tool {tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("Declined: {reason}")]
    Declined { reason: DeclineReason },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Declined,
    Error,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolStatus::Success => "success",
            ToolStatus::Declined => "declined",
            ToolStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// 一次调用的结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub output: String,
    /// 做决定时使用的权限分类（未知工具为 None）
    pub permission_category: Option<PermissionCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<DeclineReason>,
    /// 终结类工具成功执行
    pub terminal: bool,
}

impl ToolCallResult {
    pub fn success(call: &ToolCallRequest, category: PermissionCategory, output: String, terminal: bool) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolStatus::Success,
            output,
            permission_category: Some(category),
            decline_reason: None,
            terminal,
        }
    }

    pub fn from_error(call: &ToolCallRequest, category: Option<PermissionCategory>, err: ToolError) -> Self {
        let (status, decline_reason) = match &err {
            ToolError::Declined { reason } => (ToolStatus::Declined, Some(*reason)),
            _ => (ToolStatus::Error, None),
        };
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            status,
            output: err.to_string(),
            permission_category: category,
            decline_reason,
            terminal: false,
        }
    }

    pub fn declined(call: &ToolCallRequest, category: Option<PermissionCategory>, reason: DeclineReason) -> Self {
        Self::from_error(call, category, ToolError::Declined { reason })
    }

    /// 回灌给模型的文本
    pub fn render(&self) -> String {
        match self.status {
            ToolStatus::Success => self.output.clone(),
            ToolStatus::Error => format!("Error: {}", self.output),
            ToolStatus::Declined => format!(
                "The user did not run this tool call ({}). Adjust your plan accordingly.",
                self.decline_reason.map(|r| r.to_string()).unwrap_or_else(|| "declined".into())
            ),
        }
    }

    /// 结构化调用：role=tool 消息
    pub fn to_tool_message(&self) -> Message {
        Message::tool(self.tool_call_id.clone(), self.render())
    }
}

/// 回退格式：把整批结果汇总为一条 role=user 消息
pub fn aggregate_fallback_results(results: &[ToolCallResult]) -> Message {
    let mut body = String::from("Tool results:\n");
    for r in results {
        body.push_str(&format!(
            "\n[{} #{}] status: {}\n{}\n",
            r.tool_name,
            r.tool_call_id,
            r.status,
            r.render()
        ));
    }
    Message::user(body.trim_end().to_string())
}

/// 执行进度（由引擎转为前端事件）
#[derive(Clone, Debug)]
pub enum ToolProgress {
    Started {
        tool_call_id: String,
        tool_name: String,
        category: PermissionCategory,
    },
    Completed(ToolCallResult),
}

/// 批次执行上下文
pub struct BatchContext<'a> {
    pub confirmer: &'a dyn Confirmer,
    pub cancel: &'a CancellationToken,
    pub on_progress: &'a (dyn Fn(ToolProgress) + Send + Sync),
    /// 仅允许某一分类（检查点生成阶段为 Write），其余以 declined 结束
    pub only_category: Option<PermissionCategory>,
}

/// 批次结果：results 与请求一一对应、顺序一致
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<ToolCallResult>,
    pub cancelled: bool,
}

impl BatchOutcome {
    /// 第一个成功执行的终结类工具结果
    pub fn terminal(&self) -> Option<&ToolCallResult> {
        self.results.iter().find(|r| r.terminal)
    }
}

/// 通过名称解析与校验、尚未执行的调用
struct Prepared {
    call: ToolCallRequest,
    tool: Arc<dyn Tool>,
    category: PermissionCategory,
    decision: PermissionDecision,
}

/// 工具执行器：注册表 + 权限策略 + 超时 + 并发池
pub struct ToolExecutor {
    registry: ToolRegistry,
    policy: PermissionPolicy,
    timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            policy: PermissionPolicy::default(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            scheduler: TaskScheduler::default(),
        }
    }

    pub fn with_policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 步骤 1-2 + 策略判定；失败时直接给出结果
    fn prepare(
        &self,
        call: &ToolCallRequest,
        only_category: Option<PermissionCategory>,
    ) -> Result<Prepared, ToolCallResult> {
        let tool = self.registry.resolve(&call.tool_name).ok_or_else(|| {
            ToolCallResult::from_error(call, None, ToolError::UnknownTool(call.tool_name.clone()))
        })?;
        let category = tool.permission();
        let mut call = call.clone();
        call.tool_name = tool.name().to_string();

        if let Some(only) = only_category {
            if category != only {
                return Err(ToolCallResult::declined(
                    &call,
                    Some(category),
                    DeclineReason::CheckpointRestricted,
                ));
            }
        }

        validate_arguments(&tool.parameters_schema(), &call.arguments).map_err(|fields| {
            ToolCallResult::from_error(&call, Some(category), ToolError::Validation { fields })
        })?;

        let decision = self.policy.decide(category);
        if decision == PermissionDecision::Deny {
            return Err(ToolCallResult::declined(&call, Some(category), DeclineReason::Policy));
        }
        Ok(Prepared {
            call,
            tool,
            category,
            decision,
        })
    }

    /// 执行单个调用（含确认）；用于只有一个调用的场景
    pub async fn execute_one(&self, call: &ToolCallRequest, ctx: &BatchContext<'_>) -> ToolCallResult {
        let outcome = self.execute_batch(std::slice::from_ref(call), ctx).await;
        outcome
            .results
            .into_iter()
            .next()
            .unwrap_or_else(|| ToolCallResult::declined(call, None, DeclineReason::Cancelled))
    }

    /// 执行一批调用，结果按请求顺序返回
    pub async fn execute_batch(&self, calls: &[ToolCallRequest], ctx: &BatchContext<'_>) -> BatchOutcome {
        let finished = AtomicBool::new(false);
        let mut slots: Vec<Option<ToolCallResult>> = vec![None; calls.len()];
        let mut auto: Vec<(usize, Prepared)> = Vec::new();
        let mut confirm: Vec<(usize, Prepared)> = Vec::new();

        for (i, call) in calls.iter().enumerate() {
            match self.prepare(call, ctx.only_category) {
                Ok(p) if p.decision == PermissionDecision::Auto => auto.push((i, p)),
                Ok(p) => confirm.push((i, p)),
                Err(result) => {
                    (ctx.on_progress)(ToolProgress::Completed(result.clone()));
                    slots[i] = Some(result);
                }
            }
        }

        let auto_fut = join_all(auto.into_iter().map(|(i, p)| {
            let finished = &finished;
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return (i, self.settle(ctx, ToolCallResult::declined(&p.call, Some(p.category), DeclineReason::Cancelled)));
                    }
                    permit = self.scheduler.acquire_tool() => permit,
                };
                if finished.load(Ordering::SeqCst) {
                    return (i, self.settle(ctx, ToolCallResult::declined(&p.call, Some(p.category), DeclineReason::SessionFinished)));
                }
                let result = self.run(&p, ctx).await;
                if result.terminal {
                    finished.store(true, Ordering::SeqCst);
                }
                (i, result)
            }
        }));

        let confirm_fut = {
            let finished = &finished;
            async move {
                let mut out = Vec::with_capacity(confirm.len());
                for (i, p) in confirm {
                    let result = if ctx.cancel.is_cancelled() {
                        self.settle(ctx, ToolCallResult::declined(&p.call, Some(p.category), DeclineReason::Cancelled))
                    } else if finished.load(Ordering::SeqCst) {
                        self.settle(ctx, ToolCallResult::declined(&p.call, Some(p.category), DeclineReason::SessionFinished))
                    } else {
                        self.confirm_and_run(&p, ctx).await
                    };
                    if result.terminal {
                        finished.store(true, Ordering::SeqCst);
                    }
                    out.push((i, result));
                }
                out
            }
        };

        let (auto_results, confirm_results) = tokio::join!(auto_fut, confirm_fut);
        for (i, r) in auto_results.into_iter().chain(confirm_results) {
            slots[i] = Some(r);
        }

        let results: Vec<ToolCallResult> = slots
            .into_iter()
            .zip(calls)
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| ToolCallResult::declined(call, None, DeclineReason::Cancelled))
            })
            .collect();
        BatchOutcome {
            cancelled: ctx.cancel.is_cancelled(),
            results,
        }
    }

    /// 步骤 3：确认（写类附带 diff），同意后执行
    async fn confirm_and_run(&self, p: &Prepared, ctx: &BatchContext<'_>) -> ToolCallResult {
        let diff = if p.category == PermissionCategory::Write {
            p.tool.propose_diff(&p.call.arguments).await
        } else {
            None
        };
        let decision = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            d = ctx.confirmer.confirm(&p.call, diff.as_deref()) => Some(d),
        };
        match decision {
            None => self.settle(
                ctx,
                ToolCallResult::declined(&p.call, Some(p.category), DeclineReason::Cancelled),
            ),
            Some(ConfirmDecision::Denied) => self.settle(
                ctx,
                ToolCallResult::declined(&p.call, Some(p.category), DeclineReason::UserDenied),
            ),
            Some(ConfirmDecision::Approved) => self.run(p, ctx).await,
        }
    }

    /// 步骤 4：带超时与取消执行，并输出审计日志
    async fn run(&self, p: &Prepared, ctx: &BatchContext<'_>) -> ToolCallResult {
        (ctx.on_progress)(ToolProgress::Started {
            tool_call_id: p.call.id.clone(),
            tool_name: p.call.tool_name.clone(),
            category: p.category,
        });
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            r = tokio::time::timeout(self.timeout, p.tool.execute(p.call.arguments.clone())) => Some(r),
        };
        let result = match outcome {
            None => ToolCallResult::declined(&p.call, Some(p.category), DeclineReason::Cancelled),
            Some(Ok(Ok(output))) => {
                ToolCallResult::success(&p.call, p.category, output, p.tool.is_terminal())
            }
            Some(Ok(Err(e))) => {
                ToolCallResult::from_error(&p.call, Some(p.category), ToolError::Execution(e))
            }
            Some(Err(_)) => ToolCallResult::from_error(
                &p.call,
                Some(p.category),
                ToolError::Timeout {
                    tool: p.call.tool_name.clone(),
                    secs: self.timeout.as_secs(),
                },
            ),
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": p.call.tool_name,
            "id": p.call.id,
            "status": result.status,
            "permission": p.category.to_string(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&p.call.arguments),
        });
        tracing::info!(audit = %audit, "tool");
        self.settle(ctx, result)
    }

    fn settle(&self, ctx: &BatchContext<'_>, result: ToolCallResult) -> ToolCallResult {
        (ctx.on_progress)(ToolProgress::Completed(result.clone()));
        result
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
