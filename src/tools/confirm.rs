//! 权限策略与确认协作者
//!
//! PermissionPolicy 把工具的 PermissionCategory 映射为 自动放行 / 需要确认 / 拒绝；
//! Confirmer 由前端提供：CLI 为阻塞式控制台提示，TUI 为可 await 的模态框。

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;

use crate::memory::ToolCallRequest;
use crate::tools::PermissionCategory;

/// 某一权限分类的处理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Auto,
    Confirm,
    Deny,
}

/// 前端给出的确认结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmDecision {
    Approved,
    Denied,
}

/// 分类 -> 处理方式；auto_approve_all 把 Confirm 变为 Auto，但不覆盖 Deny
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionPolicy {
    decisions: BTreeMap<PermissionCategory, PermissionDecision>,
    auto_approve_all: bool,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        let mut decisions = BTreeMap::new();
        decisions.insert(PermissionCategory::ReadOnly, PermissionDecision::Auto);
        decisions.insert(PermissionCategory::Write, PermissionDecision::Confirm);
        decisions.insert(PermissionCategory::Execute, PermissionDecision::Confirm);
        decisions.insert(PermissionCategory::Network, PermissionDecision::Confirm);
        Self {
            decisions,
            auto_approve_all: false,
        }
    }
}

impl PermissionPolicy {
    pub fn with_decision(mut self, category: PermissionCategory, decision: PermissionDecision) -> Self {
        self.decisions.insert(category, decision);
        self
    }

    pub fn with_auto_approve_all(mut self, enabled: bool) -> Self {
        self.auto_approve_all = enabled;
        self
    }

    pub fn decide(&self, category: PermissionCategory) -> PermissionDecision {
        let decision = self
            .decisions
            .get(&category)
            .copied()
            .unwrap_or(PermissionDecision::Confirm);
        match decision {
            PermissionDecision::Confirm if self.auto_approve_all => PermissionDecision::Auto,
            d => d,
        }
    }
}

/// 确认协作者：仅对需要确认的调用调用
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, call: &ToolCallRequest, diff: Option<&str>) -> ConfirmDecision;
}

/// 全部同意（--yes 或测试）
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn confirm(&self, _call: &ToolCallRequest, _diff: Option<&str>) -> ConfirmDecision {
        ConfirmDecision::Approved
    }
}

/// 全部拒绝（无交互环境）
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

#[async_trait]
impl Confirmer for DenyAll {
    async fn confirm(&self, _call: &ToolCallRequest, _diff: Option<&str>) -> ConfirmDecision {
        ConfirmDecision::Denied
    }
}

/// 按脚本依次应答，并记录每次被询问的调用与 diff；脚本耗尽后拒绝
#[derive(Debug, Default, Clone)]
pub struct ScriptedConfirmer {
    answers: Arc<Mutex<VecDeque<ConfirmDecision>>>,
    asked: Arc<Mutex<Vec<(ToolCallRequest, Option<String>)>>>,
}

impl ScriptedConfirmer {
    pub fn new(answers: Vec<ConfirmDecision>) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into())),
            asked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn asked(&self) -> Vec<(ToolCallRequest, Option<String>)> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(&self, call: &ToolCallRequest, diff: Option<&str>) -> ConfirmDecision {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push((call.clone(), diff.map(str::to_string)));
        }
        self.answers
            .lock()
            .ok()
            .and_then(|mut a| a.pop_front())
            .unwrap_or(ConfirmDecision::Denied)
    }
}
