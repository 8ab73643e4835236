//! 会话监管：取消令牌生命周期
//!
//! 用户 Ctrl+C 时取消当前会话；每次提交前 renew，已取消的令牌不会影响下一轮。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 会话级取消管理
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    cancel_token: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前令牌（克隆）
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// 触发取消（用户 Ctrl+C）
    pub fn cancel(&self) {
        if let Ok(token) = self.cancel_token.lock() {
            token.cancel();
        }
    }

    /// 换一个新令牌并返回它（新一轮会话开始时调用）
    pub fn renew(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        if let Ok(mut token) = self.cancel_token.lock() {
            *token = fresh.clone();
        }
        fresh
    }

    /// 子令牌：随会话一起取消（用于单个工具调用）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token().child_token()
    }
}
