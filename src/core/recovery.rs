//! 错误恢复引擎
//!
//! 根据 ModelError 类型与已尝试次数返回 RecoveryAction：瞬时错误指数退避重试（有界），
//! 非瞬时错误或重试耗尽则升级为 FatalSession。

use std::time::Duration;

use serde::Deserialize;

use crate::core::RecoveryAction;
use crate::llm::ModelError;

/// 重试参数（[engine.retry]）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 含首次请求在内的最大尝试次数
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 服务端 Retry-After 可以超过 max_delay_ms，但不超过此值
    pub max_retry_after_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_retry_after_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待：base * 2^(attempt-1)，封顶 max_delay_ms
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// 语义化错误恢复：将 Provider 错误映射为「等待后重试」或「升级」
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// attempt 为刚失败的那次尝试序号（从 1 开始）
    pub fn handle(&self, err: &ModelError, attempt: u32) -> RecoveryAction {
        if !err.is_transient() {
            return RecoveryAction::Escalate(format!("non-retryable provider error: {err}"));
        }
        if attempt >= self.policy.max_attempts {
            return RecoveryAction::Escalate(format!(
                "provider still failing after {attempt} attempts: {err}"
            ));
        }
        let mut delay_ms = self.policy.backoff(attempt).as_millis() as u64;
        if let ModelError::RateLimited { retry_after_ms } = err {
            delay_ms = delay_ms.max((*retry_after_ms).min(self.policy.max_retry_after_ms));
        }
        RecoveryAction::RetryAfter {
            delay_ms,
            attempt: attempt + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_transient_retries_with_backoff() {
        let engine = RecoveryEngine::new(RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 250,
            ..RetryPolicy::default()
        });
        assert_eq!(
            engine.handle(&ModelError::Timeout, 1),
            RecoveryAction::RetryAfter { delay_ms: 100, attempt: 2 }
        );
        assert_eq!(
            engine.handle(&ModelError::Connection("reset".into()), 2),
            RecoveryAction::RetryAfter { delay_ms: 200, attempt: 3 }
        );
        // 封顶
        assert_eq!(
            engine.handle(&ModelError::Timeout, 3),
            RecoveryAction::RetryAfter { delay_ms: 250, attempt: 4 }
        );
    }

    #[test]
    fn test_recovery_exhausted_escalates() {
        let engine = RecoveryEngine::new(RetryPolicy::default());
        assert!(matches!(
            engine.handle(&ModelError::Timeout, 3),
            RecoveryAction::Escalate(_)
        ));
    }

    #[test]
    fn test_recovery_non_transient_escalates_immediately() {
        let engine = RecoveryEngine::default();
        let action = engine.handle(&ModelError::Auth("bad key".into()), 1);
        match action {
            RecoveryAction::Escalate(msg) => assert!(msg.contains("bad key")),
            _ => panic!("Expected Escalate"),
        }
    }

    #[test]
    fn test_recovery_rate_limit_honours_retry_after() {
        let engine = RecoveryEngine::default();
        let action = engine.handle(&ModelError::RateLimited { retry_after_ms: 5_000 }, 1);
        assert_eq!(action, RecoveryAction::RetryAfter { delay_ms: 5_000, attempt: 2 });
    }

    #[test]
    fn test_recovery_rate_limit_wait_is_clamped() {
        let engine = RecoveryEngine::new(RetryPolicy {
            max_retry_after_ms: 20_000,
            ..RetryPolicy::default()
        });
        let action = engine.handle(&ModelError::RateLimited { retry_after_ms: 3_600_000 }, 1);
        assert_eq!(action, RecoveryAction::RetryAfter { delay_ms: 20_000, attempt: 2 });
    }
}
