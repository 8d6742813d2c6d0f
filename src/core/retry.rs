//! 有界指数退避重试
//!
//! 仅对 `MemoryError::TransientBackend` 重试；其它错误立即返回。

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::MemoryResult;

/// 重试策略（对应配置 [retry] 段）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次），至少 1
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 不重试（测试与一次性调用）
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = (self.initial_backoff_ms as f64 * factor) as u64;
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// 按策略执行 op；对可重试错误退避后再试，耗尽次数后返回最后一次错误
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> MemoryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MemoryResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retriable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(op, attempt, ?delay, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
