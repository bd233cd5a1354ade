use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::{LimiterError, RpcError};

/// Bounded exponential retry shared by the pager and the resolver
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Open breakers and terminal responses are never retried
    pub fn is_retryable(err: &LimiterError) -> bool {
        matches!(
            err,
            LimiterError::Rpc(RpcError::Transient(_)) | LimiterError::Rpc(RpcError::RateLimited)
        )
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, LimiterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LimiterError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && Self::is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}): {}. Retrying in {:?}",
                        label,
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
