// src/limiter.rs
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{LimiterError, RpcError};

#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub requests_per_second: f64,
    pub per_error_penalty: Duration,
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            per_error_penalty: Duration::from_millis(250),
            cooldown_base: Duration::from_secs(1),
            cooldown_max: Duration::from_secs(300),
        }
    }
}

// About 30 years, what tokio itself treats as never
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after` without overflowing on absurd durations
pub fn instant_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_errors: u32,
    cooldown_until: Option<Instant>,
}

/// Single chokepoint for provider calls. Calls go out one at a time in
/// arrival order, spaced by `1 / requests_per_second` plus a penalty per
/// consecutive failure. A 429 opens the breaker for an exponentially growing
/// cooldown during which every submission fails fast.
pub struct RateLimiter {
    min_interval: Duration,
    settings: LimiterSettings,
    // tokio's Mutex wakes waiters in FIFO order, which gives the dispatch queue
    last_dispatch: tokio::sync::Mutex<Option<Instant>>,
    breaker: Mutex<BreakerState>,
}

impl RateLimiter {
    pub fn new(settings: LimiterSettings) -> Self {
        let min_interval = if settings.requests_per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / settings.requests_per_second).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };

        Self {
            min_interval,
            settings,
            last_dispatch: tokio::sync::Mutex::new(None),
            breaker: Mutex::new(BreakerState::default()),
        }
    }

    fn breaker(&self) -> MutexGuard<'_, BreakerState> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time left before the breaker closes, if it is open
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.breaker().cooldown_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.breaker().consecutive_errors
    }

    fn check_cooldown(&self) -> Result<(), LimiterError> {
        match self.cooldown_remaining() {
            Some(remaining) => Err(LimiterError::Cooldown { remaining }),
            None => Ok(()),
        }
    }

    fn cooldown_for(&self, errors: u32) -> Duration {
        let factor = 1u32.checked_shl(errors).unwrap_or(u32::MAX);
        self.settings
            .cooldown_base
            .saturating_mul(factor)
            .min(self.settings.cooldown_max)
    }

    /// Dispatch `call` once its turn in the queue comes up.
    pub async fn submit<T, F, Fut>(&self, call: F) -> Result<T, LimiterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        self.check_cooldown()?;

        let mut last_dispatch = self.last_dispatch.lock().await;

        let spacing = match *last_dispatch {
            Some(at) => self.min_interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        };
        let penalty = self
            .settings
            .per_error_penalty
            .saturating_mul(self.consecutive_errors());
        let wait = spacing.saturating_add(penalty);
        if !wait.is_zero() {
            debug!("Rate limiter waiting {:?} before dispatch", wait);
            sleep(wait).await;
        }

        // The breaker may have opened while this call sat in the queue
        self.check_cooldown()?;

        *last_dispatch = Some(Instant::now());
        let result = call().await;

        let mut breaker = self.breaker();
        match &result {
            Ok(_) => breaker.consecutive_errors = 0,
            Err(RpcError::RateLimited) => {
                breaker.consecutive_errors = breaker.consecutive_errors.saturating_add(1);
                let cooldown = self.cooldown_for(breaker.consecutive_errors);
                breaker.cooldown_until = Some(instant_after(Instant::now(), cooldown));
                warn!(
                    "Provider rate limited us ({} consecutive errors), cooling down for {:?}",
                    breaker.consecutive_errors, cooldown
                );
            }
            Err(e) => {
                breaker.consecutive_errors = breaker.consecutive_errors.saturating_add(1);
                debug!(
                    "Provider call failed ({} consecutive errors): {}",
                    breaker.consecutive_errors, e
                );
            }
        }

        result.map_err(LimiterError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn settings() -> LimiterSettings {
        LimiterSettings {
            requests_per_second: 10.0,
            per_error_penalty: Duration::from_millis(50),
            cooldown_base: Duration::from_secs(1),
            cooldown_max: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_calls_by_min_interval() {
        let limiter = RateLimiter::new(settings());
        let start = Instant::now();

        for _ in 0..3 {
            limiter.submit(|| async { Ok::<_, RpcError>(()) }).await.unwrap();
        }

        // first call is immediate, the next two wait 100ms each
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(250), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_trips_after_rate_limits_and_clears_when_elapsed() {
        let limiter = RateLimiter::new(settings());
        let calls = Arc::new(AtomicU32::new(0));

        let provider = |calls: Arc<AtomicU32>| async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(RpcError::RateLimited)
            } else {
                Ok(n)
            }
        };

        for expected_errors in 1..=3u32 {
            let err = limiter
                .submit(|| provider(calls.clone()))
                .await
                .unwrap_err();
            assert_eq!(err, LimiterError::Rpc(RpcError::RateLimited));
            assert_eq!(limiter.consecutive_errors(), expected_errors);

            let remaining = limiter.cooldown_remaining().unwrap();
            assert_eq!(remaining, Duration::from_secs(1 << expected_errors));
            if expected_errors < 3 {
                tokio::time::advance(remaining).await;
            }
        }

        // 4th submission during the cooldown never reaches the provider
        let err = limiter
            .submit(|| provider(calls.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Cooldown { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(limiter.cooldown_remaining().unwrap()).await;
        let value = limiter.submit(|| provider(calls.clone())).await.unwrap();
        assert_eq!(value, 3);
        assert_eq!(limiter.consecutive_errors(), 0);
        assert!(limiter.cooldown_remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_grow_delay_without_cooldown() {
        let limiter = RateLimiter::new(settings());

        for _ in 0..2 {
            let err = limiter
                .submit(|| async { Err::<(), _>(RpcError::Transient("reset".into())) })
                .await
                .unwrap_err();
            assert!(!err.is_cooldown_signal());
        }
        assert!(limiter.cooldown_remaining().is_none());
        assert_eq!(limiter.consecutive_errors(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        let start = Instant::now();
        limiter.submit(|| async { Ok::<_, RpcError>(()) }).await.unwrap();
        // interval already elapsed, only the 2 x 50ms penalty remains
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "{:?}", elapsed);
        assert_eq!(limiter.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_is_capped() {
        let limiter = RateLimiter::new(LimiterSettings {
            cooldown_max: Duration::from_secs(5),
            ..settings()
        });

        for _ in 0..6 {
            let _ = limiter
                .submit(|| async { Err::<(), _>(RpcError::RateLimited) })
                .await;
            if let Some(remaining) = limiter.cooldown_remaining() {
                assert!(remaining <= Duration::from_secs(5));
                tokio::time::advance(remaining).await;
            }
        }
        assert_eq!(limiter.cooldown_for(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_calls_dispatch_in_order() {
        let limiter = Arc::new(RateLimiter::new(settings()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .submit(|| async move {
                        order.lock().unwrap().push(i);
                        Ok::<_, RpcError>(())
                    })
                    .await
            }));
            // let each task reach the queue before spawning the next
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn extreme_settings_do_not_overflow() {
        let limiter = RateLimiter::new(LimiterSettings {
            requests_per_second: 1e-300,
            per_error_penalty: Duration::MAX,
            cooldown_base: Duration::MAX,
            cooldown_max: Duration::MAX,
        });

        let err = limiter
            .submit(|| async { Err::<(), _>(RpcError::RateLimited) })
            .await
            .unwrap_err();
        assert_eq!(err, LimiterError::Rpc(RpcError::RateLimited));
        assert!(limiter.cooldown_remaining().is_some());
    }
}
