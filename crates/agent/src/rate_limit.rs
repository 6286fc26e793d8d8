//! Per-tool token buckets. Each tool gets a bucket holding `burst` tokens
//! that refill at the tool's declared rate per minute. Buckets read tokio's
//! clock, so refills follow a paused test runtime.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use clerk_core::domain::tool::ToolError;
use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Monotonic clock backed by [`tokio::time::Instant`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

type Bucket = Governor<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
    burst: NonZeroU32,
    wait_ceiling: Duration,
    clock: TokioClock,
}

impl RateLimiter {
    pub fn new(burst: u32, wait_ceiling: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            burst: NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN),
            wait_ceiling,
            clock: TokioClock,
        }
    }

    fn bucket(&self, key: &str, per_minute: u32) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                let rate = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
                let quota = Quota::per_minute(rate).allow_burst(self.burst);
                Arc::new(Governor::direct_with_clock(quota, self.clock))
            })
            .clone()
    }

    /// Takes one token for `key`, waiting for a refill when the bucket is
    /// empty. Fails with `rate_limited` instead of waiting past the ceiling.
    /// Returns how long the caller waited.
    pub async fn acquire(&self, key: &str, per_minute: u32) -> Result<Duration, ToolError> {
        let bucket = self.bucket(key, per_minute);
        let mut waited = Duration::ZERO;

        loop {
            let not_until = match bucket.check() {
                Ok(()) => return Ok(waited),
                Err(not_until) => not_until,
            };
            let wait = not_until.wait_time_from(self.clock.now()).max(Duration::from_millis(1));

            if waited + wait > self.wait_ceiling {
                warn!(
                    event_name = "agent.executor.rate_limited",
                    tool = key,
                    wait_ms = wait.as_millis() as u64,
                    ceiling_ms = self.wait_ceiling.as_millis() as u64,
                    "rate limit wait exceeds ceiling"
                );
                return Err(ToolError::rate_limited(
                    format!("`{key}` is rate limited; next token in {}ms", wait.as_millis()),
                    Some(wait.as_millis() as u64),
                ));
            }

            debug!(
                event_name = "agent.executor.rate_limit_wait",
                tool = key,
                wait_ms = wait.as_millis() as u64,
                "waiting for rate limit token"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clerk_core::domain::tool::ToolErrorKind;

    use super::RateLimiter;

    #[tokio::test]
    async fn burst_is_served_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_millis(100));
        for _ in 0..3 {
            assert_eq!(limiter.acquire("get_faq", 60).await, Ok(Duration::ZERO));
        }
    }

    #[tokio::test]
    async fn wait_beyond_ceiling_is_rate_limited() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100));
        limiter.acquire("get_order_status", 1).await.expect("first token");

        let error = limiter.acquire("get_order_status", 1).await.expect_err("empty bucket");
        assert_eq!(error.kind, ToolErrorKind::RateLimited);
        assert!(error.retry_after_ms.is_some_and(|ms| ms > 100));
    }

    #[tokio::test]
    async fn buckets_are_per_tool() {
        let limiter = RateLimiter::new(1, Duration::ZERO);
        limiter.acquire("search_products", 1).await.expect("search token");
        limiter.acquire("get_policy", 1).await.expect("policy token");
        assert!(limiter.acquire("search_products", 1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn short_waits_are_absorbed() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        limiter.acquire("get_store_info", 1_200).await.expect("first token");

        let started = tokio::time::Instant::now();
        let waited = limiter.acquire("get_store_info", 1_200).await.expect("refilled token");
        assert_eq!(waited, Duration::from_millis(50));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_refill_as_the_runtime_clock_advances() {
        let limiter = RateLimiter::new(2, Duration::ZERO);
        limiter.acquire("get_policy", 60).await.expect("first token");
        limiter.acquire("get_policy", 60).await.expect("second token");
        assert!(limiter.acquire("get_policy", 60).await.is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.acquire("get_policy", 60).await, Ok(Duration::ZERO));
        assert!(limiter.acquire("get_policy", 60).await.is_err());
    }
}
