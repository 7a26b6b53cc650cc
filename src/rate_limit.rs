//! Outbound rate limiting for broker REST calls.
//!
//! The broker enforces a per-minute request quota; exceeding it turns into
//! 429 responses and backoff churn. Every adapter call awaits the limiter
//! before hitting the wire, so bursts (reconciliation storms, many symbols
//! in one tick) are smoothed instead of rejected.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter configuration.
pub struct RateLimiterConfig {
    /// Maximum broker requests per minute.
    pub requests_per_minute: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            // Alpaca's documented REST quota.
            requests_per_minute: 200,
        }
    }
}

/// Shared limiter handle for all broker calls.
#[derive(Clone)]
pub struct BrokerRateLimiter {
    inner: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl BrokerRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        }
    }

    /// Wait until a request slot is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}

impl Default for BrokerRateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
