//! Admission rate limiting with token buckets.
//!
//! One bucket shared by all routes, or one bucket per route, depending on
//! `rate_limit.scope`. Buckets are GCRA limiters from `governor`: refill is
//! computed from elapsed time at each check, nothing runs in the background,
//! and a check never waits. An empty bucket rejects immediately.

use crate::domain::config::{RateLimitConfig, RateLimitScope, Stage};
use crate::domain::error::GatewayError;
use crate::domain::invocation::Invocation;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::pipeline::{CallOutcome, Interceptor, Next};
use async_trait::async_trait;
use dashmap::DashMap;
use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type Bucket<C> = RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Counters for admission checks
#[derive(Debug, Default)]
pub struct RateLimitStats {
    pub checks: AtomicU64,
    pub granted: AtomicU64,
    pub rejected: AtomicU64,
}

/// Token buckets shared across all requests
pub struct RateLimitState<C: Clock = DefaultClock> {
    config: RateLimitConfig,
    quota: Quota,
    clock: C,
    global: Bucket<C>,
    per_route: DashMap<&'static str, Bucket<C>>,
    stats: RateLimitStats,
}

impl RateLimitState<DefaultClock> {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, DefaultClock::default())
    }
}

impl<C: Clock> RateLimitState<C> {
    /// Build on an explicit clock; tests pass a `FakeRelativeClock`.
    pub fn with_clock(config: RateLimitConfig, clock: C) -> Self {
        let quota = quota(&config);
        Self {
            global: RateLimiter::direct_with_clock(quota, &clock),
            per_route: DashMap::new(),
            quota,
            clock,
            config,
            stats: RateLimitStats::default(),
        }
    }

    /// Take one token for `route`, or say how long until one is available.
    pub fn check(&self, route: &'static str) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.config.scope {
            RateLimitScope::Global => self.global.check(),
            RateLimitScope::PerRoute => {
                let bucket = self.per_route.entry(route).or_insert_with(|| {
                    debug!(route, "Creating rate limit bucket");
                    RateLimiter::direct_with_clock(self.quota, &self.clock)
                });
                bucket.check()
            }
        };

        match outcome {
            Ok(()) => {
                self.stats.granted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(not_until) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(not_until.wait_time_from(self.clock.now()))
            }
        }
    }

    pub fn stats(&self) -> &RateLimitStats {
        &self.stats
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Number of per-route buckets created so far
    pub fn bucket_count(&self) -> usize {
        match self.config.scope {
            RateLimitScope::Global => 1,
            RateLimitScope::PerRoute => self.per_route.len(),
        }
    }
}

/// `capacity` tokens, one more every `1 / refill_per_second` seconds.
fn quota(config: &RateLimitConfig) -> Quota {
    let refill = NonZeroU32::new(config.refill_per_second).unwrap_or(NonZeroU32::MIN);
    let capacity = NonZeroU32::new(config.capacity).unwrap_or(NonZeroU32::MIN);
    Quota::per_second(refill).allow_burst(capacity)
}

/// Interceptor taking one token per logical call.
pub struct RateLimitStage<C: Clock = DefaultClock> {
    state: Arc<RateLimitState<C>>,
    metrics: Arc<GatewayMetrics>,
}

impl<C: Clock> RateLimitStage<C> {
    pub fn new(state: Arc<RateLimitState<C>>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { state, metrics }
    }
}

#[async_trait]
impl<C> Interceptor for RateLimitStage<C>
where
    C: Clock + Send + Sync + 'static,
    C::Instant: Send + Sync,
{
    fn stage(&self) -> Stage {
        Stage::RateLimit
    }

    async fn intercept(&self, call: Invocation, next: Next<'_>) -> CallOutcome {
        if !self.state.config().enabled {
            return next.run(call).await;
        }

        match self.state.check(call.route.name) {
            Ok(()) => {
                self.metrics.record_rate_limit_check(true);
                next.run(call).await
            }
            Err(retry_after) => {
                self.metrics.record_rate_limit_check(false);
                warn!(
                    route = call.route.name,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Err(GatewayError::RateLimited { retry_after })
            }
        }
    }
}
