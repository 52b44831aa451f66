//! Bounded retry loop around one logical call.
//!
//! A failure is retried only when all of these hold:
//! - its classification is on the allow-list (refused, reset, deadline
//!   exceeded, backend unavailable)
//! - the request either never reached the backend, or reissuing it is safe
//!   (idempotent route or caller-supplied idempotency key)
//! - attempts remain and the backoff fits inside the request deadline
//!
//! Every attempt goes back through the rest of the chain, so each one
//! re-enters the circuit breaker on its own.

use crate::domain::config::{RetryConfig, Stage};
use crate::domain::error::{Delivery, GatewayError};
use crate::domain::invocation::Invocation;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::pipeline::{CallOutcome, Interceptor, Next};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Whether `error` from `call` may be reissued at all.
    pub fn is_retryable(&self, error: &GatewayError, call: &Invocation) -> bool {
        match error.retry_delivery() {
            Some(Delivery::NotDelivered) => true,
            Some(Delivery::MaybeApplied) => call.is_replay_safe(),
            None => false,
        }
    }

    /// Exponential delay after attempt `attempt` (1-based), capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// [`base_delay`](Self::base_delay) plus 0 to 10% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let jitter_range = delay.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

pub struct RetryStage {
    policy: RetryPolicy,
    metrics: Arc<GatewayMetrics>,
}

impl RetryStage {
    pub fn new(policy: RetryPolicy, metrics: Arc<GatewayMetrics>) -> Self {
        Self { policy, metrics }
    }
}

#[async_trait]
impl Interceptor for RetryStage {
    fn stage(&self) -> Stage {
        Stage::Retry
    }

    async fn intercept(&self, mut call: Invocation, next: Next<'_>) -> CallOutcome {
        let mut attempt = 1;
        loop {
            call.attempt = attempt;
            let error = match next.run(call.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.policy.is_retryable(&error, &call) {
                return Err(error);
            }

            if attempt >= self.policy.max_attempts {
                self.metrics.record_retries_exhausted();
                warn!(
                    route = call.route.name,
                    backend = call.backend(),
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(GatewayError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.policy.backoff(attempt);
            if Instant::now() + delay >= call.deadline {
                debug!(
                    route = call.route.name,
                    attempt,
                    "No time left in the request deadline for another attempt"
                );
                return Err(error);
            }

            debug!(
                route = call.route.name,
                backend = call.backend(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying call"
            );
            tokio::time::sleep(delay).await;
            self.metrics.record_retry_attempt();
            attempt += 1;
        }
    }
}
