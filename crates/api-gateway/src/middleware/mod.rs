//! Middleware for the API Gateway.
//!
//! Two kinds live here. Tower layers wrap the HTTP surface:
//!
//! ```text
//! Request → Cors → Tracing → Validation → Router
//! ```
//!
//! Interceptors wrap every backend call, whichever surface it came from:
//!
//! ```text
//! Auth → RateLimit → Retry { CircuitBreaker → backend }
//! ```
//!
//! The interceptor order comes from `pipeline.order`.

pub mod auth;
pub mod circuit_breaker;
pub mod cors;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod tracing;
pub mod validation;

pub use auth::{AuthGate, AuthStage, Claims};
pub use circuit_breaker::{
    CircuitBreakerManager, CircuitBreakerStage, CircuitPermit, CircuitState, CircuitStats,
};
pub use cors::create_cors_layer;
pub use metrics::{GatewayMetrics, RequestTimer};
pub use pipeline::{CallOutcome, Interceptor, Next, Pipeline, StageSet, Terminal};
pub use rate_limit::{RateLimitStage, RateLimitState};
pub use retry::{RetryPolicy, RetryStage};
pub use self::tracing::{RequestContext, TracingLayer};
pub use validation::ValidationLayer;

use crate::domain::config::{ConfigError, GatewayConfig};
use governor::clock::{Clock, DefaultClock};
use std::sync::Arc;

/// Shared admission state plus the interceptors built on it
pub struct MiddlewareStack<C: Clock = DefaultClock> {
    pub auth: Arc<AuthGate>,
    pub rate_limit: Arc<RateLimitState<C>>,
    pub circuit_breaker: Arc<CircuitBreakerManager>,
    pub retry: RetryPolicy,
    pub metrics: Arc<GatewayMetrics>,
}

impl MiddlewareStack<DefaultClock> {
    /// Create middleware stack from gateway config
    pub fn from_config(
        config: &GatewayConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, metrics, DefaultClock::default())
    }
}

impl<C> MiddlewareStack<C>
where
    C: Clock + Send + Sync + 'static,
    C::Instant: Send + Sync,
{
    /// Same as [`from_config`](MiddlewareStack::from_config) with rate
    /// limit buckets on `clock`.
    pub fn with_clock(
        config: &GatewayConfig,
        metrics: Arc<GatewayMetrics>,
        clock: C,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            auth: Arc::new(AuthGate::new(&config.auth)?),
            rate_limit: Arc::new(RateLimitState::with_clock(config.rate_limit.clone(), clock)),
            circuit_breaker: Arc::new(CircuitBreakerManager::new(
                config.circuit_breaker.clone(),
            )),
            retry: RetryPolicy::from_config(&config.retry),
            metrics,
        })
    }

    /// One interceptor per stage, each sharing this stack's state.
    pub fn stage_set(&self) -> StageSet {
        StageSet {
            auth: Arc::new(AuthStage::new(
                Arc::clone(&self.auth),
                Arc::clone(&self.metrics),
            )),
            rate_limit: Arc::new(RateLimitStage::new(
                Arc::clone(&self.rate_limit),
                Arc::clone(&self.metrics),
            )),
            retry: Arc::new(RetryStage::new(
                self.retry.clone(),
                Arc::clone(&self.metrics),
            )),
            circuit_breaker: Arc::new(CircuitBreakerStage::new(
                Arc::clone(&self.circuit_breaker),
                Arc::clone(&self.metrics),
            )),
        }
    }

    pub fn circuit_breaker(&self) -> Arc<CircuitBreakerManager> {
        Arc::clone(&self.circuit_breaker)
    }
}
