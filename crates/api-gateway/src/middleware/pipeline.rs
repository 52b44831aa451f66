//! Interceptor chain around every backend call.
//!
//! ```text
//! Invocation → auth → rate_limit → retry ─┬→ circuit_breaker → backend
//!                                         └─ (again, per attempt)
//! ```
//!
//! Each stage sees the invocation and a [`Next`] handle for the rest of the
//! chain. A stage may reject, pass through, or run `next` several times (the
//! retry stage does). The backend call is always the terminal.

use crate::domain::config::Stage;
use crate::domain::error::GatewayError;
use crate::domain::invocation::Invocation;
use crate::domain::value::Value;
use async_trait::async_trait;
use std::sync::Arc;

pub type CallOutcome = Result<Value, GatewayError>;

/// One stage of the chain.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn intercept(&self, call: Invocation, next: Next<'_>) -> CallOutcome;
}

/// End of the chain: performs the backend call.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn call(&self, call: Invocation) -> CallOutcome;
}

/// The remainder of the chain after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub async fn run(self, call: Invocation) -> CallOutcome {
        match self.chain.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    chain: rest,
                    terminal: self.terminal,
                };
                stage.intercept(call, next).await
            }
            None => self.terminal.call(call).await,
        }
    }
}

/// The four resilience stages, ready to be ordered.
pub struct StageSet {
    pub auth: Arc<dyn Interceptor>,
    pub rate_limit: Arc<dyn Interceptor>,
    pub retry: Arc<dyn Interceptor>,
    pub circuit_breaker: Arc<dyn Interceptor>,
}

impl StageSet {
    fn take(&self, stage: Stage) -> Arc<dyn Interceptor> {
        match stage {
            Stage::Auth => Arc::clone(&self.auth),
            Stage::RateLimit => Arc::clone(&self.rate_limit),
            Stage::Retry => Arc::clone(&self.retry),
            Stage::CircuitBreaker => Arc::clone(&self.circuit_breaker),
        }
    }
}

/// Ordered chain plus terminal, built once at startup.
pub struct Pipeline {
    chain: Vec<Arc<dyn Interceptor>>,
    terminal: Arc<dyn Terminal>,
}

impl Pipeline {
    pub fn new(chain: Vec<Arc<dyn Interceptor>>, terminal: Arc<dyn Terminal>) -> Self {
        Self { chain, terminal }
    }

    /// Arrange `stages` in `order`. The order is expected to have passed
    /// `PipelineConfig::validate`.
    pub fn ordered(order: &[Stage], stages: &StageSet, terminal: Arc<dyn Terminal>) -> Self {
        let chain = order.iter().map(|stage| stages.take(*stage)).collect();
        Self::new(chain, terminal)
    }

    pub async fn execute(&self, call: Invocation) -> CallOutcome {
        Next {
            chain: &self.chain,
            terminal: self.terminal.as_ref(),
        }
        .run(call)
        .await
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.chain.iter().map(|stage| stage.stage()).collect()
    }
}
