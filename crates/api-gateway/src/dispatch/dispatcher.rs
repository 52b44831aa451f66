//! Route dispatch: one logical call from either inbound surface.
//!
//! The dispatcher owns admission during shutdown, in-flight tracking and the
//! whole-request deadline. Everything between admission and the backend is
//! the interceptor pipeline.

use crate::adapters::registry::ConnectionRegistry;
use crate::dispatch::backend::BackendTerminal;
use crate::domain::config::{ConfigError, GatewayConfig};
use crate::domain::correlation::{CorrelationId, TraceContext};
use crate::domain::error::GatewayError;
use crate::domain::invocation::Invocation;
use crate::domain::routes::RouteSpec;
use crate::domain::value::Value;
use crate::middleware::circuit_breaker::{CircuitBreakerManager, CircuitStats};
use crate::middleware::metrics::{GatewayMetrics, RequestTimer};
use crate::middleware::pipeline::{CallOutcome, Pipeline};
use crate::middleware::MiddlewareStack;
use crate::ports::outbound::CallError;
use governor::clock::{Clock, DefaultClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, field::Empty, info, info_span, warn, Instrument};

/// A decoded request, ready for the pipeline.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub route: &'static RouteSpec,
    /// Canonical payload, already validated
    pub payload: Value,
    pub credential: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: CorrelationId,
    pub trace: TraceContext,
}

impl InboundCall {
    pub fn new(route: &'static RouteSpec, payload: Value) -> Self {
        Self {
            route,
            payload,
            credential: None,
            idempotency_key: None,
            correlation_id: CorrelationId::new(),
            trace: TraceContext::new_root(),
        }
    }

    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_context(mut self, correlation_id: CorrelationId, trace: TraceContext) -> Self {
        self.correlation_id = correlation_id;
        self.trace = trace;
        self
    }
}

pub struct Dispatcher {
    pipeline: Pipeline,
    metrics: Arc<GatewayMetrics>,
    circuits: Option<Arc<CircuitBreakerManager>>,
    request_deadline: Duration,
    accepting: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(pipeline: Pipeline, metrics: Arc<GatewayMetrics>, request_deadline: Duration) -> Self {
        Self {
            pipeline,
            metrics,
            circuits: None,
            request_deadline,
            accepting: AtomicBool::new(true),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Compose the configured pipeline around `registry`.
    pub fn build(
        config: &GatewayConfig,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, ConfigError> {
        Self::build_with_clock(config, registry, metrics, DefaultClock::default())
    }

    /// [`build`](Self::build) with rate limit buckets on `clock`.
    pub fn build_with_clock<C>(
        config: &GatewayConfig,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<GatewayMetrics>,
        clock: C,
    ) -> Result<Self, ConfigError>
    where
        C: Clock + Send + Sync + 'static,
        C::Instant: Send + Sync,
    {
        config.pipeline.validate()?;
        let stack = MiddlewareStack::with_clock(config, Arc::clone(&metrics), clock)?;
        let terminal = Arc::new(BackendTerminal::new(registry, Arc::clone(&metrics)));
        let pipeline = Pipeline::ordered(&config.pipeline.order, &stack.stage_set(), terminal);

        info!(order = ?pipeline.stages(), "Interceptor pipeline ready");

        let mut dispatcher = Self::new(pipeline, metrics, config.timeouts.request_deadline);
        dispatcher.circuits = Some(stack.circuit_breaker());
        Ok(dispatcher)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Per-backend circuit snapshots, sorted by backend.
    pub fn circuit_stats(&self) -> Vec<CircuitStats> {
        self.circuits
            .as_ref()
            .map(|circuits| circuits.all_stats())
            .unwrap_or_default()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Requests currently inside the pipeline
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Refuse new requests with `ShuttingDown`. In-flight ones continue.
    pub fn stop_admission(&self) {
        self.accepting.store(false, Ordering::Release);
        self.tracker.close();
    }

    /// Wait up to `grace` for in-flight requests. True if all finished.
    pub async fn drain(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }

    /// Abort whatever is still running; those callers get `Cancelled`.
    pub fn cancel_in_flight(&self) {
        self.cancel.cancel();
    }

    /// Run one call through the pipeline and reshape its result.
    pub async fn dispatch(&self, inbound: InboundCall) -> CallOutcome {
        let route = inbound.route;
        if !self.is_accepting() {
            debug!(route = route.name, "Rejecting request during shutdown");
            return Err(GatewayError::ShuttingDown);
        }

        let timer = RequestTimer::new(Arc::clone(&self.metrics));
        let span = info_span!(
            "dispatch",
            route = route.name,
            backend = route.backend,
            request_id = %inbound.correlation_id,
            trace_id = %inbound.trace.trace_id_hex(),
            otel.kind = "internal",
            otel.status_code = Empty,
            error.code = Empty,
        );

        let deadline = Instant::now() + self.request_deadline;
        let mut call = Invocation::new(route, inbound.payload, deadline);
        call.correlation_id = inbound.correlation_id;
        call.trace = inbound.trace;
        call.credential = inbound.credential;
        call.idempotency_key = inbound.idempotency_key;
        call.span = span.clone();

        let work = self.tracker.track_future(self.pipeline.execute(call));
        let outcome = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
                result = tokio::time::timeout_at(deadline, work) => match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GatewayError::BackendUnavailable {
                        backend: route.backend.to_string(),
                        source: CallError::DeadlineExceeded(self.request_deadline),
                    }),
                },
            }
        }
        .instrument(span.clone())
        .await
        .map(route.reshape);

        match &outcome {
            Ok(_) => {
                span.record("otel.status_code", "OK");
                debug!(parent: &span, "Request completed");
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.code", e.code());
                if e.http_status() >= 500 {
                    warn!(parent: &span, error = %e, status = e.http_status(), "Request failed");
                } else {
                    debug!(parent: &span, error = %e, status = e.http_status(), "Request rejected");
                }
            }
        }

        timer.finish(outcome.is_ok());
        outcome
    }
}
