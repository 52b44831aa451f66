//! Per-request call state carried through the interceptor chain.

use crate::domain::correlation::{CorrelationId, TraceContext, REQUEST_ID_KEY, TRACEPARENT_KEY};
use crate::domain::identity::{Identity, USER_ID_KEY};
use crate::domain::routes::RouteSpec;
use crate::domain::value::Value;
use crate::ports::outbound::BackendRequest;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Transport metadata, lower-case keys
pub type Metadata = BTreeMap<String, String>;

/// Inbound and outbound key for caller-supplied idempotency keys
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
/// Inbound native RPC key holding `Bearer <token>`
pub const AUTHORIZATION_KEY: &str = "authorization";
/// Outbound key carrying the 1-based attempt number
pub const ATTEMPT_KEY: &str = "x-attempt";

/// One logical call: created by the dispatcher, dropped with the response.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub route: &'static RouteSpec,
    pub correlation_id: CorrelationId,
    pub trace: TraceContext,
    /// Raw bearer token, if the caller sent one
    pub credential: Option<String>,
    pub idempotency_key: Option<String>,
    /// Canonical request payload
    pub payload: Value,
    /// Set by the auth stage
    pub identity: Option<Identity>,
    /// 1-based; bumped by the retry stage
    pub attempt: u32,
    /// Whole-request deadline, retries included
    pub deadline: Instant,
    pub span: tracing::Span,
}

impl Invocation {
    pub fn new(route: &'static RouteSpec, payload: Value, deadline: Instant) -> Self {
        Self {
            route,
            correlation_id: CorrelationId::new(),
            trace: TraceContext::new_root(),
            credential: None,
            idempotency_key: None,
            payload,
            identity: None,
            attempt: 1,
            deadline,
            span: tracing::Span::none(),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.route.backend
    }

    pub fn method(&self) -> &'static str {
        self.route.backend_method
    }

    /// Reissuing cannot double-apply: idempotent route or keyed call.
    pub fn is_replay_safe(&self) -> bool {
        self.route.idempotent || self.idempotency_key.is_some()
    }

    /// Record the verified caller and fill identity-sourced fields.
    ///
    /// Identity fields always win over anything the caller put there.
    pub fn bind_identity(&mut self, identity: Identity) {
        if !matches!(self.payload, Value::Map(_)) {
            self.payload = Value::map();
        }
        for target in self.route.identity_targets() {
            self.payload
                .insert(target, Value::Str(identity.subject_id.clone()));
        }
        self.identity = Some(identity);
    }

    /// Budget for the next attempt: the route timeout, clipped to what is
    /// left of the request deadline. `None` once the deadline has passed.
    pub fn attempt_timeout(&self, now: Instant) -> Option<Duration> {
        let remaining = self.deadline.checked_duration_since(now)?;
        if remaining.is_zero() {
            return None;
        }
        Some(remaining.min(self.route.timeout))
    }

    /// Build the outbound request for the current attempt.
    pub fn backend_request(&self, timeout: Duration) -> BackendRequest {
        let mut metadata = Metadata::new();
        metadata.insert(TRACEPARENT_KEY.into(), self.trace.child().to_header());
        metadata.insert(REQUEST_ID_KEY.into(), self.correlation_id.to_string());
        metadata.insert(ATTEMPT_KEY.into(), self.attempt.to_string());
        if let Some(identity) = &self.identity {
            metadata.insert(USER_ID_KEY.into(), identity.subject_id.clone());
        }
        if let Some(key) = &self.idempotency_key {
            metadata.insert(IDEMPOTENCY_KEY.into(), key.clone());
        }

        BackendRequest {
            method: self.method().to_string(),
            metadata,
            payload: self.payload.clone(),
            timeout,
        }
    }
}
