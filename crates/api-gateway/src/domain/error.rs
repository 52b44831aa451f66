//! Gateway error taxonomy and its HTTP / RPC mappings.
//!
//! Every failure a request can meet is a [`GatewayError`]. The HTTP surface
//! renders it as an [`ApiError`] body, the native RPC surface as an
//! [`RpcStatus`].

use crate::domain::status::{RpcCode, RpcStatus};
use crate::ports::outbound::CallError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Credential verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("credential expired")]
    Expired,
    #[error("credential has no subject")]
    MissingSubject,
}

/// Input that failed field-level or body-level validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Error about the request body as a whole
    pub fn body(reason: impl Into<String>) -> Self {
        Self::new("body", reason)
    }
}

/// Whether a failed call may already have taken effect on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The backend never processed the request (refused, unavailable).
    NotDelivered,
    /// The backend may have applied the request (reset, deadline).
    MaybeApplied,
}

/// Gateway-level errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("circuit open for backend {backend}")]
    CircuitOpen { backend: String },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<GatewayError>,
    },

    #[error("backend {backend} unavailable: {source}")]
    BackendUnavailable { backend: String, source: CallError },

    /// Application error returned by the backend, passed through unchanged.
    #[error("{0}")]
    Backend(RpcStatus),

    #[error("unknown backend: {0}")]
    BackendUnknown(String),

    #[error("no route for {0}")]
    NotFound(String),

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map a single call outcome into the taxonomy.
    pub fn from_call(backend: &str, error: CallError) -> Self {
        match error {
            CallError::Status(status) => GatewayError::Backend(status),
            CallError::Cancelled => GatewayError::Cancelled,
            other => GatewayError::BackendUnavailable {
                backend: backend.to_string(),
                source: other,
            },
        }
    }

    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Auth(_) => 401,
            GatewayError::Validation(_) => 400,
            GatewayError::PayloadTooLarge { .. } => 413,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::CircuitOpen { .. } => 503,
            GatewayError::RetryExhausted { .. } => 503,
            GatewayError::BackendUnavailable { .. } => 503,
            GatewayError::Backend(status) => status.code.http_status(),
            GatewayError::BackendUnknown(_) => 500,
            GatewayError::NotFound(_) => 404,
            GatewayError::ShuttingDown => 503,
            GatewayError::Cancelled => 499,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code used in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(_) => "unauthenticated",
            GatewayError::Validation(_) => "invalid_argument",
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::RetryExhausted { .. } => "retry_exhausted",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::Backend(status) => status.code.as_str(),
            GatewayError::BackendUnknown(_) => "internal",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::ShuttingDown => "shutting_down",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Status returned to native RPC callers.
    pub fn rpc_status(&self) -> RpcStatus {
        let code = match self {
            GatewayError::Auth(_) => RpcCode::Unauthenticated,
            GatewayError::Validation(_) | GatewayError::PayloadTooLarge { .. } => {
                RpcCode::InvalidArgument
            }
            GatewayError::RateLimited { .. } => RpcCode::ResourceExhausted,
            GatewayError::CircuitOpen { .. }
            | GatewayError::RetryExhausted { .. }
            | GatewayError::ShuttingDown => RpcCode::Unavailable,
            GatewayError::BackendUnavailable {
                source: CallError::DeadlineExceeded(_),
                ..
            } => RpcCode::DeadlineExceeded,
            GatewayError::BackendUnavailable { .. } => RpcCode::Unavailable,
            GatewayError::Backend(status) => return status.clone(),
            GatewayError::BackendUnknown(_) | GatewayError::Internal(_) => RpcCode::Internal,
            GatewayError::NotFound(_) => RpcCode::Unimplemented,
            GatewayError::Cancelled => RpcCode::Cancelled,
        };
        RpcStatus::new(code, self.to_string())
    }

    /// True when the outcome says the backend is unhealthy. Application
    /// errors (not found, invalid argument, ...) count as healthy replies.
    pub fn is_backend_failure(&self) -> bool {
        match self {
            GatewayError::BackendUnavailable { .. } => true,
            GatewayError::Backend(status) => status.code.is_server_fault(),
            _ => false,
        }
    }

    /// Retry classification. `None` means the failure is never retried.
    pub fn retry_delivery(&self) -> Option<Delivery> {
        match self {
            GatewayError::BackendUnavailable { source, .. } => match source {
                CallError::ConnectionRefused(_) => Some(Delivery::NotDelivered),
                CallError::ConnectionReset(_) | CallError::DeadlineExceeded(_) => {
                    Some(Delivery::MaybeApplied)
                }
                _ => None,
            },
            GatewayError::Backend(status) => match status.code {
                RpcCode::Unavailable => Some(Delivery::NotDelivered),
                RpcCode::DeadlineExceeded => Some(Delivery::MaybeApplied),
                _ => None,
            },
            _ => None,
        }
    }
}

/// JSON error body: `{"error": {"code", "message", "data"}}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&GatewayError> for ApiError {
    fn from(err: &GatewayError) -> Self {
        let api = ApiError::new(err.code(), err.to_string());
        match err {
            GatewayError::RateLimited { retry_after } => api.with_data(serde_json::json!({
                "retry_after_ms": retry_after.as_millis() as u64
            })),
            GatewayError::CircuitOpen { backend } => {
                api.with_data(serde_json::json!({ "backend": backend }))
            }
            GatewayError::RetryExhausted { attempts, last } => api.with_data(serde_json::json!({
                "attempts": attempts,
                "last_error": last.code(),
            })),
            GatewayError::Validation(v) => api.with_data(serde_json::json!({ "field": v.field })),
            GatewayError::PayloadTooLarge { limit } => {
                api.with_data(serde_json::json!({ "limit": limit }))
            }
            _ => api,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::from(&err)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        struct Inner<'a>(&'a ApiError);

        impl Serialize for Inner<'_> {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                let mut state = serializer.serialize_struct("ApiErrorInner", 3)?;
                state.serialize_field("code", &self.0.code)?;
                state.serialize_field("message", &self.0.message)?;
                if let Some(ref data) = self.0.data {
                    state.serialize_field("data", data)?;
                }
                state.end()
            }
        }

        let mut state = serializer.serialize_struct("ApiError", 1)?;
        state.serialize_field("error", &Inner(self))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ApiError {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct InnerHelper {
            code: String,
            message: String,
            data: Option<serde_json::Value>,
        }

        #[derive(Deserialize)]
        struct Helper {
            error: InnerHelper,
        }

        let helper = Helper::deserialize(deserializer)?;
        Ok(ApiError {
            code: helper.error.code,
            message: helper.error.message,
            data: helper.error.data,
        })
    }
}
