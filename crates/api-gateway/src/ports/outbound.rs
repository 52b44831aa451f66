//! Outbound ports for the API Gateway.
//!
//! The dispatcher only ever talks to backends through [`BackendClient`]. The
//! binary RPC client implements it for production; tests use scripted
//! in-memory backends.

use crate::domain::invocation::Metadata;
use crate::domain::status::RpcStatus;
use crate::domain::value::Value;
use async_trait::async_trait;
use std::time::Duration;

/// One outbound call as seen by a backend client.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Backend method, e.g. `users.GetUser`
    pub method: String,
    /// Transport metadata (trace context, request id, identity)
    pub metadata: Metadata,
    pub payload: Value,
    /// Budget for this attempt
    pub timeout: Duration,
}

/// Outcome of a single backend call that did not produce a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The backend answered with an error status.
    #[error("backend returned {0}")]
    Status(RpcStatus),

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The link died with the request in flight.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Dialing the backend failed at call time.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("call cancelled")]
    Cancelled,

    /// The client has been shut down.
    #[error("client closed")]
    Closed,
}

/// Client handle for one backend service.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Name of the backend this client talks to
    fn backend(&self) -> &str;

    /// Issue one call and wait for its outcome.
    async fn call(&self, request: BackendRequest) -> Result<Value, CallError>;

    /// Close the underlying connection. Later calls fail with `Closed`.
    async fn close(&self);
}
