//! Status codes carried by the binary RPC transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// gRPC-style status code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl RpcCode {
    /// Codes that say the backend itself is unhealthy, as opposed to the
    /// request being wrong. Only these feed the circuit breaker.
    pub fn is_server_fault(self) -> bool {
        matches!(
            self,
            RpcCode::Unknown
                | RpcCode::DeadlineExceeded
                | RpcCode::ResourceExhausted
                | RpcCode::Aborted
                | RpcCode::Internal
                | RpcCode::Unavailable
                | RpcCode::DataLoss
        )
    }

    /// HTTP status used when an application error passes through the gateway.
    pub fn http_status(self) -> u16 {
        match self {
            RpcCode::Cancelled => 499,
            RpcCode::Unknown => 500,
            RpcCode::InvalidArgument => 400,
            RpcCode::DeadlineExceeded => 504,
            RpcCode::NotFound => 404,
            RpcCode::AlreadyExists => 409,
            RpcCode::PermissionDenied => 403,
            RpcCode::ResourceExhausted => 429,
            RpcCode::FailedPrecondition => 400,
            RpcCode::Aborted => 409,
            RpcCode::OutOfRange => 400,
            RpcCode::Unimplemented => 501,
            RpcCode::Internal => 500,
            RpcCode::Unavailable => 503,
            RpcCode::DataLoss => 500,
            RpcCode::Unauthenticated => 401,
        }
    }

    /// Stable snake_case name used in JSON error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            RpcCode::Cancelled => "cancelled",
            RpcCode::Unknown => "unknown",
            RpcCode::InvalidArgument => "invalid_argument",
            RpcCode::DeadlineExceeded => "deadline_exceeded",
            RpcCode::NotFound => "not_found",
            RpcCode::AlreadyExists => "already_exists",
            RpcCode::PermissionDenied => "permission_denied",
            RpcCode::ResourceExhausted => "resource_exhausted",
            RpcCode::FailedPrecondition => "failed_precondition",
            RpcCode::Aborted => "aborted",
            RpcCode::OutOfRange => "out_of_range",
            RpcCode::Unimplemented => "unimplemented",
            RpcCode::Internal => "internal",
            RpcCode::Unavailable => "unavailable",
            RpcCode::DataLoss => "data_loss",
            RpcCode::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error status returned by a backend (or by the gateway's own RPC port).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: RpcCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcCode::InvalidArgument, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Internal, message)
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcStatus {}
