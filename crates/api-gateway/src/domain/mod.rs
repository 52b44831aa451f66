//! Domain types for the API Gateway.
//!
//! Configuration, error taxonomy, the route table and the per-request
//! invocation state. Nothing here performs I/O.

pub mod config;
pub mod correlation;
pub mod error;
pub mod identity;
pub mod invocation;
pub mod routes;
pub mod status;
pub mod value;

// Re-exports for convenience
pub use config::{GatewayConfig, Stage};
pub use correlation::{CorrelationId, TraceContext};
pub use error::{ApiError, AuthError, Delivery, GatewayError, ValidationError};
pub use identity::Identity;
pub use invocation::{Invocation, Metadata};
pub use routes::{get_route, is_public_route, RouteSpec, ROUTES};
pub use status::{RpcCode, RpcStatus};
pub use value::Value;
