//! Ports for the API Gateway.
//!
//! Seams between the gateway core and the outside world.

pub mod outbound;

pub use outbound::{BackendClient, BackendRequest, CallError};
