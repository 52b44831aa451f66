//! Adapters for the API Gateway.
//!
//! Concrete [`BackendClient`](crate::ports::BackendClient) owners and
//! implementations, plus the HTTP rendering of gateway errors.

pub mod error_conversions;
pub mod registry;
pub mod scripted;

pub use error_conversions::error_response;
pub use registry::ConnectionRegistry;
pub use scripted::ScriptedBackend;
