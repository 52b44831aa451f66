//! API Gateway: the single edge between clients and the chat platform's
//! backend services.
//!
//! # Architecture
//!
//! ```text
//!   HTTP/JSON :8080                 native RPC :9090
//!        │                                │
//!   Cors → Tracing → Validation           │
//!        │                                │
//!   transcode (route field mapping)   canonical payload check
//!        └───────────────┬────────────────┘
//!                        ▼
//!                   Dispatcher  (admission flag, deadline, drain)
//!                        │
//!   Auth → RateLimit → Retry { CircuitBreaker → BackendTerminal }
//!                        │
//!              ConnectionRegistry (one RpcClient per backend)
//!                        │
//!        users · servers · messages · friends
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use api_gateway::{GatewayConfig, LifecycleManager};
//!
//! let gateway = LifecycleManager::start(GatewayConfig::from_env()?).await?;
//! // ...
//! gateway.shutdown().await;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod dispatch;
pub mod domain;
pub mod lifecycle;
pub mod middleware;
pub mod ports;
pub mod service;
pub mod transport;

// Re-exports for public API
pub use adapters::{ConnectionRegistry, ScriptedBackend};
pub use dispatch::{Dispatcher, InboundCall};
pub use domain::config::GatewayConfig;
pub use domain::error::{ApiError, AuthError, GatewayError, ValidationError};
pub use domain::routes::{get_route, RouteSpec, ROUTES};
pub use domain::value::Value;
pub use lifecycle::{LifecycleManager, ShutdownReport, StartupError};
pub use middleware::GatewayMetrics;
pub use ports::{BackendClient, BackendRequest, CallError};
pub use service::{http_router, NativeRpcHandler};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
