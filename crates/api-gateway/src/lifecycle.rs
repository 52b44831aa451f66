//! Start/stop ordering and graceful drain.
//!
//! Startup: validate config, dial every backend (fail fast), build the
//! dispatcher, bind HTTP then RPC, serve. Shutdown: stop admitting, drain
//! in-flight requests for up to `shutdown.grace_period`, cancel the rest,
//! stop the listeners and close every backend connection.

use crate::adapters::registry::ConnectionRegistry;
use crate::dispatch::Dispatcher;
use crate::domain::config::{ConfigError, GatewayConfig};
use crate::domain::error::GatewayError;
use crate::middleware::metrics::GatewayMetrics;
use crate::service::{http_router, NativeRpcHandler};
use crate::transport::server::RpcServer;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long a listener gets to wind down once its requests are gone
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend connection failed: {0}")]
    Backend(#[from] GatewayError),
    #[error("cannot bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        source: io::Error,
    },
}

/// Outcome of [`LifecycleManager::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight request finished inside the grace period
    pub drained: bool,
    /// Requests cancelled once the grace period ran out
    pub cancelled: usize,
}

struct RpcControl {
    addr: SocketAddr,
    stop: CancellationToken,
    abort: CancellationToken,
}

/// A running gateway.
pub struct LifecycleManager {
    config: GatewayConfig,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    http_addr: SocketAddr,
    http_stop: CancellationToken,
    rpc: Option<RpcControl>,
    listeners: Mutex<Vec<(&'static str, JoinHandle<io::Result<()>>)>>,
    stopping: AtomicBool,
}

impl LifecycleManager {
    /// Dial the configured backends and start serving.
    pub async fn start(config: GatewayConfig) -> Result<Self, StartupError> {
        config.validate()?;
        info!(backends = config.backends.len(), "Starting API Gateway...");
        let registry = ConnectionRegistry::connect_all(&config).await?;
        Self::start_with_registry(config, registry).await
    }

    /// Start serving on an already populated registry.
    pub async fn start_with_registry(
        config: GatewayConfig,
        registry: ConnectionRegistry,
    ) -> Result<Self, StartupError> {
        let registry = Arc::new(registry);
        let metrics = Arc::new(GatewayMetrics::new());
        let dispatcher = Arc::new(Dispatcher::build(&config, Arc::clone(&registry), metrics)?);

        let http_listener = bind("http", config.http_addr()).await?;
        let http_addr = http_listener.local_addr().map_err(|source| StartupError::Bind {
            listener: "http",
            addr: config.http_addr(),
            source,
        })?;

        let rpc_server = if config.rpc.enabled {
            let listener = bind("rpc", config.rpc_addr()).await?;
            let handler = Arc::new(NativeRpcHandler::new(Arc::clone(&dispatcher)));
            Some(RpcServer::from_listener(
                listener,
                handler,
                config.limits.max_frame_size,
            ))
        } else {
            None
        };

        let mut listeners = Vec::new();

        let http_stop = CancellationToken::new();
        let router = http_router(Arc::clone(&dispatcher), &config);
        let graceful = http_stop.clone();
        listeners.push((
            "http",
            tokio::spawn(async move {
                axum::serve(http_listener, router)
                    .with_graceful_shutdown(graceful.cancelled_owned())
                    .await
            }),
        ));
        info!(addr = %http_addr, "HTTP listener started");

        let rpc = rpc_server.map(|server| {
            let control = RpcControl {
                addr: server.local_addr(),
                stop: server.stop_token(),
                abort: server.abort_token(),
            };
            listeners.push(("rpc", tokio::spawn(server.serve())));
            info!(addr = %control.addr, "RPC listener started");
            control
        });

        info!("API Gateway started successfully");
        Ok(Self {
            config,
            dispatcher,
            registry,
            http_addr,
            http_stop,
            rpc,
            listeners: Mutex::new(listeners),
            stopping: AtomicBool::new(false),
        })
    }

    /// Bound HTTP address (resolved when the configured port is 0)
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc.as_ref().map(|rpc| rpc.addr)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        self.dispatcher.metrics()
    }

    /// Stop the gateway. Safe to call more than once; later calls return
    /// immediately.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return ShutdownReport {
                drained: true,
                cancelled: 0,
            };
        }

        let grace = self.config.shutdown.grace_period;
        info!(
            in_flight = self.dispatcher.in_flight(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down, no longer admitting requests"
        );
        self.dispatcher.stop_admission();
        if let Some(rpc) = &self.rpc {
            rpc.stop.cancel();
        }

        let drained = self.dispatcher.drain(grace).await;
        let mut cancelled = 0;
        if !drained {
            cancelled = self.dispatcher.in_flight();
            warn!(remaining = cancelled, "Grace period elapsed, cancelling in-flight requests");
            self.dispatcher.cancel_in_flight();
            // Cancelled requests finish on their next poll
            self.dispatcher.drain(LISTENER_STOP_TIMEOUT).await;
        }

        self.http_stop.cancel();
        if let Some(rpc) = &self.rpc {
            rpc.abort.cancel();
        }

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for (name, handle) in listeners {
            match tokio::time::timeout(LISTENER_STOP_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!(listener = name, error = %e, "Listener failed"),
                Ok(Err(e)) => error!(listener = name, error = %e, "Listener task panicked"),
                Err(_) => warn!(listener = name, "Listener did not stop in time"),
            }
        }

        self.registry.close_all().await;
        info!(drained, cancelled, "API Gateway stopped");
        ShutdownReport { drained, cancelled }
    }
}

async fn bind(listener: &'static str, addr: SocketAddr) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind {
            listener,
            addr,
            source,
        })
}
