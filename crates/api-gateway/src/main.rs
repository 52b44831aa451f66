//! API Gateway binary.
//!
//! Configuration comes from `GATEWAY_*` environment variables. Logs go to
//! stdout, filtered by `RUST_LOG` (default `info`); set `GATEWAY_LOG_JSON=1`
//! for JSON lines.

use anyhow::{Context, Result};
use api_gateway::{GatewayConfig, LifecycleManager};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("invalid log filter")?;

    let json = std::env::var("GATEWAY_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    }
    .context("tracing already initialised")
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    let gateway = LifecycleManager::start(config)
        .await
        .context("gateway failed to start")?;

    shutdown_signal().await;
    let report = gateway.shutdown().await;
    if !report.drained {
        info!(cancelled = report.cancelled, "Some requests were cancelled at shutdown");
    }
    Ok(())
}
