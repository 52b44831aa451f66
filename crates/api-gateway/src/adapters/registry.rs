//! Connection registry: one persistent client per configured backend.
//!
//! Built once at startup and never mutated afterwards, so lookups need no
//! lock. The dispatcher holds it behind an `Arc`.

use crate::domain::config::GatewayConfig;
use crate::domain::error::GatewayError;
use crate::ports::outbound::BackendClient;
use crate::transport::client::RpcClient;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default)]
pub struct ConnectionRegistry {
    clients: HashMap<String, Arc<dyn BackendClient>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dial every configured backend concurrently. Fails on the first
    /// backend that cannot be reached.
    pub async fn connect_all(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let max_frame = config.limits.max_frame_size;
        let dials = config.backends.iter().cloned().map(|descriptor| async move {
            let name = descriptor.name.clone();
            RpcClient::connect(descriptor, max_frame)
                .await
                .map_err(|source| {
                    warn!(backend = %name, error = %source, "Backend dial failed");
                    GatewayError::BackendUnavailable {
                        backend: name,
                        source,
                    }
                })
        });

        let clients = try_join_all(dials).await?;
        let mut registry = Self::new();
        for client in clients {
            registry = registry.with_client(Arc::new(client));
        }
        info!(backends = registry.len(), "Connected to all backends");
        Ok(registry)
    }

    /// Add a client under the name it reports. Replaces any previous entry.
    pub fn with_client(mut self, client: Arc<dyn BackendClient>) -> Self {
        self.clients.insert(client.backend().to_string(), client);
        self
    }

    pub fn get_client(&self, backend: &str) -> Result<Arc<dyn BackendClient>, GatewayError> {
        self.clients
            .get(backend)
            .cloned()
            .ok_or_else(|| GatewayError::BackendUnknown(backend.to_string()))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close every connection. Calls still waiting fail with `Closed`.
    pub async fn close_all(&self) {
        futures::future::join_all(self.clients.values().map(|client| client.close())).await;
        info!(backends = self.clients.len(), "Closed backend connections");
    }
}
