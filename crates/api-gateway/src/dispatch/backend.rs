//! Terminal of the interceptor chain: one call to one backend.

use crate::adapters::registry::ConnectionRegistry;
use crate::domain::error::GatewayError;
use crate::domain::invocation::Invocation;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::pipeline::{CallOutcome, Terminal};
use crate::ports::outbound::CallError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub struct BackendTerminal {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl BackendTerminal {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { registry, metrics }
    }
}

#[async_trait]
impl Terminal for BackendTerminal {
    async fn call(&self, call: Invocation) -> CallOutcome {
        let backend = call.backend();
        let client = self.registry.get_client(backend)?;

        let Some(timeout) = call.attempt_timeout(Instant::now()) else {
            return Err(GatewayError::BackendUnavailable {
                backend: backend.to_string(),
                source: CallError::DeadlineExceeded(Duration::ZERO),
            });
        };

        self.metrics.record_backend_attempt();
        debug!(
            parent: &call.span,
            backend,
            method = call.method(),
            attempt = call.attempt,
            timeout_ms = timeout.as_millis() as u64,
            "Calling backend"
        );

        match client.call(call.backend_request(timeout)).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let error = GatewayError::from_call(backend, e);
                if error.is_backend_failure() {
                    self.metrics.record_backend_failure();
                }
                debug!(parent: &call.span, backend, attempt = call.attempt, error = %error, "Backend call failed");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::ScriptedBackend;
    use crate::domain::identity::{Identity, USER_ID_KEY};
    use crate::domain::routes::get_route;
    use crate::domain::status::RpcStatus;
    use crate::domain::value::Value;
    use chrono::Utc;
    use std::sync::atomic::Ordering;

    fn terminal(backend: Arc<ScriptedBackend>) -> (BackendTerminal, Arc<GatewayMetrics>) {
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new().with_client(backend));
        (BackendTerminal::new(registry, Arc::clone(&metrics)), metrics)
    }

    fn call(route: &str) -> Invocation {
        Invocation::new(
            get_route(route).unwrap(),
            Value::map(),
            Instant::now() + Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_forwards_method_and_identity() {
        let users = Arc::new(ScriptedBackend::new("users"));
        let (terminal, metrics) = terminal(Arc::clone(&users));

        let mut call = call("users.GetMe");
        call.bind_identity(Identity::new("u-1", Utc::now()));
        terminal.call(call).await.unwrap();

        let request = users.last_request().unwrap();
        assert_eq!(request.method, "users.GetUser");
        assert_eq!(request.payload.get("user_id").and_then(Value::as_str), Some("u-1"));
        assert_eq!(request.metadata.get(USER_ID_KEY).map(String::as_str), Some("u-1"));
        assert_eq!(request.timeout, get_route("users.GetMe").unwrap().timeout);
        assert_eq!(metrics.backend_attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let (terminal, _) = terminal(Arc::new(ScriptedBackend::new("users")));
        assert_eq!(
            terminal.call(call("servers.GetServer")).await,
            Err(GatewayError::BackendUnknown("servers".into()))
        );
    }

    #[tokio::test]
    async fn test_counts_server_faults_only() {
        let users = Arc::new(
            ScriptedBackend::new("users")
                .then(Err(CallError::Status(RpcStatus::not_found("no such user"))))
                .then(Err(CallError::ConnectionReset("eof".into()))),
        );
        let (terminal, metrics) = terminal(users);

        let first = terminal.call(call("users.GetMe")).await;
        assert!(matches!(first, Err(GatewayError::Backend(_))));
        assert_eq!(metrics.backend_failures.load(Ordering::Relaxed), 0);

        let second = terminal.call(call("users.GetMe")).await;
        assert!(matches!(second, Err(GatewayError::BackendUnavailable { .. })));
        assert_eq!(metrics.backend_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_skips_backend() {
        let users = Arc::new(ScriptedBackend::new("users"));
        let (terminal, metrics) = terminal(Arc::clone(&users));

        let mut late = call("users.GetMe");
        late.deadline = Instant::now();
        let result = terminal.call(late).await;

        assert!(matches!(
            result,
            Err(GatewayError::BackendUnavailable {
                source: CallError::DeadlineExceeded(_),
                ..
            })
        ));
        assert_eq!(users.call_count(), 0);
        assert_eq!(metrics.backend_attempts.load(Ordering::Relaxed), 0);
    }
}
