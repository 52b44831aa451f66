//! In-memory backend with scripted outcomes.
//!
//! Stands in for a real service in tests and local demos. Outcomes queued
//! with [`ScriptedBackend::then`] are consumed in order; once the queue is
//! empty every call gets the fallback responder.

use crate::domain::value::Value;
use crate::ports::outbound::{BackendClient, BackendRequest, CallError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub type Outcome = Result<Value, CallError>;

type Responder = Box<dyn Fn(&BackendRequest) -> Outcome + Send + Sync>;

pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Responder,
    delay: Option<Duration>,
    calls: AtomicU64,
    requests: Mutex<Vec<BackendRequest>>,
    closed: AtomicBool,
}

impl ScriptedBackend {
    /// Answers every call with an empty map.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(|_| Ok(Value::map())),
            delay: None,
            calls: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Answer every unscripted call with `outcome`.
    pub fn always(self, outcome: Outcome) -> Self {
        self.responding(move |_| outcome.clone())
    }

    /// Compute unscripted answers from the request.
    pub fn responding<F>(mut self, responder: F) -> Self
    where
        F: Fn(&BackendRequest) -> Outcome + Send + Sync + 'static,
    {
        self.fallback = Box::new(responder);
        self
    }

    /// Queue one outcome ahead of the fallback.
    pub fn then(self, outcome: Outcome) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// Take this long to answer. A call whose timeout is shorter fails with
    /// `DeadlineExceeded`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<BackendRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    fn backend(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: BackendRequest) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(CallError::Closed);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if let Some(delay) = self.delay {
            if delay > request.timeout {
                tokio::time::sleep(request.timeout).await;
                return Err(CallError::DeadlineExceeded(request.timeout));
            }
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => (self.fallback)(&request),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::status::RpcStatus;

    fn request() -> BackendRequest {
        BackendRequest {
            method: "users.GetUser".into(),
            metadata: Default::default(),
            payload: Value::Null,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let backend = ScriptedBackend::new("users")
            .always(Ok(Value::from("fallback")))
            .then(Err(CallError::Status(RpcStatus::unavailable("down"))));

        assert!(backend.call(request()).await.is_err());
        assert_eq!(backend.call(request()).await, Ok(Value::from("fallback")));
        assert_eq!(backend.call_count(), 2);
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_past_timeout() {
        let backend = ScriptedBackend::new("users").with_delay(Duration::from_secs(5));
        assert_eq!(
            backend.call(request()).await,
            Err(CallError::DeadlineExceeded(Duration::from_secs(1)))
        );
    }

    #[tokio::test]
    async fn test_closed_backend_rejects() {
        let backend = ScriptedBackend::new("users");
        backend.close().await;
        assert_eq!(backend.call(request()).await, Err(CallError::Closed));
        assert_eq!(backend.call_count(), 0);
    }
}
