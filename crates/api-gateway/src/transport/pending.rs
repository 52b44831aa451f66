//! In-flight calls on one multiplexed link.
//!
//! Flow:
//! 1. The caller `register()`s and gets an id plus a oneshot receiver
//! 2. The request frame goes out carrying that id
//! 3. The link reader `complete()`s the id when the response arrives
//! 4. If the caller gives up first, dropping its [`PendingGuard`] removes the entry

use crate::domain::value::Value;
use crate::ports::outbound::CallError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

pub type CallResult = Result<Value, CallError>;

struct PendingCall {
    sender: oneshot::Sender<CallResult>,
    created_at: Instant,
    method: String,
}

/// Counters for one link
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    /// Caller went away before the response
    pub total_cancelled: AtomicU64,
    /// Failed because the link died
    pub total_failed: AtomicU64,
}

/// Map from request id to the waiting caller.
pub struct PendingCalls {
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
    stats: Arc<PendingStats>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            stats: Arc::new(PendingStats::default()),
        }
    }

    /// Register a call and get the receiver its outcome will arrive on.
    pub fn register(&self, method: &str) -> (u64, oneshot::Receiver<CallResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            id,
            PendingCall {
                sender: tx,
                created_at: Instant::now(),
                method: method.to_string(),
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        (id, rx)
    }

    /// Deliver an outcome. False if the id is unknown or the caller is gone.
    pub fn complete(&self, id: u64, result: CallResult) -> bool {
        let Some((_, call)) = self.pending.remove(&id) else {
            debug!(id, "Response for unknown or abandoned call");
            return false;
        };

        let elapsed = call.created_at.elapsed();
        if call.sender.send(result).is_ok() {
            self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
            debug!(
                id,
                method = call.method,
                elapsed_ms = elapsed.as_millis() as u64,
                "Completed call"
            );
            true
        } else {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Forget a call whose caller stopped waiting.
    pub fn cancel(&self, id: u64) -> bool {
        if self.pending.remove(&id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Fail every waiting call, e.g. when the link drops.
    pub fn fail_all(&self, error: CallError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.sender.send(Err(error.clone()));
                failed += 1;
            }
        }
        self.stats
            .total_failed
            .fetch_add(failed as u64, Ordering::Relaxed);
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

/// Removes the entry when the caller stops waiting for any reason.
pub struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    pub fn new(calls: &'a PendingCalls, id: u64) -> Self {
        Self { calls, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // No-op when the response already arrived
        self.calls.cancel(self.id);
    }
}
