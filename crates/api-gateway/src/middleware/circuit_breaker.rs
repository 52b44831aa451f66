//! Per-backend circuit breaker.
//!
//! Stops calls to a failing backend so its failures do not tie up the
//! gateway or spill over into other backends.
//!
//! # Circuit Breaker States
//!
//! ```text
//!                    probe success
//!            ┌─────────────────────────────────────────┐
//!            ▼                                         │
//!      ┌──────────┐  rate >= T   ┌──────────┐  timeout ┌──────────┐
//!      │  CLOSED  │ ───────────► │   OPEN   │ ───────► │HALF-OPEN │
//!      │ (normal) │  (n >= min)  │ (reject) │          │ (K probes)│
//!      └──────────┘              └──────────┘ ◄─────── └──────────┘
//!                                      probe failure, timeout doubled
//! ```
//!
//! Every backend has exactly one circuit, and every transition happens under
//! the manager's write lock. Outcomes are reported through a
//! [`CircuitPermit`]; an outcome from a permit issued in an earlier state
//! (a straggler from before the circuit opened, say) is counted in the stats
//! but cannot move the state machine.

use crate::domain::config::{CircuitBreakerConfig, Stage};
use crate::domain::error::GatewayError;
use crate::domain::invocation::Invocation;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::pipeline::{CallOutcome, Interceptor, Next};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit is open - requests are rejected immediately
    Open,
    /// Testing if the backend recovered - admits a bounded number of probes
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Per-backend circuit state
struct BackendCircuit {
    state: CircuitState,
    /// Bumped on every transition; permits from older generations are stale
    generation: u64,
    /// Outcomes in the current sampling window
    failure_count: u32,
    success_count: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    /// Current open period; doubles after each failed probe
    open_timeout: Duration,
    probes_in_flight: u32,
    last_transition: Instant,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BackendCircuit {
    fn new(config: &CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failure_count: 0,
            success_count: 0,
            window_start: now,
            opened_at: None,
            open_timeout: config.open_timeout,
            probes_in_flight: 0,
            last_transition: now,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn transition(&mut self, state: CircuitState, now: Instant) {
        self.state = state;
        self.generation += 1;
        self.last_transition = now;
        self.probes_in_flight = 0;
    }

    fn reset_window(&mut self, now: Instant) {
        self.failure_count = 0;
        self.success_count = 0;
        self.window_start = now;
    }

    fn open_remaining(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|at| (at + self.open_timeout).saturating_duration_since(now))
            .unwrap_or_default()
    }
}

/// Circuit breakers for all backends
pub struct CircuitBreakerManager {
    circuits: RwLock<HashMap<String, BackendCircuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to send one call to `backend`.
    ///
    /// On rejection returns how long the circuit stays open.
    pub fn try_acquire(&self, backend: &str) -> Result<CircuitPermit<'_>, Duration> {
        let now = Instant::now();
        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(backend.to_string())
            .or_insert_with(|| BackendCircuit::new(&self.config, now));

        if circuit.state == CircuitState::Open {
            let remaining = circuit.open_remaining(now);
            if remaining.is_zero() {
                info!(backend, "Circuit breaker transitioning to half-open");
                circuit.transition(CircuitState::HalfOpen, now);
            } else {
                circuit.total_rejections += 1;
                debug!(
                    backend,
                    remaining_ms = remaining.as_millis() as u64,
                    "Circuit breaker is open, rejecting call"
                );
                return Err(remaining);
            }
        }

        let probe = circuit.state == CircuitState::HalfOpen;
        if probe {
            if circuit.probes_in_flight >= self.config.half_open_max_probes {
                circuit.total_rejections += 1;
                debug!(backend, "Half-open probe slots taken, rejecting call");
                return Err(Duration::ZERO);
            }
            circuit.probes_in_flight += 1;
        }

        circuit.total_requests += 1;
        Ok(CircuitPermit {
            manager: self,
            backend: backend.to_string(),
            generation: circuit.generation,
            probe,
            done: false,
        })
    }

    fn record(&self, permit: &CircuitPermit<'_>, success: bool) {
        let now = Instant::now();
        let mut circuits = self.circuits.write();
        let Some(circuit) = circuits.get_mut(&permit.backend) else {
            return;
        };

        if success {
            circuit.total_successes += 1;
        } else {
            circuit.total_failures += 1;
        }
        if circuit.generation != permit.generation {
            return;
        }

        let backend = permit.backend.as_str();
        match circuit.state {
            CircuitState::Closed => {
                if now >= circuit.window_start + self.config.window {
                    circuit.reset_window(now);
                }
                if success {
                    circuit.success_count += 1;
                    return;
                }
                circuit.failure_count += 1;

                let samples = circuit.failure_count + circuit.success_count;
                let rate = f64::from(circuit.failure_count) / f64::from(samples);
                if samples >= self.config.minimum_samples
                    && rate > self.config.failure_rate_threshold
                {
                    warn!(
                        backend,
                        failures = circuit.failure_count,
                        samples,
                        open_timeout_ms = circuit.open_timeout.as_millis() as u64,
                        "Circuit breaker opening due to failure rate"
                    );
                    circuit.transition(CircuitState::Open, now);
                    circuit.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
                if success {
                    info!(backend, "Circuit breaker closing after successful probe");
                    circuit.transition(CircuitState::Closed, now);
                    circuit.opened_at = None;
                    circuit.open_timeout = self.config.open_timeout;
                    circuit.reset_window(now);
                } else {
                    circuit.open_timeout = circuit
                        .open_timeout
                        .saturating_mul(2)
                        .min(self.config.max_open_timeout);
                    warn!(
                        backend,
                        open_timeout_ms = circuit.open_timeout.as_millis() as u64,
                        "Circuit breaker reopening after probe failure"
                    );
                    circuit.transition(CircuitState::Open, now);
                    circuit.opened_at = Some(now);
                }
            }
            // Permits are never issued while open
            CircuitState::Open => {}
        }
    }

    fn release(&self, permit: &CircuitPermit<'_>) {
        if !permit.probe {
            return;
        }
        let mut circuits = self.circuits.write();
        if let Some(circuit) = circuits.get_mut(&permit.backend) {
            if circuit.generation == permit.generation {
                circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
            }
        }
    }

    /// Get the current state of a backend's circuit
    pub fn get_state(&self, backend: &str) -> CircuitState {
        let circuits = self.circuits.read();
        circuits
            .get(backend)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn get_stats(&self, backend: &str) -> Option<CircuitStats> {
        let now = Instant::now();
        let circuits = self.circuits.read();
        circuits
            .get(backend)
            .map(|circuit| CircuitStats::of(backend, circuit, now))
    }

    /// Statistics for every backend seen so far, sorted by name
    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let now = Instant::now();
        let circuits = self.circuits.read();
        let mut stats: Vec<_> = circuits
            .iter()
            .map(|(backend, circuit)| CircuitStats::of(backend, circuit, now))
            .collect();
        stats.sort_by(|a, b| a.backend.cmp(&b.backend));
        stats
    }
}

/// Admission to one backend call. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure); dropping the
/// permit records nothing and frees its probe slot.
pub struct CircuitPermit<'a> {
    manager: &'a CircuitBreakerManager,
    backend: String,
    generation: u64,
    probe: bool,
    done: bool,
}

impl CircuitPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.done = true;
        self.manager.record(&self, true);
    }

    pub fn failure(mut self) {
        self.done = true;
        self.manager.record(&self, false);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.manager.release(self);
        }
    }
}

/// Statistics for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub backend: String,
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub window_failures: u32,
    pub window_successes: u32,
    pub open_timeout: Duration,
    pub time_in_state_ms: u64,
}

impl CircuitStats {
    fn of(backend: &str, circuit: &BackendCircuit, now: Instant) -> Self {
        Self {
            backend: backend.to_string(),
            state: circuit.state,
            total_requests: circuit.total_requests,
            total_successes: circuit.total_successes,
            total_failures: circuit.total_failures,
            total_rejections: circuit.total_rejections,
            window_failures: circuit.failure_count,
            window_successes: circuit.success_count,
            open_timeout: circuit.open_timeout,
            time_in_state_ms: now.saturating_duration_since(circuit.last_transition).as_millis()
                as u64,
        }
    }
}

impl serde::Serialize for CircuitStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("CircuitStats", 10)?;
        state.serialize_field("backend", &self.backend)?;
        state.serialize_field("state", &self.state.to_string())?;
        state.serialize_field("total_requests", &self.total_requests)?;
        state.serialize_field("total_successes", &self.total_successes)?;
        state.serialize_field("total_failures", &self.total_failures)?;
        state.serialize_field("total_rejections", &self.total_rejections)?;
        state.serialize_field("window_failures", &self.window_failures)?;
        state.serialize_field("window_successes", &self.window_successes)?;
        state.serialize_field("open_timeout_ms", &(self.open_timeout.as_millis() as u64))?;
        state.serialize_field("time_in_state_ms", &self.time_in_state_ms)?;
        state.end()
    }
}

/// Interceptor guarding each attempt with the target backend's circuit.
pub struct CircuitBreakerStage {
    manager: Arc<CircuitBreakerManager>,
    metrics: Arc<GatewayMetrics>,
}

impl CircuitBreakerStage {
    pub fn new(manager: Arc<CircuitBreakerManager>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { manager, metrics }
    }
}

#[async_trait]
impl Interceptor for CircuitBreakerStage {
    fn stage(&self) -> Stage {
        Stage::CircuitBreaker
    }

    async fn intercept(&self, call: Invocation, next: Next<'_>) -> CallOutcome {
        if !self.manager.config().enabled {
            return next.run(call).await;
        }

        let backend = call.backend();
        let permit = match self.manager.try_acquire(backend) {
            Ok(permit) => permit,
            Err(remaining) => {
                self.metrics.record_circuit_rejection();
                warn!(
                    backend,
                    route = call.route.name,
                    retry_in_ms = remaining.as_millis() as u64,
                    "Circuit open, call rejected"
                );
                return Err(GatewayError::CircuitOpen {
                    backend: backend.to_string(),
                });
            }
        };

        let outcome = next.run(call).await;
        match &outcome {
            Err(e) if e.is_backend_failure() => permit.failure(),
            // Application errors are healthy replies
            Ok(_) | Err(GatewayError::Backend(_)) => permit.success(),
            // Cancelled or never reached the backend: no verdict
            _ => drop(permit),
        }
        outcome
    }
}
