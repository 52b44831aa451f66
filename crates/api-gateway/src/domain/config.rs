//! Gateway configuration with validation.
//!
//! Every section carries defaults; the process environment overlays the
//! handful of settings operators change per deployment.

use crate::domain::routes::ROUTES;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP/JSON listener
    pub http: HttpConfig,
    /// Native binary RPC listener
    pub rpc: RpcListenerConfig,
    /// Downstream services, one entry per backend
    pub backends: Vec<BackendDescriptor>,
    /// Bearer token verification
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// Request validation limits
    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
    pub shutdown: ShutdownConfig,
    /// Interceptor order around every backend call
    pub pipeline: PipelineConfig,
    pub cors: CorsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            rpc: RpcListenerConfig::default(),
            backends: default_backends(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutConfig::default(),
            shutdown: ShutdownConfig::default(),
            pipeline: PipelineConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

fn default_backends() -> Vec<BackendDescriptor> {
    [
        ("users", 7001),
        ("servers", 7002),
        ("messages", 7003),
        ("friends", 7004),
    ]
    .into_iter()
    .map(|(name, port)| BackendDescriptor::new(name, format!("127.0.0.1:{port}")))
    .collect()
}

impl GatewayConfig {
    /// Defaults overlaid with the `GATEWAY_*` process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup onto the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("GATEWAY_HTTP_ADDR") {
            let addr = parse_socket_addr("GATEWAY_HTTP_ADDR", &addr)?;
            config.http.host = addr.ip();
            config.http.port = addr.port();
        }
        if let Some(addr) = lookup("GATEWAY_RPC_ADDR") {
            let addr = parse_socket_addr("GATEWAY_RPC_ADDR", &addr)?;
            config.rpc.host = addr.ip();
            config.rpc.port = addr.port();
        }
        if let Some(list) = lookup("GATEWAY_BACKENDS") {
            config.backends = parse_backend_list(&list)?;
        }
        if let Some(secret) = lookup("GATEWAY_JWT_SECRET") {
            config.auth.jwt_secret = Some(secret);
        }
        if let Some(capacity) = lookup("GATEWAY_RATE_LIMIT_CAPACITY") {
            config.rate_limit.capacity = parse_number("GATEWAY_RATE_LIMIT_CAPACITY", &capacity)?;
        }
        if let Some(refill) = lookup("GATEWAY_RATE_LIMIT_REFILL") {
            config.rate_limit.refill_per_second =
                parse_number("GATEWAY_RATE_LIMIT_REFILL", &refill)?;
        }
        if let Some(attempts) = lookup("GATEWAY_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_number("GATEWAY_RETRY_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(grace) = lookup("GATEWAY_SHUTDOWN_GRACE") {
            config.shutdown.grace_period = humantime_serde::parse_duration(&grace)
                .map_err(|e| ConfigError::InvalidEnv("GATEWAY_SHUTDOWN_GRACE".into(), e.into()))?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Port 0 asks the OS for an ephemeral port, so it never collides
        if self.rpc.enabled && self.http.port != 0 && self.http.port == self.rpc.port {
            return Err(ConfigError::DuplicatePorts);
        }

        if self.rate_limit.capacity == 0 {
            return Err(ConfigError::InvalidRateLimit("capacity cannot be 0".into()));
        }
        if self.rate_limit.refill_per_second == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "refill_per_second cannot be 0".into(),
            ));
        }

        self.circuit_breaker.validate()?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry("max_attempts cannot be 0".into()));
        }
        if self.retry.max_backoff < self.retry.base_backoff {
            return Err(ConfigError::InvalidRetry(
                "max_backoff must be >= base_backoff".into(),
            ));
        }

        if self.limits.max_request_size == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_request_size cannot be 0".into(),
            ));
        }

        if self.timeouts.request_deadline.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "request_deadline cannot be 0".into(),
            ));
        }

        self.validate_backends()?;

        match self.auth.jwt_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {}
            _ => return Err(ConfigError::MissingSigningKey),
        }

        self.pipeline.validate()
    }

    fn validate_backends(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ConfigError::Invalid("backend name cannot be empty".into()));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBackend(backend.name.clone()));
            }
            if !is_host_port(&backend.address) {
                return Err(ConfigError::InvalidBackendAddress {
                    name: backend.name.clone(),
                    address: backend.address.clone(),
                });
            }
            backend.dial.validate().map_err(|reason| ConfigError::InvalidDialOptions {
                name: backend.name.clone(),
                reason,
            })?;
        }

        for route in ROUTES.values() {
            if !names.contains(route.backend) {
                return Err(ConfigError::MissingBackend {
                    route: route.name,
                    backend: route.backend,
                });
            }
        }

        Ok(())
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http.host, self.http.port)
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.rpc.host, self.rpc.port)
    }
}

fn parse_socket_addr(key: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv(key.into(), format!("not a socket address: {value}")))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv(key.into(), format!("not a number: {value}")))
}

/// Parse `name=host:port,name=host:port`.
fn parse_backend_list(list: &str) -> Result<Vec<BackendDescriptor>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, address) = entry.split_once('=').ok_or_else(|| {
                ConfigError::InvalidEnv(
                    "GATEWAY_BACKENDS".into(),
                    format!("expected name=host:port, got {entry}"),
                )
            })?;
            Ok(BackendDescriptor::new(name.trim(), address.trim()))
        })
        .collect()
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0),
        None => false,
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: IpAddr,
    /// Port (default: 8080)
    pub port: u16,
    /// Keep-alive timeout
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8080,
            keep_alive: Duration::from_secs(75),
        }
    }
}

/// Native RPC listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcListenerConfig {
    pub host: IpAddr,
    /// Port (default: 9090)
    pub port: u16,
    pub enabled: bool,
}

impl Default for RpcListenerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 9090,
            enabled: true,
        }
    }
}

/// One downstream service. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    /// `host:port`
    pub address: String,
    #[serde(default)]
    pub dial: DialOptions,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            dial: DialOptions::default(),
        }
    }
}

/// Connection options for a backend link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Send a ping after this much outbound silence
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// Drop the link after this much inbound silence
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl DialOptions {
    fn validate(&self) -> Result<(), String> {
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be positive".into());
        }
        if self.keepalive_interval.is_zero() {
            return Err("keepalive_interval must be positive".into());
        }
        if self.idle_timeout <= self.keepalive_interval {
            return Err(format!(
                "idle_timeout ({:?}) must be longer than keepalive_interval ({:?})",
                self.idle_timeout, self.keepalive_interval
            ));
        }
        Ok(())
    }
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Bearer token verification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing key
    pub jwt_secret: Option<String>,
    /// Expected `iss` claim, if any
    pub issuer: Option<String>,
}

/// Where token buckets live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// One bucket shared by every route
    Global,
    /// One bucket per route
    PerRoute,
}

/// Admission rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub scope: RateLimitScope,
    /// Bucket size
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: RateLimitScope::Global,
            capacity: 200,
            refill_per_second: 100,
        }
    }
}

/// Per-backend circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Failure rate in [0, 1); the circuit opens once it is exceeded
    pub failure_rate_threshold: f64,
    /// Outcomes needed in the window before the rate is trusted
    pub minimum_samples: u32,
    /// Rolling window the rate is computed over
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// First open period
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Cap for the doubled open period after failed probes
    #[serde(with = "humantime_serde")]
    pub max_open_timeout: Duration,
    /// Concurrent probes admitted while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_rate_threshold: 0.5,
            minimum_samples: 10,
            window: Duration::from_secs(30),
            open_timeout: Duration::from_secs(5),
            max_open_timeout: Duration::from_secs(60),
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_rate_threshold >= 0.0 && self.failure_rate_threshold < 1.0) {
            return Err(ConfigError::InvalidCircuitBreaker(format!(
                "failure_rate_threshold must be in [0, 1), got {}",
                self.failure_rate_threshold
            )));
        }
        if self.minimum_samples == 0 {
            return Err(ConfigError::InvalidCircuitBreaker(
                "minimum_samples cannot be 0".into(),
            ));
        }
        if self.half_open_max_probes == 0 {
            return Err(ConfigError::InvalidCircuitBreaker(
                "half_open_max_probes cannot be 0".into(),
            ));
        }
        if self.window.is_zero() || self.open_timeout.is_zero() {
            return Err(ConfigError::InvalidCircuitBreaker(
                "window and open_timeout must be positive".into(),
            ));
        }
        if self.max_open_timeout < self.open_timeout {
            return Err(ConfigError::InvalidCircuitBreaker(
                "max_open_timeout must be >= open_timeout".into(),
            ));
        }
        Ok(())
    }
}

/// Retry loop around each logical call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Upper bound on attempts, first one included
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Max HTTP request body size in bytes (default: 1MB)
    pub max_request_size: usize,
    /// Max binary RPC frame size in bytes (default: 4MB)
    pub max_frame_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size: 1024 * 1024,
            max_frame_size: 4 * 1024 * 1024,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Overall budget for one inbound request, retries included
    #[serde(with = "humantime_serde")]
    pub request_deadline: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(30),
        }
    }
}

/// Graceful shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight requests may drain before being cancelled
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
        }
    }
}

/// A stage of the interceptor chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Auth,
    RateLimit,
    Retry,
    CircuitBreaker,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Auth => "auth",
            Stage::RateLimit => "rate_limit",
            Stage::Retry => "retry",
            Stage::CircuitBreaker => "circuit_breaker",
        };
        f.write_str(name)
    }
}

/// Interceptor order, outermost first. The backend call is always last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub order: Vec<Stage>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            order: vec![
                Stage::Auth,
                Stage::RateLimit,
                Stage::Retry,
                Stage::CircuitBreaker,
            ],
        }
    }
}

impl PipelineConfig {
    /// Every stage exactly once, auth ahead of both admission gates, and
    /// the circuit breaker inside the retry loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let position = |stage: Stage| -> Result<usize, ConfigError> {
            let mut hits = self.order.iter().enumerate().filter(|(_, s)| **s == stage);
            match (hits.next(), hits.next()) {
                (Some((idx, _)), None) => Ok(idx),
                (None, _) => Err(ConfigError::InvalidPipeline(format!("missing stage {stage}"))),
                (Some(_), Some(_)) => Err(ConfigError::InvalidPipeline(format!(
                    "stage {stage} listed more than once"
                ))),
            }
        };

        let auth = position(Stage::Auth)?;
        let rate_limit = position(Stage::RateLimit)?;
        let retry = position(Stage::Retry)?;
        let breaker = position(Stage::CircuitBreaker)?;

        if auth > rate_limit || auth > breaker {
            return Err(ConfigError::InvalidPipeline(
                "auth must run before rate_limit and circuit_breaker".into(),
            ));
        }
        if retry > breaker {
            return Err(ConfigError::InvalidPipeline(
                "circuit_breaker must run inside retry".into(),
            ));
        }
        Ok(())
    }
}

/// CORS configuration for browser clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Allowed origins ("*" for all)
    pub allowed_origins: Vec<String>,
    /// Max age for preflight cache, in seconds
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            max_age: 86400,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate ports configured")]
    DuplicatePorts,
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    #[error("invalid circuit breaker: {0}")]
    InvalidCircuitBreaker(String),
    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("no backends configured")]
    NoBackends,
    #[error("backend {0} configured twice")]
    DuplicateBackend(String),
    #[error("backend {name} has invalid address {address:?}, expected host:port")]
    InvalidBackendAddress { name: String, address: String },
    #[error("backend {name} has invalid dial options: {reason}")]
    InvalidDialOptions { name: String, reason: String },
    #[error("route {route} targets unconfigured backend {backend}")]
    MissingBackend {
        route: &'static str,
        backend: &'static str,
    },
    #[error("no token signing key configured")]
    MissingSigningKey,
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(String, String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else {
            // Plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
