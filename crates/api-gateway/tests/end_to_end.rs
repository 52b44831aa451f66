//! Gateway against real binary RPC backends over loopback.
//!
//! Four in-process backend servers stand in for the platform services. The
//! gateway dials them at startup exactly as it would in production, and is
//! driven through both its HTTP and native RPC listeners.

use api_gateway::domain::config::BackendDescriptor;
use api_gateway::domain::invocation::Metadata;
use api_gateway::domain::status::{RpcCode, RpcStatus};
use api_gateway::middleware::AuthGate;
use api_gateway::transport::{RpcClient, RpcHandler, RpcRequest, RpcServer, MAX_FRAME_SIZE};
use api_gateway::{
    BackendClient, BackendRequest, CallError, GatewayConfig, LifecycleManager, ShutdownReport,
    Value,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "end-to-end-secret";

/// Answers every method with its payload plus a fresh `id`, and keeps the
/// requests it saw.
struct FakeService {
    seen: Mutex<Vec<RpcRequest>>,
}

#[async_trait]
impl RpcHandler for FakeService {
    async fn handle(&self, request: RpcRequest) -> Result<Value, RpcStatus> {
        self.seen.lock().push(request.clone());
        if request.method.ends_with("RemoveFriend") {
            return Err(RpcStatus::not_found("not friends"));
        }
        let mut reply = request.payload;
        reply.insert("id", Value::from("generated-1"));
        reply.insert("password_hash", Value::from("never-leaves"));
        Ok(reply)
    }
}

struct Backend {
    name: &'static str,
    addr: SocketAddr,
    service: Arc<FakeService>,
    abort: CancellationToken,
}

impl Backend {
    async fn start(name: &'static str) -> Self {
        let service = Arc::new(FakeService {
            seen: Mutex::new(Vec::new()),
        });
        let server = RpcServer::bind("127.0.0.1:0", service.clone(), MAX_FRAME_SIZE)
            .await
            .unwrap();
        let addr = server.local_addr();
        let abort = server.abort_token();
        tokio::spawn(server.serve());
        Self {
            name,
            addr,
            service,
            abort,
        }
    }

    fn requests(&self) -> Vec<RpcRequest> {
        self.service.seen.lock().clone()
    }
}

struct Fixture {
    gateway: LifecycleManager,
    backends: Vec<Backend>,
    http: reqwest::Client,
}

impl Fixture {
    async fn start() -> Self {
        let mut backends = Vec::new();
        for name in ["users", "servers", "messages", "friends"] {
            backends.push(Backend::start(name).await);
        }

        let mut config = GatewayConfig::default();
        config.http.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.http.port = 0;
        config.rpc.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.rpc.port = 0;
        config.auth.jwt_secret = Some(SECRET.into());
        config.retry.base_backoff = Duration::from_millis(5);
        config.retry.max_backoff = Duration::from_millis(20);
        config.shutdown.grace_period = Duration::from_millis(500);
        config.backends = backends
            .iter()
            .map(|b| BackendDescriptor::new(b.name, b.addr.to_string()))
            .collect();

        let gateway = LifecycleManager::start(config).await.unwrap();
        Self {
            gateway,
            backends,
            http: reqwest::Client::new(),
        }
    }

    fn backend(&self, name: &str) -> &Backend {
        self.backends.iter().find(|b| b.name == name).unwrap()
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.gateway.http_addr(), path)
    }
}

fn token(subject: &str) -> String {
    AuthGate::from_secret(SECRET.as_bytes(), None)
        .issue(subject, Duration::from_secs(300))
        .unwrap()
}

/// A JSON request is transcoded onto the backend method with path, body and
/// identity fields in place, and the reply comes back reshaped.
#[tokio::test]
async fn test_http_request_reaches_backend() {
    // Arrange
    let fixture = Fixture::start().await;

    // Act
    let response = fixture
        .http
        .post(fixture.url("/v1/channels/general/messages"))
        .bearer_auth(token("u-7"))
        .header("x-request-id", "0190b2a4-6c1e-7cc3-8a2b-3f4d5e6f7a8b")
        .json(&serde_json::json!({"content": "hello", "pinned": true}))
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(response.status(), 201);
    assert_eq!(
        response.headers()["x-request-id"],
        "0190b2a4-6c1e-7cc3-8a2b-3f4d5e6f7a8b"
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message_id"], "generated-1");
    assert_eq!(body["author_id"], "u-7");

    let requests = fixture.backend("messages").requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "messages.CreateMessage");
    assert_eq!(request.payload.get("channel_id"), Some(&Value::from("general")));
    assert_eq!(request.payload.get("content"), Some(&Value::from("hello")));
    // Undeclared fields are dropped
    assert_eq!(request.payload.get("pinned"), None);
    assert!(request.timeout_ms > 0);
    assert_eq!(
        request.metadata.get("x-request-id").map(String::as_str),
        Some("0190b2a4-6c1e-7cc3-8a2b-3f4d5e6f7a8b")
    );

    fixture.gateway.shutdown().await;
}

/// Application errors from a backend pass through with their own status.
#[tokio::test]
async fn test_backend_application_error_passes_through() {
    // Arrange
    let fixture = Fixture::start().await;

    // Act
    let response = fixture
        .http
        .delete(fixture.url("/v1/friends/u-9"))
        .bearer_auth(token("u-7"))
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(fixture.backend("friends").requests().len(), 1);

    fixture.gateway.shutdown().await;
}

/// Native callers name the route and get the same admission and reshaping
/// as HTTP callers.
#[tokio::test]
async fn test_native_rpc_surface() {
    // Arrange
    let fixture = Fixture::start().await;
    let rpc_addr = fixture.gateway.rpc_addr().unwrap();
    let client = RpcClient::connect(
        BackendDescriptor::new("gateway", rpc_addr.to_string()),
        MAX_FRAME_SIZE,
    )
    .await
    .unwrap();
    let mut metadata = Metadata::new();
    metadata.insert("authorization".into(), format!("Bearer {}", token("u-3")));

    // Act
    let me = client
        .call(BackendRequest {
            method: "users.GetMe".into(),
            metadata: metadata.clone(),
            payload: Value::Null,
            timeout: Duration::from_secs(5),
        })
        .await;
    let anonymous = client
        .call(BackendRequest {
            method: "users.GetMe".into(),
            metadata: Metadata::new(),
            payload: Value::Null,
            timeout: Duration::from_secs(5),
        })
        .await;
    let unknown = client
        .call(BackendRequest {
            method: "users.DropTables".into(),
            metadata,
            payload: Value::Null,
            timeout: Duration::from_secs(5),
        })
        .await;

    // Assert
    let me = me.unwrap();
    assert_eq!(me.get("user_id"), Some(&Value::from("generated-1")));
    assert_eq!(me.get("password_hash"), None);
    match anonymous {
        Err(CallError::Status(status)) => assert_eq!(status.code, RpcCode::Unauthenticated),
        other => panic!("expected unauthenticated, got {other:?}"),
    }
    match unknown {
        Err(CallError::Status(status)) => assert_eq!(status.code, RpcCode::Unimplemented),
        other => panic!("expected unimplemented, got {other:?}"),
    }
    assert_eq!(fixture.backend("users").requests().len(), 1);

    client.close().await;
    fixture.gateway.shutdown().await;
}

/// A backend that goes away turns into 503 after retries; the other
/// backends keep serving.
#[tokio::test]
async fn test_lost_backend_is_isolated() {
    // Arrange
    let fixture = Fixture::start().await;
    fixture.backend("users").abort.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Act
    let users = fixture
        .http
        .get(fixture.url("/v1/me"))
        .bearer_auth(token("u-1"))
        .send()
        .await
        .unwrap();
    let servers = fixture
        .http
        .get(fixture.url("/v1/servers?limit=10"))
        .bearer_auth(token("u-1"))
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(users.status(), 503);
    let body: serde_json::Value = users.json().await.unwrap();
    assert_eq!(body["error"]["code"], "retry_exhausted");
    assert_eq!(servers.status(), 200);
    let listed = &fixture.backend("servers").requests()[0];
    assert_eq!(listed.payload.get("limit"), Some(&Value::Int(10)));
    assert_eq!(listed.payload.get("member_id"), Some(&Value::from("u-1")));

    fixture.gateway.shutdown().await;
}

/// Shutdown with nothing in flight drains at once and refuses later calls.
#[tokio::test]
async fn test_shutdown_stops_http_listener() {
    // Arrange
    let fixture = Fixture::start().await;
    let url = fixture.url("/v1/me");

    // Act
    let report = fixture.gateway.shutdown().await;

    // Assert
    assert_eq!(
        report,
        ShutdownReport {
            drained: true,
            cancelled: 0
        }
    );
    assert!(fixture
        .http
        .get(&url)
        .bearer_auth(token("u-1"))
        .send()
        .await
        .is_err());
}
