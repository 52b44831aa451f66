//! Inbound surfaces: the HTTP/JSON router and the native RPC handler.
//!
//! Both expose the same route table and hand every call to the same
//! [`Dispatcher`]. HTTP requests are decoded through each route's field
//! mapping; native callers send canonical payloads keyed by route name.

use crate::adapters::error_conversions::error_response;
use crate::dispatch::{decode_http, validate_canonical, Dispatcher, HttpInput, InboundCall};
use crate::domain::config::GatewayConfig;
use crate::domain::correlation::{CorrelationId, TraceContext, REQUEST_ID_KEY, TRACEPARENT_KEY};
use crate::domain::error::GatewayError;
use crate::domain::invocation::{AUTHORIZATION_KEY, IDEMPOTENCY_KEY};
use crate::domain::routes::{get_route, HttpVerb, RouteSpec, ROUTES};
use crate::domain::status::RpcStatus;
use crate::domain::value::Value;
use crate::middleware::{create_cors_layer, RequestContext, TracingLayer, ValidationLayer};
use crate::transport::frame::RpcRequest;
use crate::transport::server::RpcHandler;
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, on, MethodFilter, MethodRouter},
    Extension, Json, Router,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

/// Build the HTTP router: every route in the table, `GET /metrics`, and
/// the edge layers.
pub fn http_router(dispatcher: Arc<Dispatcher>, config: &GatewayConfig) -> Router {
    let mut by_path: BTreeMap<&'static str, MethodRouter<AppState>> = BTreeMap::new();
    let mut routes: Vec<&'static RouteSpec> = ROUTES.values().collect();
    routes.sort_by_key(|r| r.name);

    for route in routes {
        let handler = move |State(state): State<AppState>,
                            path: Option<Path<HashMap<String, String>>>,
                            Query(query): Query<HashMap<String, String>>,
                            context: Option<Extension<RequestContext>>,
                            headers: HeaderMap,
                            body: Bytes| async move {
            let path = path.map(|Path(p)| p).unwrap_or_default();
            let context = context.map(|Extension(c)| c);
            handle_route(state, route, path, query, context, headers, body).await
        };
        let endpoint = on(method_filter(route.verb), handler);
        let merged = match by_path.remove(route.path) {
            Some(existing) => existing.merge(endpoint),
            None => endpoint,
        };
        by_path.insert(route.path, merged);
    }

    let mut router = Router::new().route("/metrics", get(metrics_json));
    #[cfg(feature = "metrics")]
    {
        router = router.route("/metrics/prometheus", get(metrics_prometheus));
    }
    for (path, endpoint) in by_path {
        router = router.route(path, endpoint);
    }

    let mut router = router
        .fallback(not_found)
        .with_state(AppState { dispatcher })
        .layer(ValidationLayer::new(config.limits.clone()))
        .layer(TracingLayer::new());
    if let Some(cors) = create_cors_layer(&config.cors) {
        router = router.layer(cors);
    }
    router
}

fn method_filter(verb: HttpVerb) -> MethodFilter {
    match verb {
        HttpVerb::Get => MethodFilter::GET,
        HttpVerb::Post => MethodFilter::POST,
        HttpVerb::Delete => MethodFilter::DELETE,
    }
}

async fn handle_route(
    state: AppState,
    route: &'static RouteSpec,
    path: HashMap<String, String>,
    query: HashMap<String, String>,
    context: Option<RequestContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let input = HttpInput {
        path: &path,
        query: &query,
        body: &body,
    };
    let payload = match decode_http(route, &input) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(route = route.name, error = %e, "Request validation failed");
            return error_response(&e.into());
        }
    };

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let context = context.unwrap_or_else(|| RequestContext {
        correlation_id: CorrelationId::from_header(header(REQUEST_ID_KEY)),
        trace: TraceContext::from_header(header(TRACEPARENT_KEY)),
    });
    let inbound = InboundCall::new(route, payload)
        .with_credential(header(AUTHORIZATION_KEY).map(str::to_string))
        .with_idempotency_key(header(IDEMPOTENCY_KEY).map(str::to_string))
        .with_context(context.correlation_id, context.trace);

    match state.dispatcher.dispatch(inbound).await {
        Ok(value) => render(route, value),
        Err(e) => error_response(&e),
    }
}

fn render(route: &RouteSpec, value: Value) -> Response {
    let status = StatusCode::from_u16(route.success_status).unwrap_or(StatusCode::OK);
    if status == StatusCode::NO_CONTENT {
        return status.into_response();
    }
    (status, Json(serde_json::Value::from(value))).into_response()
}

async fn not_found(uri: Uri) -> Response {
    error_response(&GatewayError::NotFound(uri.path().to_string()))
}

async fn metrics_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = state.dispatcher.metrics().to_json();
    if let Some(sections) = body.as_object_mut() {
        let circuits = serde_json::to_value(state.dispatcher.circuit_stats()).unwrap_or_default();
        sections.insert("circuits".into(), circuits);
    }
    Json(body)
}

#[cfg(feature = "metrics")]
async fn metrics_prometheus(State(state): State<AppState>) -> Response {
    match state.dispatcher.metrics().to_prometheus() {
        Ok(text) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(&GatewayError::Internal(e.to_string())),
    }
}

/// Native RPC surface: the method is the route name.
pub struct NativeRpcHandler {
    dispatcher: Arc<Dispatcher>,
}

impl NativeRpcHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl RpcHandler for NativeRpcHandler {
    async fn handle(&self, request: RpcRequest) -> Result<Value, RpcStatus> {
        let route = get_route(&request.method)
            .ok_or_else(|| GatewayError::NotFound(request.method.clone()).rpc_status())?;
        let payload = validate_canonical(route, request.payload).map_err(|e| {
            warn!(route = route.name, error = %e, "Request validation failed");
            GatewayError::from(e).rpc_status()
        })?;

        let meta = |key: &str| request.metadata.get(key).cloned();
        let inbound = InboundCall::new(route, payload)
            .with_credential(meta(AUTHORIZATION_KEY))
            .with_idempotency_key(meta(IDEMPOTENCY_KEY))
            .with_context(
                CorrelationId::from_header(meta(REQUEST_ID_KEY).as_deref()),
                TraceContext::from_header(meta(TRACEPARENT_KEY).as_deref()),
            );

        self.dispatcher
            .dispatch(inbound)
            .await
            .map_err(|e| e.rpc_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::registry::ConnectionRegistry;
    use crate::adapters::scripted::ScriptedBackend;
    use crate::domain::config::BackendDescriptor;
    use crate::domain::invocation::Metadata;
    use crate::domain::status::RpcCode;
    use crate::middleware::{AuthGate, GatewayMetrics};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "service-secret";

    struct Harness {
        router: Router,
        dispatcher: Arc<Dispatcher>,
        users: Arc<ScriptedBackend>,
        messages: Arc<ScriptedBackend>,
        friends: Arc<ScriptedBackend>,
    }

    fn harness() -> Harness {
        let mut config = GatewayConfig::default();
        config.auth.jwt_secret = Some(SECRET.into());
        config.backends = ["users", "servers", "messages", "friends"]
            .into_iter()
            .map(|name| BackendDescriptor::new(name, "127.0.0.1:1"))
            .collect();

        let users = Arc::new(ScriptedBackend::new("users").always(Ok(Value::from(
            serde_json::json!({"id": "u-1", "username": "ada", "password_hash": "h"}),
        ))));
        let messages = Arc::new(ScriptedBackend::new("messages").responding(|req| {
            let mut message = req.payload.clone();
            message.insert("id", Value::from("m-1"));
            Ok(message)
        }));
        let friends = Arc::new(ScriptedBackend::new("friends"));
        let registry = ConnectionRegistry::new()
            .with_client(users.clone())
            .with_client(Arc::new(ScriptedBackend::new("servers")))
            .with_client(messages.clone())
            .with_client(friends.clone());

        let dispatcher = Arc::new(
            Dispatcher::build(&config, Arc::new(registry), Arc::new(GatewayMetrics::new()))
                .unwrap(),
        );
        Harness {
            router: http_router(Arc::clone(&dispatcher), &config),
            dispatcher,
            users,
            messages,
            friends,
        }
    }

    fn bearer() -> String {
        let token = AuthGate::from_secret(SECRET.as_bytes(), None)
            .issue("u-1", Duration::from_secs(300))
            .unwrap();
        format!("Bearer {token}")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_me() {
        let h = harness();
        let req = Request::get("/v1/me")
            .header("authorization", bearer())
            .header("x-request-id", "0190b2a4-6c1e-7cc3-8a2b-3f4d5e6f7a8b")
            .body(Body::empty())
            .unwrap();

        let response = h.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["x-request-id"],
            "0190b2a4-6c1e-7cc3-8a2b-3f4d5e6f7a8b"
        );
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"user_id": "u-1", "username": "ada"})
        );

        let sent = h.users.last_request().unwrap();
        assert_eq!(
            sent.metadata.get(REQUEST_ID_KEY).map(String::as_str),
            Some("0190b2a4-6c1e-7cc3-8a2b-3f4d5e6f7a8b")
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let h = harness();
        let req = Request::get("/v1/me").body(Body::empty()).unwrap();

        let response = h.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "unauthenticated");
        assert_eq!(h.users.call_count(), 0);
    }

    #[tokio::test]
    async fn test_create_message_binds_author() {
        let h = harness();
        let req = Request::post("/v1/channels/c-9/messages")
            .header("authorization", bearer())
            .header("content-type", "application/json")
            .body(Body::from(r#"{"content":"hello","author_id":"mallory"}"#))
            .unwrap();

        let response = h.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({
                "message_id": "m-1",
                "channel_id": "c-9",
                "content": "hello",
                "author_id": "u-1"
            })
        );
        assert_eq!(h.messages.call_count(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_is_400() {
        let h = harness();
        let req = Request::post("/v1/channels/c-9/messages")
            .header("authorization", bearer())
            .body(Body::from(r#"{"content":""}"#))
            .unwrap();

        let response = h.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "invalid_argument");
        assert_eq!(body["error"]["data"]["field"], "content");
        assert_eq!(h.messages.call_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_answers_204() {
        let h = harness();
        let req = Request::delete("/v1/friends/u-2")
            .header("authorization", bearer())
            .body(Body::empty())
            .unwrap();

        let response = h.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let sent = h.friends.last_request().unwrap();
        assert_eq!(sent.payload.get("friend_id").and_then(Value::as_str), Some("u-2"));
        assert_eq!(sent.payload.get("user_id").and_then(Value::as_str), Some("u-1"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let h = harness();
        let req = Request::get("/v2/nothing").body(Body::empty()).unwrap();
        let response = h.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let h = harness();
        let req = Request::get("/v1/me")
            .header("authorization", bearer())
            .body(Body::empty())
            .unwrap();
        h.router.clone().oneshot(req).await.unwrap();

        let req = Request::get("/metrics").body(Body::empty()).unwrap();
        let body = json_body(h.router.oneshot(req).await.unwrap()).await;
        assert_eq!(body["requests"]["total"], 1);
        assert_eq!(body["circuits"][0]["backend"], "users");
    }

    fn rpc_request(method: &str, payload: serde_json::Value, metadata: Metadata) -> RpcRequest {
        RpcRequest {
            id: 1,
            method: method.to_string(),
            metadata,
            payload: Value::from(payload),
            timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_native_call() {
        let h = harness();
        let handler = NativeRpcHandler::new(Arc::clone(&h.dispatcher));

        let mut metadata = Metadata::new();
        metadata.insert(AUTHORIZATION_KEY.into(), bearer());
        let value = handler
            .handle(rpc_request(
                "messages.CreateMessage",
                serde_json::json!({"channel_id": "c-1", "content": "hi"}),
                metadata,
            ))
            .await
            .unwrap();

        assert_eq!(value.get("author_id").and_then(Value::as_str), Some("u-1"));
        assert_eq!(value.get("message_id").and_then(Value::as_str), Some("m-1"));
    }

    #[tokio::test]
    async fn test_native_errors_map_to_status() {
        let h = harness();
        let handler = NativeRpcHandler::new(Arc::clone(&h.dispatcher));

        let unknown = handler
            .handle(rpc_request("users.Nope", serde_json::json!({}), Metadata::new()))
            .await
            .unwrap_err();
        assert_eq!(unknown.code, RpcCode::Unimplemented);

        let anonymous = handler
            .handle(rpc_request("users.GetMe", serde_json::json!({}), Metadata::new()))
            .await
            .unwrap_err();
        assert_eq!(anonymous.code, RpcCode::Unauthenticated);

        let invalid = handler
            .handle(rpc_request(
                "users.GetUser",
                serde_json::json!({"user_id": "not valid!"}),
                Metadata::new(),
            ))
            .await
            .unwrap_err();
        assert_eq!(invalid.code, RpcCode::InvalidArgument);
    }
}
