//! CORS for browser clients, built on tower-http.

use crate::domain::config::CorsConfig;
use crate::domain::correlation::{REQUEST_ID_KEY, TRACEPARENT_KEY};
use crate::domain::invocation::IDEMPOTENCY_KEY;
use axum::http::{header, HeaderName, HeaderValue, Method};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Build the CORS layer, or `None` when CORS is disabled.
pub fn create_cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }

    let origin = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(IDEMPOTENCY_KEY),
            HeaderName::from_static(TRACEPARENT_KEY),
            HeaderName::from_static(REQUEST_ID_KEY),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_KEY), header::RETRY_AFTER])
        .max_age(Duration::from_secs(config.max_age));

    Some(cors)
}
