//! Request body limits for the HTTP surface.
//!
//! Rejects bodies over `limits.max_request_size` (413) and POST bodies that
//! are not a JSON object (400). Field-level checks happen in the transcoder
//! once the route is known.

use crate::adapters::error_conversions::error_response;
use crate::domain::config::LimitsConfig;
use crate::domain::error::{GatewayError, ValidationError};
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    response::Response,
};
use bytes::Bytes;
use std::sync::Arc;
use tower::{Layer, Service};
use tracing::warn;

#[derive(Clone)]
pub struct ValidationLayer {
    limits: Arc<LimitsConfig>,
}

impl ValidationLayer {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits: Arc::new(limits),
        }
    }
}

impl<S> Layer<S> for ValidationLayer {
    type Service = ValidationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ValidationService {
            inner,
            limits: Arc::clone(&self.limits),
        }
    }
}

#[derive(Clone)]
pub struct ValidationService<S> {
    inner: S,
    limits: Arc<LimitsConfig>,
}

impl<S> Service<Request<Body>> for ValidationService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limit = self.limits.max_request_size;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Fast path: trust a declared length that is already too big
            let declared = req
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok());
            if let Some(len) = declared.filter(|len| *len > limit) {
                warn!(size = len, max = limit, "Request too large (from header)");
                return Ok(error_response(&GatewayError::PayloadTooLarge { limit }));
            }

            let (parts, body) = req.into_parts();
            let bytes = match to_bytes(body, limit).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(max = limit, error = %e, "Request body rejected");
                    return Ok(error_response(&GatewayError::PayloadTooLarge { limit }));
                }
            };

            if parts.method == Method::POST {
                if let Err(e) = validate_json_body(&bytes) {
                    warn!(error = %e, "Invalid request body");
                    return Ok(error_response(&e.into()));
                }
            }

            inner.call(Request::from_parts(parts, Body::from(bytes))).await
        })
    }
}

/// A POST body is either empty or a JSON object.
pub fn validate_json_body(body: &Bytes) -> Result<(), ValidationError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ValidationError::body(format!("invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(ValidationError::body("expected a JSON object"));
    }
    Ok(())
}
