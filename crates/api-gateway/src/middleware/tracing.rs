//! Request span and trace context for the HTTP surface.
//!
//! Opens an `api_request` span per request, continues an inbound W3C
//! `traceparent` (or starts a new trace), and hands the context to the
//! handler as a [`RequestContext`] extension. The request id is echoed back
//! in `x-request-id`.

use crate::domain::correlation::{CorrelationId, TraceContext, REQUEST_ID_KEY, TRACEPARENT_KEY};
use axum::{
    body::Body,
    http::{HeaderValue, Request},
    response::Response,
};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{info_span, Instrument, Span};

/// Correlation data extracted at the edge
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub correlation_id: CorrelationId,
    pub trace: TraceContext,
}

impl RequestContext {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
        Self {
            correlation_id: CorrelationId::from_header(header(REQUEST_ID_KEY)),
            trace: TraceContext::from_header(header(TRACEPARENT_KEY)),
        }
    }
}

/// Tracing layer that creates spans for each request
#[derive(Clone, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService { inner }
    }
}

/// Tracing service
#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TracingService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();

        let context = RequestContext::from_request(&req);
        let span = info_span!(
            "api_request",
            http.method = %req.method(),
            http.target = %req.uri().path(),
            request_id = %context.correlation_id,
            trace_id = %context.trace.trace_id_hex(),
            otel.kind = "server",
            otel.status_code = tracing::field::Empty,
            http.status_code = tracing::field::Empty,
        );
        req.extensions_mut().insert(context);

        Box::pin(
            async move {
                let mut result = inner.call(req).await;

                match &mut result {
                    Ok(response) => {
                        let status = response.status();
                        let span = Span::current();
                        span.record("http.status_code", status.as_u16());
                        span.record(
                            "otel.status_code",
                            if status.is_server_error() { "ERROR" } else { "OK" },
                        );
                        if let Ok(value) =
                            HeaderValue::from_str(&context.correlation_id.to_string())
                        {
                            response.headers_mut().insert(REQUEST_ID_KEY, value);
                        }
                    }
                    Err(_) => {
                        Span::current().record("otel.status_code", "ERROR");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
