//! Axum middleware layered in front of the request router.
//!
//! These layers stay stateless: they tag requests and responses and leave all
//! routing decisions to [`HttpHandler`](super::HttpHandler).
use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderValue, header::SERVER},
    middleware::Next,
    response::Response,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id of one transaction, available as a request extension.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Log request latency at debug level. The router logs the completion event.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();

    let response = next.run(req).await;

    tracing::debug!(
        method = %method,
        uri = %uri,
        version = ?version,
        status = response.status().as_u16(),
        elapsed = ?start.elapsed(),
        "Request timing"
    );

    response
}

/// Attach a request id (the caller's `X-Request-ID` when it is a valid
/// header value, else a fresh UUID) to the request and echo it back.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Identify the server on every response that does not already name one.
pub async fn server_header_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .entry(SERVER)
        .or_insert(HeaderValue::from_static(concat!(
            "atrium/",
            env!("CARGO_PKG_VERSION")
        )));
    response
}
