use crate::errors::ErrorEnvelope;
use crate::metrics::{HTTP_ERRORS_TOTAL, HTTP_REQUESTS_TOTAL, REQUEST_LATENCY_SECONDS};
use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Instant;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

// Error envelopes are small; anything larger is not ours to patch.
const MAX_PATCHED_BODY: usize = 64 * 1024;

/// Short opaque id attached to a request, echoed in the response header and
/// every log line produced while handling it.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Assigns the request id, spans the handler, echoes the id, and completes
/// error envelopes with `path` and `request_id`.
pub async fn request_context(mut request: Request, next: Next) -> Response {
    let id = new_request_id();
    let path = request.uri().path().to_string();
    request.extensions_mut().insert(RequestId(id.clone()));

    let span = info_span!("request", request_id = %id, method = %request.method(), path = %path);
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    if response.extensions().get::<ErrorEnvelope>().is_some() {
        response = patch_error_envelope(response, &path, &id).await;
    }
    response
}

async fn patch_error_envelope(response: Response, path: &str, request_id: &str) -> Response {
    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_PATCHED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(mut envelope) => {
            envelope["path"] = serde_json::Value::String(path.to_string());
            envelope["request_id"] = serde_json::Value::String(request_id.to_string());
            let patched = serde_json::to_vec(&envelope).unwrap_or_else(|_| bytes.to_vec());
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(patched))
        }
        Err(_) => Response::from_parts(parts, Body::from(bytes)),
    }
}

/// Adds the standard security headers to every response.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

/// Counts requests and observes handler latency.
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    HTTP_REQUESTS_TOTAL.inc();
    if let Some(RequestId(id)) = request.extensions().get::<RequestId>() {
        tracing::debug!("handling request {id}");
    }

    let response = next.run(request).await;

    REQUEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
    if response.status().is_client_error() || response.status().is_server_error() {
        HTTP_ERRORS_TOTAL.inc();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = new_request_id();
        assert_eq!(id.len(), 12);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id, new_request_id());
    }
}
