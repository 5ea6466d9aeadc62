//! HTTP proxy logic
//!
//! Receives OpenAI-compatible requests, and for every attempt of the rotation
//! loop rewrites the body's `model` and the `Authorization` header to the
//! selected combination before forwarding upstream. Successful responses, and
//! client errors caused by the request itself, are returned verbatim.

use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use key_rotation::{CallError, FailureKind, Manager, Outcome, Selection, classify_status};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::metrics::record_upstream_error;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Markers of a 400 that rejects the API key rather than the request.
const CREDENTIAL_BODY_PATTERNS: &[&str] = &["api_key_invalid", "api key"];

/// Upstream bodies quoted in failure messages are cut to this many chars.
const ERROR_EXCERPT_CHARS: usize = 200;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub request_deadline: Duration,
    pub manager: Arc<Manager>,
}

/// An upstream response accepted by the rotation loop.
struct Upstream {
    status: StatusCode,
    headers: reqwest::header::HeaderMap,
    body: Bytes,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy an inbound request upstream, rotating credentials and models until
/// one succeeds or the general failure budget is spent.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let method = request.method().clone();
    let upstream_url = match request.uri().path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };
    let headers = forward_headers(request.headers());

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let payload = if body_bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice::<serde_json::Value>(&body_bytes) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            Ok(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "request body must be a JSON object",
                    &request_id,
                );
            }
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("request body is not valid JSON: {e}"),
                    &request_id,
                );
            }
        }
    };

    let rotation = key_rotation::drive_with_outcome(&state.manager, |selection: Selection| {
        let body = match &payload {
            Some(map) => attempt_body(map, &selection.model),
            None => Bytes::new(),
        };
        let attempt = state
            .client
            .request(method.clone(), &upstream_url)
            .headers(headers.clone())
            .bearer_auth(selection.credential.key())
            .timeout(state.timeout)
            .body(body);
        async move { send_attempt(attempt).await }
    });

    match tokio::time::timeout(state.request_deadline, rotation).await {
        Ok(Ok(upstream)) => relay(upstream, &request_id),
        Ok(Err(key_rotation::Error::AllRetriesExhausted {
            attempts,
            last_error,
        })) => {
            error!(attempts, error = %last_error, "rotation budget exhausted");
            error_response(
                StatusCode::BAD_GATEWAY,
                "rotation_exhausted",
                &format!("all retries exhausted after {attempts} attempts: {last_error}"),
                &request_id,
            )
        }
        Ok(Err(e)) => {
            error!(error = %e, "rotation failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &e.to_string(),
                &request_id,
            )
        }
        Err(_) => {
            let retry_after = state
                .manager
                .should_wait()
                .map(|wait| wait.as_secs().max(1))
                .unwrap_or(1);
            warn!(
                deadline_secs = state.request_deadline.as_secs(),
                retry_after, "request deadline elapsed while rotating"
            );
            let mut response = error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "rotation_backoff",
                &format!(
                    "no working credential within {}s, retry later",
                    state.request_deadline.as_secs()
                ),
                &request_id,
            );
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}

/// Copy inbound headers that are safe to forward. The body is rewritten per
/// attempt and the credential is injected, so length, host and auth are
/// dropped too.
fn forward_headers(inbound: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str())
            || name == HOST
            || name == CONTENT_LENGTH
            || name == AUTHORIZATION
        {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    headers
}

/// Serialize the payload with `model` set to the selected model.
fn attempt_body(payload: &serde_json::Map<String, serde_json::Value>, model: &str) -> Bytes {
    let mut payload = payload.clone();
    payload.insert("model".into(), serde_json::Value::String(model.to_string()));
    Bytes::from(serde_json::Value::Object(payload).to_string())
}

/// Send one attempt and classify the outcome for the rotation loop.
async fn send_attempt(attempt: reqwest::RequestBuilder) -> Result<Outcome<Upstream>, CallError> {
    let response = attempt.send().await.map_err(|e| {
        let error_type = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection"
        } else {
            "other"
        };
        record_upstream_error(error_type);
        CallError::general(format!("upstream request failed: {e}"))
    })?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| {
        record_upstream_error("other");
        CallError::general(format!("upstream response read error: {e}"))
    })?;

    if status.is_success() {
        return Ok(Outcome::Served(Upstream {
            status,
            headers,
            body,
        }));
    }

    let text = String::from_utf8_lossy(&body);
    match classify_status(status.as_u16(), &text) {
        FailureKind::QuotaExhausted => {
            record_upstream_error("quota");
            Err(CallError::quota(format!(
                "upstream returned {status}: {}",
                excerpt(&text)
            )))
        }
        FailureKind::General if is_client_error(status, &text) => {
            info!(%status, "passing client error through without rotating");
            Ok(Outcome::Refused(Upstream {
                status,
                headers,
                body,
            }))
        }
        FailureKind::General => {
            record_upstream_error("status");
            Err(CallError::general(format!(
                "upstream returned {status}: {}",
                excerpt(&text)
            )))
        }
    }
}

/// A 4xx caused by the request itself rather than the combination.
///
/// Auth failures, unknown models (404) and a 400 naming the API key all point
/// at the combination and rotate instead.
fn is_client_error(status: StatusCode, body: &str) -> bool {
    if !status.is_client_error()
        || matches!(
            status,
            StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::NOT_FOUND
                | StatusCode::TOO_MANY_REQUESTS
        )
    {
        return false;
    }
    let lower = body.to_ascii_lowercase();
    !CREDENTIAL_BODY_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(ERROR_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Build the client response from an accepted upstream response.
fn relay(upstream: Upstream, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Method label for metrics; unknown extension methods collapse to `OTHER`.
pub fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::PATCH => "PATCH",
        Method::HEAD => "HEAD",
        Method::OPTIONS => "OPTIONS",
        _ => "OTHER",
    }
}
