//! Rate limit headers and the 429 response.

use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::json;

use crate::ratelimit::AdmissionDecision;

/// Message carried in every 429 body.
pub const REJECTION_MESSAGE: &str = "Too many requests, please try again later";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Write the `X-RateLimit-*` headers for `decision`.
///
/// The reset header is an absolute epoch in seconds.
pub fn apply_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    let now = Utc::now().timestamp().max(0) as u64;
    let reset_at = now.saturating_add(decision.reset_ms.div_ceil(1000));

    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
}

/// Write the headers for `decision` unless a gate nested inside already
/// reported an equal or smaller remaining budget.
pub fn merge_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    let existing = headers
        .get(&X_RATELIMIT_REMAINING)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    match existing {
        Some(remaining) if remaining <= decision.remaining => {}
        _ => apply_headers(headers, decision),
    }
}

/// The 429 answer for a rejected request.
pub fn rejection_response(decision: &AdmissionDecision) -> Response {
    let retry_after = decision.retry_after_secs.unwrap_or(1);
    let body = json!({
        "success": false,
        "error": REJECTION_MESSAGE,
        "retryAfter": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    apply_headers(headers, decision);
    response
}
