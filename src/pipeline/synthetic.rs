//! Synthetic responses built in the Error stage.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;

use crate::cache::CachedResponse;

/// Builds the response delivered for an error.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, status: StatusCode, reason: &str, request_id: &str) -> CachedResponse;
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    status: u16,
    reason: &'a str,
    request_id: &'a str,
}

/// Renders `{"error":{"status","reason","request_id"}}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSynthesizer;

impl Synthesizer for JsonSynthesizer {
    fn synthesize(&self, status: StatusCode, reason: &str, request_id: &str) -> CachedResponse {
        let body = ErrorBody {
            error: ErrorDetail {
                status: status.as_u16(),
                reason,
                request_id,
            },
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

        // Serializing plain strings and integers cannot fail.
        let body = serde_json::to_vec(&body).unwrap_or_default();
        CachedResponse::new(status, headers, body)
    }
}
