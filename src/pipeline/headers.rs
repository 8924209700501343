//! Header helpers used by stage handlers.
//!
//! Stateless operations over a `HeaderMap`. Invalid names or values are
//! reported as `PipelineError::Handler` so a handler can route to Error.

use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;

use crate::error::PipelineError;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// First value of `name` as a string, if present and valid UTF-8.
pub fn get<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Replace every value of `name` with `value`.
pub fn set(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), PipelineError> {
    let name = HeaderName::try_from(name).map_err(|e| PipelineError::Handler(format!("header name {name:?}: {e}")))?;
    let value = HeaderValue::from_str(value).map_err(|e| PipelineError::Handler(format!("header {name}: {e}")))?;
    headers.insert(name, value);
    Ok(())
}

/// Remove `name`. Returns true if it was present.
pub fn unset(headers: &mut HeaderMap, name: &str) -> bool {
    headers.remove(name).is_some()
}

/// Remove every header whose name matches `pattern`. Returns how many names were removed.
pub fn unset_matching(headers: &mut HeaderMap, pattern: &Regex) -> usize {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| pattern.is_match(name.as_str()))
        .cloned()
        .collect();
    for name in &doomed {
        headers.remove(name);
    }
    doomed.len()
}

/// Keep only headers whose name matches `pattern`.
pub fn filter(headers: &HeaderMap, pattern: &Regex) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| pattern.is_match(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Append the client address to `X-Forwarded-For`.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let value = match get(headers, X_FORWARDED_FOR) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {client}"),
        _ => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
