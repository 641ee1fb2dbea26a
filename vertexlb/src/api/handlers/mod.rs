//! Axum route handlers.

pub mod chat_completions;
pub mod models;

use axum::http::HeaderMap;

/// Client address from the standard forwarding headers: the first
/// `X-Forwarded-For` hop, then `X-Real-IP`.
pub(crate) fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|value| value.to_str().ok()) {
        let first = forwarded.split(',').next().map(str::trim).unwrap_or_default();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
