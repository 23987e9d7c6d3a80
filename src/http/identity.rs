//! Caller identification from proxy headers.

use axum::http::HeaderMap;

/// Identifier shared by every caller whose origin cannot be determined.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Headers consulted in order; the first non-empty value wins.
const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const CDN_CONNECTING_IP: &str = "cf-connecting-ip";

/// Derive the caller identifier for a request.
///
/// Uses the first entry of `X-Forwarded-For`, then `X-Real-IP`, then
/// `CF-Connecting-IP`, and falls back to `"unknown"`. All callers without
/// any of these headers share one throttle bucket.
pub fn client_identifier(headers: &HeaderMap) -> String {
    header_str(headers, FORWARDED_FOR)
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| header_str(headers, REAL_IP))
        .or_else(|| header_str(headers, CDN_CONNECTING_IP))
        .unwrap_or(UNKNOWN_IDENTIFIER)
        .to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
