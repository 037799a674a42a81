//! Header sanitisation for proxied requests and responses.

use axum::http::HeaderMap;
use axum::http::header::{self, HeaderName};

/// Connection-scoped headers that must never cross a proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers carrying the gateway credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Credential the gateway attaches to requests it forwards to local
/// sandbox endpoints. Never accepted from clients.
pub const GATEWAY_TOKEN_HEADER: &str = "x-sandboxd-gateway-token";

/// Names listed in the `Connection` header are hop-by-hop too.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn strip(headers: &HeaderMap, drop: impl Fn(&HeaderName) -> bool) -> HeaderMap {
    let listed = connection_tokens(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || listed.iter().any(|t| t == lower) || drop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Request headers safe to send upstream. Credentials, `Host`, and
/// `Content-Length` are dropped along with anything in `filtered`.
pub fn forwardable_request_headers(headers: &HeaderMap, filtered: &[String]) -> HeaderMap {
    strip(headers, |name| {
        *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::AUTHORIZATION
            || name.as_str() == API_KEY_HEADER
            || name.as_str() == GATEWAY_TOKEN_HEADER
            || filtered.iter().any(|f| f.eq_ignore_ascii_case(name.as_str()))
    })
}

/// Upstream response headers safe to return to the client.
pub fn forwardable_response_headers(headers: &HeaderMap) -> HeaderMap {
    strip(headers, |name| *name == header::CONTENT_LENGTH)
}

/// Key from `Authorization: Bearer ...` or `X-API-Key`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|key| !key.is_empty())
}
