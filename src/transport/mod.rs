//! Transport adapters.
//!
//! Both adapters terminate their wire-specific handshake and framing, then
//! hand everything to the same registry/fan-out/presence stack; the two
//! protocols stay semantically equivalent above this line.

mod sse;
mod ws;

pub use sse::{sse_handler, subscription_handler, SubscriptionAction, SubscriptionRequest};
pub use ws::ws_handler;

use axum::http::{header, HeaderMap};

/// Extract a bearer token from a `token` query parameter or the
/// Authorization header. The query parameter takes precedence since
/// browser EventSource and WebSocket clients cannot set headers.
pub(crate) fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token {
        return Some(token.to_string());
    }

    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_from_query() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_token(Some("my-token"), &headers),
            Some("my-token".to_string())
        );
    }

    #[test]
    fn test_extract_token_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer header-token".parse().unwrap(),
        );
        assert_eq!(
            extract_token(None, &headers),
            Some("header-token".to_string())
        );
    }

    #[test]
    fn test_extract_token_query_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer header-token".parse().unwrap(),
        );
        assert_eq!(
            extract_token(Some("query-token"), &headers),
            Some("query-token".to_string())
        );
    }

    #[test]
    fn test_extract_token_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_token(None, &headers), None);
    }
}
