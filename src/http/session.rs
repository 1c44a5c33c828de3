//! Session identification on ingress
//!
//! Sessions are identified by a client-supplied header, trusted because
//! ingress authentication has already run. `X-Muster-Session-ID` wins over
//! the transport-level `Mcp-Session-Id`; requests without either are served
//! under the anonymous session.

use axum::http::HeaderMap;

/// Resolve the session id for a request
pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(crate::constants::SESSION_HEADER)
        .or_else(|| headers.get(crate::constants::MCP_SESSION_HEADER))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(String::from)
}

/// Session id or the anonymous fallback
pub fn session_or_anonymous(headers: &HeaderMap) -> String {
    session_from_headers(headers)
        .unwrap_or_else(|| crate::constants::ANONYMOUS_SESSION.to_string())
}
