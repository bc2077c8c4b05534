//! Request middleware: request id, rate limiting, bearer auth.
//!
//! Ordering (outermost first) is assembled in `main`: recovery
//! (catch-panic), request id, trace, rate limit, CORS, auth.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::error::ApiError;
use crate::state::SharedState;
use crate::tokens::TokenType;

/// Routes that never require a token.
const PUBLIC_PREFIXES: &[&str] = &["/health", "/pair", "/api/pair/"];

pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let request_id = cdev_protocol::new_id();
    req.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Sliding-window rate limiting keyed by client IP (proxy-aware).
pub async fn rate_limit_middleware(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let client_ip = state.proxy_trust.client_ip(addr.ip(), req.headers());
    let decision = state.limiter.check(&client_ip.to_string());

    if !decision.allowed {
        warn!(
            component = "http",
            event = "http.rate_limited",
            client_ip = %client_ip,
            path = %req.uri().path(),
            "Request rate limited"
        );
        let mut response = ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many requests",
        )
        .into_response();
        let headers = response.headers_mut();
        headers.insert("retry-after", HeaderValue::from_static("60"));
        headers.insert(
            "x-ratelimit-limit",
            HeaderValue::from_str(&decision.limit.to_string()).unwrap_or(HeaderValue::from_static("0")),
        );
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        return response;
    }

    next.run(req).await
}

/// Bearer auth for non-public routes. Accepts `Authorization: Bearer`,
/// `X-Cdev-Token`, or `?token=` (WebSocket clients cannot always set
/// headers).
pub async fn auth_middleware(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.config.security.require_auth {
        return Ok(next.run(req).await);
    }

    let path = req.uri().path();
    if PUBLIC_PREFIXES
        .iter()
        .any(|prefix| path == prefix.trim_end_matches('/') || path.starts_with(prefix))
    {
        return Ok(next.run(req).await);
    }

    let token = extract_token(&req).ok_or_else(|| ApiError::unauthorized("invalid_format"))?;
    state
        .tokens
        .validate_typed(&token, TokenType::Access)
        .map_err(ApiError::from)?;
    Ok(next.run(req).await)
}

fn extract_token(req: &Request<Body>) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    if let Some(value) = req.headers().get("x-cdev-token").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn token_extraction_order() {
        let req = request("/api/status", &[("authorization", "Bearer abc")]);
        assert_eq!(extract_token(&req).as_deref(), Some("abc"));

        let req = request("/api/status", &[("x-cdev-token", "xyz")]);
        assert_eq!(extract_token(&req).as_deref(), Some("xyz"));

        let req = request("/ws?token=qtok", &[]);
        assert_eq!(extract_token(&req).as_deref(), Some("qtok"));

        let req = request("/api/status", &[]);
        assert_eq!(extract_token(&req), None);
    }

    #[test]
    fn public_prefixes_cover_pairing() {
        for path in ["/health", "/pair", "/api/pair/info", "/api/pair/exchange"] {
            assert!(
                PUBLIC_PREFIXES
                    .iter()
                    .any(|p| path == p.trim_end_matches('/') || path.starts_with(p)),
                "{path} should be public"
            );
        }
        for path in ["/api/status", "/ws", "/api/claude/run"] {
            assert!(
                !PUBLIC_PREFIXES
                    .iter()
                    .any(|p| path == p.trim_end_matches('/') || path.starts_with(p)),
                "{path} should be protected"
            );
        }
    }
}
