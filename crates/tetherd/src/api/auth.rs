//! Bearer-token authentication for sensitive routes.
//!
//! The token travels in the `Authorization: Bearer` header or, for
//! clients that cannot set headers (EventSource, some WebSocket stacks),
//! in a `token` query parameter.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};

use super::error::ApiError;
use super::state::AppState;

/// Middleware enforcing pairing on every route it wraps.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).unwrap_or_default();
    if state.pairing.is_authenticated(&token).await {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::unauthorized(
            "missing or invalid bearer token; pair with this daemon first",
        ))
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    if let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }

    request.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(str::to_string)
    })
}

/// Best-effort client identity for lockout bookkeeping: the first
/// `X-Forwarded-For` entry, then the peer address, then `"unknown"`.
pub struct ClientIdentity(pub String);

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let identity = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Ok(ClientIdentity(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_token_from_header() {
        let req = request("/agent/state", Some("Bearer tk_abc"));
        assert_eq!(bearer_token(&req).as_deref(), Some("tk_abc"));
    }

    #[test]
    fn test_bearer_token_from_query() {
        let req = request("/ws?token=tk_xyz", None);
        assert_eq!(bearer_token(&req).as_deref(), Some("tk_xyz"));
    }

    #[test]
    fn test_header_wins_over_query() {
        let req = request("/ws?token=tk_query", Some("Bearer tk_header"));
        assert_eq!(bearer_token(&req).as_deref(), Some("tk_header"));
    }

    #[test]
    fn test_no_token() {
        let req = request("/agent/state", None);
        assert_eq!(bearer_token(&req), None);
        let req = request("/agent/state", Some("Basic dXNlcg=="));
        assert_eq!(bearer_token(&req), None);
    }
}
