//! # API Middleware
//!
//! Request middleware for the transit API:
//!
//! - Bearer-token authentication against the server's shared secret
//! - Request context: a request id and a `tracing` span carrying it, so
//!   every handler log line is attributable to its request

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use super::responses::ApiError;

/// Request ID header name
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared-secret state for the auth middleware.
#[derive(Clone)]
pub struct AuthState {
    /// The bearer token every request must present
    pub token: String,
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn extract_bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Reject requests that do not carry the configured bearer token.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("missing or invalid authorization header"))?;

    if token != auth.token {
        return Err(ApiError::unauthorized("invalid token"));
    }

    Ok(next.run(request).await)
}

/// Install a request id and a request-scoped logging span.
///
/// An incoming `x-request-id` is propagated; otherwise one is generated.
/// The id is echoed on the response and recorded on the span together with
/// the method and path, which is how handler log lines pick up their
/// request context.
pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret-123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("secret-123"));
    }

    #[test]
    fn test_extract_bearer_token_missing_or_malformed() {
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "bearer lowercase".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }
}
