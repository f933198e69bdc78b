use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing;

use crate::server::ApiState;

/// Extract bearer token from Authorization header
fn extract_token(auth_header: Option<&str>) -> Option<&str> {
    auth_header?.strip_prefix("Bearer ").map(str::trim)
}

fn tokens_match(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Requires `Authorization: Bearer <operator token>` on every route except
/// `/health`. With no token configured the API is open.
pub async fn auth_middleware(
    req: Request,
    next: axum::middleware::Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = req
        .extensions()
        .get::<ApiState>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .operator_token
        .clone();

    let expected = match expected {
        Some(token) => token,
        None => return Ok(next.run(req).await),
    };

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let authorized = match extract_token(auth_header) {
        Some(token) => tokens_match(token, &expected),
        None => {
            tracing::debug!("Missing Authorization header");
            false
        }
    };

    if !authorized {
        tracing::debug!("Rejected unauthenticated request to {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}
