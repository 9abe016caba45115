//! Authentication extractor.
//!
//! Replicas present a bearer token on connect. When `AUTH_SECRET` is
//! configured the token must match it; with no secret configured the
//! relay accepts anonymous connections. Token issuance itself lives
//! outside the relay.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated replica extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .filter(|token| !token.is_empty());

        match (&state.config.auth_secret, presented) {
            // No secret configured: take whatever the replica presented,
            // or let it in anonymously.
            (None, token) => Ok(AuthUser {
                token: token.unwrap_or("anonymous").to_string(),
            }),
            (Some(secret), Some(token)) if token == secret => Ok(AuthUser {
                token: token.to_string(),
            }),
            (Some(_), Some(_)) => Err(AppError::Unauthorized("credential mismatch")),
            (Some(_), None) => Err(AppError::Unauthorized("missing bearer credential")),
        }
    }
}
