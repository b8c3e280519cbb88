//! Bearer-token verification for REST and WebSocket handshakes.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// Constant-time-ish token comparison is not needed here: the token is
/// 256 bits of randomness, not a password.
#[must_use]
pub fn verify_token(state: &AppState, presented: &str) -> bool {
    !presented.is_empty() && presented == state.config.auth_token
}

/// Extractor enforcing `Authorization: Bearer <token>` on REST routes.
pub struct RequireBearer;

impl FromRequestParts<AppState> for RequireBearer {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
            return Err((
                StatusCode::UNAUTHORIZED,
                "Missing or invalid Authorization header",
            )
                .into_response());
        };
        if !verify_token(state, token) {
            return Err((StatusCode::FORBIDDEN, "Invalid token").into_response());
        }
        Ok(Self)
    }
}
