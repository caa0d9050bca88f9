use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;
use crate::services::auth::AuthService;
use crate::AppState;

/// Extractor for the authenticated user id on REST routes. The bearer token
/// is verified against the shared secret; no user lookup happens here, the
/// claims are the identity.
pub struct AuthUser(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::debug!("Missing or invalid Authorization header");
                AppError::Unauthorized
            })?;

        let token = AuthService::bearer_token(header).ok_or(AppError::Unauthorized)?;
        let claims = AuthService::decode_jwt(&state.config.jwt.secret, token)?;

        Ok(AuthUser(claims.sub))
    }
}
