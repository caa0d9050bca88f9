use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

/// Bearer-token verification against the shared secret. Tokens are checked
/// once at session handshake (or per REST request); there is no mid-session
/// revalidation.
pub struct AuthService;

impl AuthService {
    /// Create a signed JWT for a user id.
    pub fn create_jwt(secret: &str, user_id: &str, ttl_hours: i64) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp() as usize,
            exp: (now + Duration::hours(ttl_hours)).timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )?;
        Ok(token)
    }

    /// Decode and validate a JWT, returning the claims.
    pub fn decode_jwt(secret: &str, token: &str) -> AppResult<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }

    /// Extract the token from an `Authorization: Bearer ...` header value.
    pub fn bearer_token(header: &str) -> Option<&str> {
        let rest = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))?;
        let token = rest.trim();
        (!token.is_empty()).then_some(token)
    }
}
