use crate::api::AppState;
use crate::domain::identity::Claims;
use crate::error::{AppError, Result};
use axum::{
    extract::FromRequestParts,
    http::{HeaderValue, Request, header, request::Parts},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

/// Verifies an HS256 identity token and returns its claims.
///
/// # Errors
/// Returns `AppError::AuthError` if the signature, expiry or shape is invalid.
pub fn verify_jwt(token: &str, secret: &str) -> Result<Claims> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|data| data.claims)
        .map_err(|_| AppError::AuthError)
}

#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        let auth_header = parts.headers.get(header::AUTHORIZATION).ok_or(AppError::AuthError)?;
        let auth_str = auth_header.to_str().map_err(|_| AppError::AuthError)?;
        let token = auth_str.strip_prefix("Bearer ").ok_or(AppError::AuthError)?;

        let claims = verify_jwt(token, &state.config.auth.jwt_secret)?;
        tracing::Span::current().record("user_id", tracing::field::display(claims.sub));

        Ok(Self { user_id: claims.sub })
    }
}

/// Keeps a caller-supplied `x-request-id` when it is usable, otherwise mints a v7 UUID.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuidOrHeader;

impl MakeRequestId for MakeRequestUuidOrHeader {
    fn make_request_id<B>(&mut self, request: &Request<B>) -> Option<RequestId> {
        let existing = request
            .headers()
            .get("x-request-id")
            .filter(|v| v.to_str().is_ok_and(|s| !s.is_empty() && s.len() <= 128))
            .cloned();

        let value = match existing {
            Some(v) => v,
            None => HeaderValue::from_str(&Uuid::now_v7().to_string()).ok()?,
        };
        Some(RequestId::new(value))
    }
}
