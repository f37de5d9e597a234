//! Auth gate for protected routes.
//!
//! [`auth_gate`] runs before every protected handler: it requires a
//! `Bearer` token, verifies it, resolves the caller's role and stores an
//! [`Identity`] in the request extensions. Handlers take [`CurrentUser`].

use crate::{
    errors::AppError, models::user::Identity, services::song_service::CatalogError,
    state::AppState,
};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header, request::Parts},
    middleware::Next,
    response::Response,
};
use tracing::debug;

pub async fn auth_gate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // owned so no borrow of the request is held across the await
    let token = bearer_token(req.headers())
        .map(str::to_string)
        .ok_or_else(|| AppError::unauthorized("No token provided"))?;

    let verified = state.verifier.verify(&token).await.map_err(|err| {
        debug!("rejected bearer token: {}", err);
        AppError::unauthorized("Invalid token")
    })?;

    let user = state
        .users
        .resolve(&verified)
        .await
        .map_err(|err| AppError::from(CatalogError::from(err)))?;

    req.extensions_mut().insert(Identity::from(user));
    Ok(next.run(req).await)
}

/// The token from an `Authorization: Bearer <token>` header, if well-formed.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}

/// The authenticated caller. Rejects with 401 outside the auth gate.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| {
                AppError::from(CatalogError::Unauthenticated(
                    "Authentication required".into(),
                ))
            })
    }
}
