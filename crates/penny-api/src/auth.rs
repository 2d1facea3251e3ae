//! `Authorization` header extraction into an [`AuthPrincipal`].
//!
//! Generalizes a single static API-key check inline inside a handler into a
//! real per-tenant principal resolved through an axum extractor — the
//! idiomatic axum way to share one auth step across every route.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use penny_core::CoreError;
use penny_core::tenant::AuthPrincipal;

use crate::error::ApiError;
use crate::state::AppState;

/// Extracts and resolves the caller's bearer credential: `Bearer
/// <jwt|apikey>` or `ApiKey <apikey>`.
pub struct Principal(pub AuthPrincipal);

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| CoreError::Unauthenticated("missing Authorization header".into()))?
            .to_str()
            .map_err(|_| CoreError::Unauthenticated("Authorization header is not valid UTF-8".into()))?;

        let principal = app_state.resolver.resolve(header)?;
        Ok(Principal(principal))
    }
}
