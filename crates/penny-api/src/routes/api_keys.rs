//! `POST/GET/DELETE /v1/api-keys`.
//!
//! Gated by the `api_keys:manage` scope, following the same
//! `resource:action` naming convention as `conversations:write` (recorded
//! as an Open Question resolution in DESIGN.md).

use std::collections::HashSet;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use penny_core::resolver::require_scope;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

const MANAGE_SCOPE: &str = "api_keys:manage";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueApiKeyRequest {
    pub principal_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

pub async fn issue(
    State(state): State<AppState>,
    Principal(principal): Principal,
    Json(req): Json<IssueApiKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&principal, MANAGE_SCOPE)?;

    let plaintext = state.api_keys.issue(
        req.principal_id,
        principal.tenant_id.clone(),
        req.scopes.into_iter().collect::<HashSet<_>>(),
        req.roles.into_iter().collect::<HashSet<_>>(),
    );

    // Plaintext is returned exactly once; the store never persists it.
    Ok(Json(json!({ "apiKey": plaintext })))
}

pub async fn list(State(state): State<AppState>, Principal(principal): Principal) -> Result<Json<Value>, ApiError> {
    require_scope(&principal, MANAGE_SCOPE)?;

    let records: Vec<Value> = state
        .api_keys
        .list_for_tenant(&principal.tenant_id)
        .into_iter()
        .map(|r| {
            json!({
                "id": r.id,
                "principalId": r.principal_id,
                "scopes": r.scopes,
                "roles": r.roles,
                "active": r.active,
                "createdAt": r.created_at,
                "lastUsedAt": r.last_used_at,
                "expiresAt": r.expires_at,
            })
        })
        .collect();

    Ok(Json(json!({ "apiKeys": records })))
}

pub async fn revoke(
    State(state): State<AppState>,
    Principal(principal): Principal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_scope(&principal, MANAGE_SCOPE)?;
    state.api_keys.revoke_by_id(&principal.tenant_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}
