//! Turns a bearer credential into an [`AuthPrincipal`], stamped onto every
//! downstream call.
//!
//! JWT verification follows `sven-node`'s use of `jsonwebtoken` (the closest
//! companion example with an HTTP auth boundary); API-key hashing uses
//! `sha2`, already reachable through `querymt-querymt`'s dependency graph.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::tenant::{AuthPrincipal, PrincipalKind, Tenant, TenantId};

static CREDENTIAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:Bearer|ApiKey)\s+(.+)$").expect("valid regex"));

/// Claims carried by a PENNY-issued JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
    pub exp: usize,
}

/// A stored API key record, keyed by its SHA-256 hash (never the plaintext).
/// `id` is the opaque handle exposed to callers for listing/revocation, since
/// the hash itself is never re-derivable from outside.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub principal_id: String,
    pub tenant_id: TenantId,
    pub scopes: HashSet<String>,
    pub roles: HashSet<String>,
    pub active: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub last_used_at: Option<chrono::DateTime<Utc>>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

/// Looks up tenants by ID. Implemented by whatever persistence layer backs
/// the service; `InMemoryTenantStore` below is the dev/test instance.
pub trait TenantStore: Send + Sync {
    fn get(&self, tenant_id: &str) -> Option<Tenant>;
}

/// Looks up API key records by their SHA-256 hash, and records best-effort
/// last-used timestamps — a failure here never fails the caller's request.
pub trait ApiKeyStore: Send + Sync {
    fn get_by_hash(&self, hash: &str) -> Option<ApiKeyRecord>;
    fn touch_last_used(&self, hash: &str);
}

#[derive(Default)]
pub struct InMemoryTenantStore {
    tenants: DashMap<TenantId, Tenant>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: Tenant) {
        self.tenants.insert(tenant.id.clone(), tenant);
    }
}

impl TenantStore for InMemoryTenantStore {
    fn get(&self, tenant_id: &str) -> Option<Tenant> {
        self.tenants.get(tenant_id).map(|t| t.clone())
    }
}

#[derive(Default)]
pub struct InMemoryApiKeyStore {
    keys: DashMap<String, ApiKeyRecord>,
    ids: DashMap<String, String>,
}

impl InMemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a new key, returning the plaintext. The plaintext is never
    /// stored; callers hand it to the caller exactly once.
    pub fn issue(
        &self,
        principal_id: impl Into<String>,
        tenant_id: impl Into<TenantId>,
        scopes: HashSet<String>,
        roles: HashSet<String>,
    ) -> String {
        let raw = uuid::Uuid::new_v4().to_string().replace('-', "");
        let plaintext = format!("pk_{raw}");
        let hash = hash_api_key(&plaintext);
        let id = uuid::Uuid::new_v4().to_string();
        self.keys.insert(
            hash.clone(),
            ApiKeyRecord {
                id: id.clone(),
                principal_id: principal_id.into(),
                tenant_id: tenant_id.into(),
                scopes,
                roles,
                active: true,
                created_at: Utc::now(),
                last_used_at: None,
                expires_at: None,
            },
        );
        self.ids.insert(id, hash);
        plaintext
    }

    pub fn revoke(&self, plaintext: &str) {
        if let Some((_, record)) = self.keys.remove(&hash_api_key(plaintext)) {
            self.ids.remove(&record.id);
        }
    }

    /// Lists the active records belonging to `tenant_id`, newest first.
    /// Never returns the plaintext or hash.
    pub fn list_for_tenant(&self, tenant_id: &str) -> Vec<ApiKeyRecord> {
        let mut records: Vec<ApiKeyRecord> = self
            .keys
            .iter()
            .map(|e| e.value().clone())
            .filter(|r| r.tenant_id == tenant_id)
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Revokes by opaque id, scoped to `tenant_id` so one tenant cannot
    /// revoke another's key.
    pub fn revoke_by_id(&self, tenant_id: &str, id: &str) -> Result<(), CoreError> {
        let hash = self
            .ids
            .get(id)
            .map(|h| h.clone())
            .ok_or(CoreError::NotFound)?;
        match self.keys.get(&hash) {
            Some(record) if record.tenant_id == tenant_id => {
                drop(record);
                self.keys.remove(&hash);
                self.ids.remove(id);
                Ok(())
            }
            _ => Err(CoreError::NotFound),
        }
    }
}

impl ApiKeyStore for InMemoryApiKeyStore {
    fn get_by_hash(&self, hash: &str) -> Option<ApiKeyRecord> {
        self.keys.get(hash).map(|r| r.clone())
    }

    fn touch_last_used(&self, hash: &str) {
        if let Some(mut record) = self.keys.get_mut(hash) {
            record.last_used_at = Some(Utc::now());
        }
    }
}

pub fn hash_api_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Resolves bearer credentials into [`AuthPrincipal`]s.
pub struct TenantResolver {
    jwt_secret: String,
    tenants: Arc<dyn TenantStore>,
    api_keys: Arc<dyn ApiKeyStore>,
}

impl TenantResolver {
    pub fn new(
        jwt_secret: impl Into<String>,
        tenants: Arc<dyn TenantStore>,
        api_keys: Arc<dyn ApiKeyStore>,
    ) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            tenants,
            api_keys,
        }
    }

    /// Resolves the `Authorization` header value into a principal.
    ///
    /// Accepts `Bearer <jwt>`, `Bearer <opaque>`, or `ApiKey <opaque>`
    /// (case-insensitive scheme). A JWT is recognized by containing two `.`
    /// separators; anything else is treated as an opaque API key.
    pub fn resolve(&self, authorization: &str) -> Result<AuthPrincipal, CoreError> {
        let credential = CREDENTIAL_RE
            .captures(authorization.trim())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| CoreError::Unauthenticated("malformed Authorization header".into()))?;

        let principal = if credential.matches('.').count() == 2 {
            self.resolve_jwt(credential)?
        } else {
            self.resolve_api_key(credential)?
        };

        let tenant = self
            .tenants
            .get(&principal.tenant_id)
            .ok_or_else(|| CoreError::Unauthenticated("unknown tenant".into()))?;
        if !tenant.active {
            return Err(CoreError::TenantDisabled(tenant.id.clone()));
        }

        Ok(principal)
    }

    fn resolve_jwt(&self, token: &str) -> Result<AuthPrincipal, CoreError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| CoreError::Unauthenticated(format!("invalid token: {e}")))?;

        Ok(AuthPrincipal {
            principal_id: data.claims.sub,
            tenant_id: data.claims.tenant_id,
            kind: PrincipalKind::User,
            scopes: data.claims.scopes.into_iter().collect(),
            roles: data.claims.roles.into_iter().collect(),
        })
    }

    fn resolve_api_key(&self, plaintext: &str) -> Result<AuthPrincipal, CoreError> {
        let hash = hash_api_key(plaintext);
        let record = self
            .api_keys
            .get_by_hash(&hash)
            .ok_or_else(|| CoreError::Unauthenticated("unknown api key".into()))?;

        if !record.active {
            return Err(CoreError::Unauthenticated("api key inactive".into()));
        }
        if let Some(expires_at) = record.expires_at
            && expires_at < Utc::now()
        {
            return Err(CoreError::Unauthenticated("api key expired".into()));
        }

        self.api_keys.touch_last_used(&hash);

        Ok(AuthPrincipal {
            principal_id: record.principal_id,
            tenant_id: record.tenant_id,
            kind: PrincipalKind::ApiKey,
            scopes: record.scopes,
            roles: record.roles,
        })
    }
}

/// Admits iff the principal holds `scope` or wildcard `*`; a
/// thin wrapper so callers read `require_scope(&principal, "x")?` at call
/// sites instead of matching booleans inline.
pub fn require_scope(principal: &AuthPrincipal, scope: &str) -> Result<(), CoreError> {
    if principal.has_scope(scope) {
        Ok(())
    } else {
        Err(CoreError::Unauthorized(format!("missing scope {scope}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn tenants_with(t: Tenant) -> Arc<dyn TenantStore> {
        let store = InMemoryTenantStore::new();
        store.insert(t);
        Arc::new(store)
    }

    fn active_tenant(id: &str) -> Tenant {
        Tenant {
            id: id.to_string(),
            name: "acme".into(),
            active: true,
            enabled_models: Default::default(),
            enabled_tools: Default::default(),
            feature_flags: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn resolves_valid_jwt() {
        let secret = "test-secret";
        let claims = Claims {
            sub: "user-1".into(),
            tenant_id: "t1".into(),
            roles: vec!["admin".into()],
            scopes: vec!["*".into()],
            exp: (Utc::now().timestamp() + 3600) as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let resolver = TenantResolver::new(
            secret,
            tenants_with(active_tenant("t1")),
            Arc::new(InMemoryApiKeyStore::new()),
        );
        let principal = resolver.resolve(&format!("Bearer {token}")).unwrap();
        assert_eq!(principal.tenant_id, "t1");
        assert!(principal.has_scope("anything"));
    }

    #[test]
    fn rejects_expired_jwt() {
        let secret = "test-secret";
        let claims = Claims {
            sub: "user-1".into(),
            tenant_id: "t1".into(),
            roles: vec![],
            scopes: vec![],
            exp: (Utc::now().timestamp() - 10) as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let resolver = TenantResolver::new(
            secret,
            tenants_with(active_tenant("t1")),
            Arc::new(InMemoryApiKeyStore::new()),
        );
        assert!(resolver.resolve(&format!("Bearer {token}")).is_err());
    }

    #[test]
    fn resolves_valid_api_key() {
        let api_keys = InMemoryApiKeyStore::new();
        let plaintext = api_keys.issue(
            "user-2",
            "t1",
            ["conversations:read".to_string()].into_iter().collect(),
            HashSet::new(),
        );
        let resolver = TenantResolver::new(
            "secret",
            tenants_with(active_tenant("t1")),
            Arc::new(api_keys),
        );
        let principal = resolver.resolve(&format!("ApiKey {plaintext}")).unwrap();
        assert_eq!(principal.principal_id, "user-2");
        assert!(principal.has_scope("conversations:read"));
    }

    #[test]
    fn rejects_disabled_tenant() {
        let mut tenant = active_tenant("t1");
        tenant.active = false;
        let api_keys = InMemoryApiKeyStore::new();
        let plaintext = api_keys.issue("user-3", "t1", HashSet::new(), HashSet::new());
        let resolver = TenantResolver::new("secret", tenants_with(tenant), Arc::new(api_keys));
        let err = resolver.resolve(&format!("ApiKey {plaintext}")).unwrap_err();
        assert!(matches!(err, CoreError::TenantDisabled(_)));
    }

    #[test]
    fn rejects_malformed_header() {
        let resolver = TenantResolver::new(
            "secret",
            tenants_with(active_tenant("t1")),
            Arc::new(InMemoryApiKeyStore::new()),
        );
        assert!(resolver.resolve("Basic dXNlcjpwYXNz").is_err());
    }
}
