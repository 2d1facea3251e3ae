//! Tenant and auth principal data model.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TenantId = String;
pub type PrincipalId = String;

/// Long-lived tenant identity and settings. Mutated only by the admin
/// path; never owned by a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub active: bool,
    pub enabled_models: HashSet<String>,
    pub enabled_tools: HashSet<String>,
    pub feature_flags: HashSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn model_allowed(&self, model: &str) -> bool {
        self.enabled_models.is_empty() || self.enabled_models.contains(model)
    }

    pub fn tool_allowed(&self, tool: &str) -> bool {
        self.enabled_tools.is_empty() || self.enabled_tools.contains(tool)
    }
}

/// The kind of credential an `AuthPrincipal` was constructed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    ApiKey,
}

/// Authenticated caller identity, constructed per request from a bearer
/// credential and immutable for that request's lifetime.
///
/// Invariant: every downstream call carries a principal whose `tenant_id`
/// equals the target resource's `tenant_id` — callers must never issue a
/// lookup that omits that filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPrincipal {
    pub principal_id: PrincipalId,
    pub tenant_id: TenantId,
    pub kind: PrincipalKind,
    pub scopes: HashSet<String>,
    pub roles: HashSet<String>,
}

impl AuthPrincipal {
    /// Admits iff the principal holds `scope` or the wildcard `*`.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope) || self.scopes.contains("*")
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Guards any resource lookup by this principal's tenant. Resource
    /// queries must always go through this rather than comparing tenant IDs
    /// inline, so the isolation property has one chokepoint.
    pub fn owns(&self, resource_tenant_id: &str) -> bool {
        self.tenant_id == resource_tenant_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> AuthPrincipal {
        AuthPrincipal {
            principal_id: "p1".into(),
            tenant_id: "t1".into(),
            kind: PrincipalKind::User,
            scopes: ["conversations:write".to_string()].into_iter().collect(),
            roles: HashSet::new(),
        }
    }

    #[test]
    fn wildcard_scope_admits_everything() {
        let mut p = principal();
        p.scopes = ["*".to_string()].into_iter().collect();
        assert!(p.has_scope("anything:at:all"));
    }

    #[test]
    fn exact_scope_match_required_without_wildcard() {
        let p = principal();
        assert!(p.has_scope("conversations:write"));
        assert!(!p.has_scope("conversations:delete"));
    }

    #[test]
    fn owns_checks_tenant_equality() {
        let p = principal();
        assert!(p.owns("t1"));
        assert!(!p.owns("t2"));
    }

    #[test]
    fn empty_enabled_models_allows_everything() {
        let tenant = Tenant {
            id: "t1".into(),
            name: "acme".into(),
            active: true,
            enabled_models: HashSet::new(),
            enabled_tools: HashSet::new(),
            feature_flags: HashSet::new(),
            created_at: Utc::now(),
        };
        assert!(tenant.model_allowed("gpt-4o"));
    }
}
