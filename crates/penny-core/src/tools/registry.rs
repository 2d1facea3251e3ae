//! Tool registry: `name -> ToolDefinition` plus secondary indexes by
//! `category`/`author` and a dependency graph.
//!
//! Generalizes `querymt_agent::tools::registry::ToolRegistry`, which is a
//! flat `HashMap<String, Arc<dyn Tool>>` with no secondary indexing and no
//! dependency tracking — a multi-tenant registry needs both.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::tenant::AuthPrincipal;
use crate::tools::definition::{DefinitionError, ToolDefinition};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidDefinition(#[from] DefinitionError),
    #[error("tool {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("tool {0:?} is not registered")]
    NotRegistered(String),
    #[error("tool {0:?} declares a dependency cycle")]
    DependencyCycle(String),
    #[error("tool {0:?} has dependents {1:?}; unregister with cascade or remove them first")]
    HasDependents(String, Vec<String>),
}

/// Read-mostly tool catalog: protected by a read-biased lock, since reads
/// vastly outnumber the admin-only writes that register or unregister a
/// tool.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, ToolDefinition>,
    by_category: HashMap<String, HashSet<String>>,
    by_author: HashMap<String, HashSet<String>>,
    /// `name -> names that declare `name` as a dependency`.
    dependents: HashMap<String, HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `def`, rejecting schema/name/version violations and
    /// dependency cycles.
    pub fn register(&self, def: ToolDefinition) -> Result<(), RegistryError> {
        def.validate_shape()?;

        let mut inner = self.inner.write().unwrap();
        if inner.by_name.contains_key(&def.name) {
            return Err(RegistryError::AlreadyRegistered(def.name.clone()));
        }

        if would_cycle(&inner.by_name, &def) {
            return Err(RegistryError::DependencyCycle(def.name.clone()));
        }

        for dep in &def.dependencies {
            inner
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(def.name.clone());
        }
        inner
            .by_category
            .entry(def.category.clone())
            .or_default()
            .insert(def.name.clone());
        inner
            .by_author
            .entry(def.author.clone())
            .or_default()
            .insert(def.name.clone());
        inner.by_name.insert(def.name.clone(), def);
        Ok(())
    }

    /// Unregisters `name`. Fails if other tools depend on it unless
    /// `cascade` is set, in which case dependents are unregistered first.
    pub fn unregister(&self, name: &str, cascade: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();
        Self::unregister_locked(&mut inner, name, cascade)
    }

    fn unregister_locked(inner: &mut Inner, name: &str, cascade: bool) -> Result<(), RegistryError> {
        if !inner.by_name.contains_key(name) {
            return Err(RegistryError::NotRegistered(name.to_string()));
        }

        let dependents: Vec<String> = inner
            .dependents
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        if !dependents.is_empty() {
            if !cascade {
                return Err(RegistryError::HasDependents(name.to_string(), dependents));
            }
            for dependent in dependents {
                Self::unregister_locked(inner, &dependent, true)?;
            }
        }

        if let Some(def) = inner.by_name.remove(name) {
            if let Some(set) = inner.by_category.get_mut(&def.category) {
                set.remove(name);
            }
            if let Some(set) = inner.by_author.get_mut(&def.author) {
                set.remove(name);
            }
            for dep in &def.dependencies {
                if let Some(set) = inner.dependents.get_mut(dep) {
                    set.remove(name);
                }
            }
        }
        inner.dependents.remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ToolDefinition> {
        self.inner.read().unwrap().by_name.get(name).cloned()
    }

    pub fn by_category(&self, category: &str) -> Vec<ToolDefinition> {
        let inner = self.inner.read().unwrap();
        inner
            .by_category
            .get(category)
            .into_iter()
            .flatten()
            .filter_map(|name| inner.by_name.get(name).cloned())
            .collect()
    }

    pub fn by_author(&self, author: &str) -> Vec<ToolDefinition> {
        let inner = self.inner.read().unwrap();
        inner
            .by_author
            .get(author)
            .into_iter()
            .flatten()
            .filter_map(|name| inner.by_name.get(name).cloned())
            .collect()
    }

    /// Tools visible to `tenant_id`, subject to the tenant's enabled/disabled
    /// tool set.
    pub fn for_tenant(&self, enabled: impl Fn(&str) -> bool) -> Vec<ToolDefinition> {
        self.inner
            .read()
            .unwrap()
            .by_name
            .values()
            .filter(|def| enabled(&def.name))
            .cloned()
            .collect()
    }

    /// Tools `principal` may invoke, subject to `required_scopes`.
    pub fn for_principal(&self, principal: &AuthPrincipal) -> Vec<ToolDefinition> {
        self.inner
            .read()
            .unwrap()
            .by_name
            .values()
            .filter(|def| {
                def.config
                    .required_scopes
                    .iter()
                    .all(|scope| principal.has_scope(scope))
            })
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().unwrap().by_name.keys().cloned().collect()
    }
}

/// Would registering `def` introduce a cycle in the dependency graph?
/// Depth-first search from each declared dependency back to `def.name`.
fn would_cycle(existing: &HashMap<String, ToolDefinition>, def: &ToolDefinition) -> bool {
    let mut stack: Vec<&str> = def.dependencies.iter().map(|s| s.as_str()).collect();
    let mut visited: HashSet<&str> = HashSet::new();

    while let Some(current) = stack.pop() {
        if current == def.name {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(existing_def) = existing.get(current) {
            stack.extend(existing_def.dependencies.iter().map(|s| s.as_str()));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::PrincipalKind;
    use crate::tools::definition::ToolConfig;
    use std::collections::HashMap;

    fn schema() -> penny_provider::chat::ParametersSchema {
        penny_provider::chat::ParametersSchema {
            schema_type: "object".into(),
            properties: HashMap::new(),
            required: Vec::new(),
        }
    }

    fn def(name: &str, category: &str, author: &str, deps: &[&str]) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            version: "1.0.0".into(),
            category: category.into(),
            author: author.into(),
            parameter_schema: schema(),
            config: ToolConfig::default(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn registers_and_looks_up_by_name() {
        let registry = ToolRegistry::new();
        registry.register(def("python_code", "code", "penny", &[])).unwrap();
        assert!(registry.get("python_code").is_some());
    }

    #[test]
    fn rejects_duplicate_registration() {
        let registry = ToolRegistry::new();
        registry.register(def("python_code", "code", "penny", &[])).unwrap();
        assert!(matches!(
            registry.register(def("python_code", "code", "penny", &[])),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn secondary_indexes_filter_correctly() {
        let registry = ToolRegistry::new();
        registry.register(def("a", "code", "penny", &[])).unwrap();
        registry.register(def("b", "search", "penny", &[])).unwrap();
        assert_eq!(registry.by_category("code").len(), 1);
        assert_eq!(registry.by_author("penny").len(), 2);
    }

    #[test]
    fn unregister_fails_with_live_dependents_unless_cascading() {
        let registry = ToolRegistry::new();
        registry.register(def("base", "code", "penny", &[])).unwrap();
        registry.register(def("derived", "code", "penny", &["base"])).unwrap();

        assert!(matches!(
            registry.unregister("base", false),
            Err(RegistryError::HasDependents(_, _))
        ));
        assert!(registry.unregister("base", true).is_ok());
        assert!(registry.get("derived").is_none());
    }

    #[test]
    fn rejects_dependency_cycles() {
        let registry = ToolRegistry::new();
        registry.register(def("a", "code", "penny", &["b"])).unwrap();
        let result = registry.register(def("b", "code", "penny", &["a"]));
        assert!(matches!(result, Err(RegistryError::DependencyCycle(_))));
    }

    #[test]
    fn for_principal_filters_on_required_scopes() {
        let registry = ToolRegistry::new();
        let mut restricted = def("admin_tool", "admin", "penny", &[]);
        restricted.config.required_scopes = ["admin:write".to_string()].into_iter().collect();
        registry.register(restricted).unwrap();
        registry.register(def("open_tool", "general", "penny", &[])).unwrap();

        let principal = AuthPrincipal {
            principal_id: "p1".into(),
            tenant_id: "t1".into(),
            kind: PrincipalKind::User,
            scopes: HashSet::new(),
            roles: HashSet::new(),
        };
        let visible = registry.for_principal(&principal);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "open_tool");
    }
}
