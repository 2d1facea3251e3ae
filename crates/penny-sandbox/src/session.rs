//! Sandbox session state: per-session variables persisted between calls via
//! a serialization file.
//!
//! Grounded on `querymt-sandbox`'s original crate-level doc comment
//! describing session lifecycle, re-purposed from an OS-jailed worker
//! process's lifetime to a logical variable-persistence session the runner
//! restores before, and captures after, each execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

pub type SessionId = String;

/// A reusable isolated execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub variables: std::collections::HashMap<String, Value>,
    pub installed_packages: Vec<String>,
    pub container_handle: Option<String>,
}

impl SandboxSession {
    fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity_at: now,
            variables: std::collections::HashMap::new(),
            installed_packages: Vec::new(),
            container_handle: None,
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// In-memory session store with idle-TTL garbage collection, sharded by
/// session ID via `dashmap` the same way the rate limiter is sharded by
/// `(tenant_id, scope)`.
pub struct SessionStore {
    sessions: DashMap<SessionId, SandboxSession>,
    idle_timeout: Duration,
    last_touched_monotonic: DashMap<SessionId, Instant>,
}

impl SessionStore {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout: Duration::from_millis(config.session_idle_ms),
            last_touched_monotonic: DashMap::new(),
        }
    }

    /// Create a session lazily on first use.
    pub fn create(&self) -> SessionId {
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(id.clone(), SandboxSession::new(id.clone()));
        self.last_touched_monotonic.insert(id.clone(), Instant::now());
        id
    }

    pub fn get(&self, id: &str) -> Result<SandboxSession, SandboxError> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))
    }

    pub fn update<F>(&self, id: &str, f: F) -> Result<(), SandboxError>
    where
        F: FnOnce(&mut SandboxSession),
    {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        f(&mut entry);
        entry.touch();
        self.last_touched_monotonic.insert(id.to_string(), Instant::now());
        Ok(())
    }

    pub fn close(&self, id: &str) -> Result<(), SandboxError> {
        self.sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        self.last_touched_monotonic.remove(id);
        Ok(())
    }

    /// Evict sessions idle past `idle_timeout`. Intended to be called
    /// periodically by a background sweep task.
    pub fn sweep_expired(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .last_touched_monotonic
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > self.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
            self.last_touched_monotonic.remove(id);
        }
        expired
    }

    /// Destroy every session. Called on process shutdown.
    pub fn close_all(&self) {
        self.sessions.clear();
        self.last_touched_monotonic.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Spawns a periodic task that sweeps expired sessions from `store` every
/// `interval`, stopping when the returned handle is dropped.
pub fn spawn_idle_sweeper(store: Arc<SessionStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let expired = store.sweep_expired();
            if !expired.is_empty() {
                tracing::info!(count = expired.len(), "swept idle sandbox sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_round_trips() {
        let store = SessionStore::new(&SandboxConfig::default());
        let id = store.create();
        let session = store.get(&id).unwrap();
        assert_eq!(session.id, id);
        assert!(session.variables.is_empty());
    }

    #[test]
    fn update_persists_variables() {
        let store = SessionStore::new(&SandboxConfig::default());
        let id = store.create();
        store
            .update(&id, |s| {
                s.variables.insert("x".into(), serde_json::json!(42));
            })
            .unwrap();
        let session = store.get(&id).unwrap();
        assert_eq!(session.variables["x"], serde_json::json!(42));
    }

    #[test]
    fn close_removes_session() {
        let store = SessionStore::new(&SandboxConfig::default());
        let id = store.create();
        store.close(&id).unwrap();
        assert!(matches!(store.get(&id), Err(SandboxError::SessionNotFound(_))));
    }

    #[test]
    fn get_unknown_session_errors() {
        let store = SessionStore::new(&SandboxConfig::default());
        assert!(matches!(
            store.get("nonexistent"),
            Err(SandboxError::SessionNotFound(_))
        ));
    }
}
