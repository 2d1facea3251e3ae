//! Shared application state handed to every axum handler.
//!
//! Mirrors `querymt-service::main`'s `ServerState` (a small `Clone` struct
//! of `Arc`s passed via `.with_state(state)`), widened to the full set of
//! components a request needs to reach.

use std::sync::Arc;

use penny_core::conversation::ConversationStore;
use penny_core::processor::MessageProcessor;
use penny_core::queue::JobQueue;
use penny_core::resolver::{InMemoryApiKeyStore, InMemoryTenantStore, TenantResolver};
use penny_core::tools::ToolExecutor;
use penny_sandbox::{SandboxRunner, SessionStore};

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<TenantResolver>,
    pub tenants: Arc<InMemoryTenantStore>,
    pub api_keys: Arc<InMemoryApiKeyStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub queue: Arc<JobQueue>,
    pub processor: Arc<MessageProcessor>,
    pub tool_executor: Arc<ToolExecutor>,
    pub sandbox: Arc<SandboxRunner>,
    pub sandbox_sessions: Arc<SessionStore>,
}
