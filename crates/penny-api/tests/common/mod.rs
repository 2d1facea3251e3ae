//! Shared test harness: wires up the same components `main` does, but with
//! in-memory stores and a [`MockAdapter`] standing in for a real upstream,
//! the way `querymt-worker`'s own integration tests build a
//! `build_worker_config` against a temp SQLite file instead of production
//! infrastructure.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use penny_api::state::AppState;
use penny_core::conversation::InMemoryConversationStore;
use penny_core::processor::{
    InMemoryRoutingPolicyStore, MessageProcessor, MessageProcessorConfig, ProviderCatalog, TracingEventSink,
};
use penny_core::queue::{JobQueue, JobQueueConfig};
use penny_core::rate_limit::{RateLimitSpec, RateLimiter};
use penny_core::resolver::{InMemoryApiKeyStore, InMemoryTenantStore, TenantResolver};
use penny_core::tenant::Tenant;
use penny_core::tools::builtin::{PythonCodeHandler, python_code_definition};
use penny_core::tools::executor::ToolExecutor;
use penny_core::tools::registry::ToolRegistry;
use penny_core::usage::UsageRecorder;
use penny_provider::mock::MockAdapter;
use penny_sandbox::{SandboxConfig, SandboxRunner, SessionStore};

pub const TENANT_A: &str = "tenant-a";
pub const TENANT_B: &str = "tenant-b";

/// A running app plus the handles a test needs to set up fixtures and issue
/// credentials, mirroring `main`'s wiring almost verbatim.
pub struct TestApp {
    pub router: Router,
    pub conversations: Arc<InMemoryConversationStore>,
    pub api_keys: Arc<InMemoryApiKeyStore>,
    pub usage: Arc<UsageRecorder>,
}

/// Builds a fresh app with both [`TENANT_A`] and [`TENANT_B`] seeded active,
/// a `mock-standard` provider, and the `python_code` tool wired through an
/// in-process sandbox using a `true`-stub interpreter (no real Python
/// required to exercise the HTTP surface).
pub fn build_app(chat_rate_limit: RateLimitSpec) -> TestApp {
    let tenants = Arc::new(InMemoryTenantStore::new());
    for id in [TENANT_A, TENANT_B] {
        tenants.insert(Tenant {
            id: id.to_string(),
            name: id.to_string(),
            active: true,
            enabled_models: Default::default(),
            enabled_tools: Default::default(),
            feature_flags: Default::default(),
            created_at: chrono::Utc::now(),
        });
    }

    let api_keys = Arc::new(InMemoryApiKeyStore::new());
    let resolver = Arc::new(TenantResolver::new("test-secret", tenants.clone(), api_keys.clone()));

    let conversations = Arc::new(InMemoryConversationStore::new());
    let conversations_dyn: Arc<dyn penny_core::conversation::ConversationStore> = conversations.clone();

    let providers = Arc::new(ProviderCatalog::new());
    providers.register(Arc::new(MockAdapter::new()));

    let rate_limiter = Arc::new(RateLimiter::new());

    let sandbox_config = SandboxConfig::default();
    let sandbox_sessions = Arc::new(SessionStore::new(&sandbox_config));
    let scratch_root = std::env::temp_dir().join(format!("penny-api-tests-{}", uuid::Uuid::new_v4()));
    let sandbox = Arc::new(
        SandboxRunner::new(sandbox_config, sandbox_sessions.clone(), scratch_root).with_interpreter("true"),
    );

    let tool_registry = Arc::new(ToolRegistry::new());
    tool_registry.register(python_code_definition()).unwrap();

    let tool_executor = Arc::new(
        ToolExecutor::new(tool_registry.clone(), rate_limiter.clone(), 4).with_sandbox(sandbox.clone()),
    );
    tool_executor.register_handler("python_code", Arc::new(PythonCodeHandler::new(sandbox.clone())));

    let usage = Arc::new(UsageRecorder::new());

    let processor_config = MessageProcessorConfig { chat_rate_limit, ..MessageProcessorConfig::default() };
    let processor = Arc::new(MessageProcessor::new(
        conversations_dyn.clone(),
        tenants.clone(),
        providers.clone(),
        Arc::new(InMemoryRoutingPolicyStore::new()),
        tool_registry.clone(),
        tool_executor.clone(),
        rate_limiter.clone(),
        usage.clone(),
        Arc::new(TracingEventSink),
        processor_config,
    ));

    let queue = JobQueue::new(JobQueueConfig {
        // Short interval/job-timeout so the polling tests below don't wait
        // on the production-sized defaults.
        interval: Duration::from_millis(10),
        job_timeout: Duration::from_millis(2_000),
        ..JobQueueConfig::default()
    });
    queue.spawn_workers(processor.clone());

    let state = AppState {
        resolver,
        tenants,
        api_keys: api_keys.clone(),
        conversations: conversations_dyn,
        queue,
        processor,
        tool_executor,
        sandbox,
        sandbox_sessions,
    };

    TestApp {
        router: penny_api::router(state),
        conversations,
        api_keys,
        usage,
    }
}

/// Issues an `ApiKey` credential for `tenant_id` with unrestricted scopes
/// and returns the `Authorization` header value.
pub fn auth_header(api_keys: &InMemoryApiKeyStore, tenant_id: &str, principal_id: &str) -> String {
    let key = api_keys.issue(
        principal_id.to_string(),
        tenant_id.to_string(),
        ["*".to_string()].into_iter().collect(),
        Default::default(),
    );
    format!("ApiKey {key}")
}
