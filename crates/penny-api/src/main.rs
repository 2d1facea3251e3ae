use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use penny_api::state::AppState;
use penny_core::conversation::InMemoryConversationStore;
use penny_core::processor::{
    InMemoryRoutingPolicyStore, MessageProcessor, MessageProcessorConfig, ProviderCatalog, TracingEventSink,
};
use penny_core::queue::{JobQueue, JobQueueConfig};
use penny_core::rate_limit::{self, RateLimiter};
use penny_core::resolver::{InMemoryApiKeyStore, InMemoryTenantStore, TenantResolver};
use penny_core::tenant::Tenant;
use penny_core::tools::builtin::{PythonCodeHandler, python_code_definition};
use penny_core::tools::executor::ToolExecutor;
use penny_core::tools::registry::ToolRegistry;
use penny_core::usage::UsageRecorder;
use penny_provider::mock::MockAdapter;
use penny_sandbox::{SandboxConfig, SandboxRunner, SessionStore};

/// Process configuration, one flag/env var per tunable: JWT secret, default
/// model, queue concurrency, sandbox resource caps. Follows the
/// `clap::Parser` + `#[arg(long, env)]` pattern used in `querymt-service`.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, env = "PENNY_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,

    #[arg(long, env = "JWT_SECRET", default_value = "dev-secret-change-me")]
    jwt_secret: String,
    /// Accepted for config parity with the rest of the JWT settings;
    /// refresh-token issuance is out of scope for this crate.
    #[arg(long, env = "JWT_REFRESH_SECRET", default_value = "dev-refresh-secret-change-me")]
    #[allow(dead_code)]
    jwt_refresh_secret: String,
    #[arg(long, env = "JWT_EXPIRY", default_value = "15m")]
    #[allow(dead_code)]
    jwt_expiry: String,
    #[arg(long, env = "JWT_REFRESH_EXPIRY", default_value = "7d")]
    #[allow(dead_code)]
    jwt_refresh_expiry: String,

    #[arg(long, env = "DEFAULT_MODEL", default_value = "mock-standard")]
    default_model: String,
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 10)]
    max_concurrency: usize,
    #[arg(long, env = "QUEUE_INTERVAL_MS", default_value_t = 1000)]
    queue_interval_ms: u64,
    #[arg(long, env = "QUEUE_INTERVAL_CAP", default_value_t = 20)]
    queue_interval_cap: u32,
    #[arg(long, env = "DEFAULT_TIMEOUT_MS", default_value_t = 30_000)]
    default_timeout_ms: u64,
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    #[arg(long, env = "MAX_MEMORY_MB", default_value_t = 512)]
    max_memory_mb: u64,
    #[arg(long, env = "MAX_CPU_PERCENT", default_value_t = 50)]
    max_cpu_percent: u32,
    #[arg(long, env = "MAX_EXECUTION_MS", default_value_t = 30_000)]
    max_execution_ms: u64,
    #[arg(long, env = "SESSION_IDLE_MS", default_value_t = 1_800_000)]
    session_idle_ms: u64,
    #[arg(long, env = "SANDBOX_SCRATCH_DIR")]
    sandbox_scratch_dir: Option<PathBuf>,

    #[arg(long, env = "AUDIT_LOGGING_ENABLED", default_value_t = true)]
    #[allow(dead_code)]
    audit_logging_enabled: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("penny_api=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    info!(addr = %args.addr, default_model = %args.default_model, "starting penny-api");

    // Dev/test seed data: one active tenant with unrestricted models/tools,
    // matching the crate's own test suites' convention rather than reading
    // from a persistence layer this crate doesn't implement.
    let tenants = Arc::new(InMemoryTenantStore::new());
    tenants.insert(Tenant {
        id: "default".to_string(),
        name: "default tenant".to_string(),
        active: true,
        enabled_models: Default::default(),
        enabled_tools: Default::default(),
        feature_flags: Default::default(),
        created_at: chrono::Utc::now(),
    });

    let api_keys = Arc::new(InMemoryApiKeyStore::new());
    let resolver = Arc::new(TenantResolver::new(args.jwt_secret.clone(), tenants.clone(), api_keys.clone()));

    let conversations: Arc<dyn penny_core::conversation::ConversationStore> = Arc::new(InMemoryConversationStore::new());

    let providers = Arc::new(ProviderCatalog::new());
    providers.register(Arc::new(MockAdapter::new()));

    let rate_limiter = Arc::new(RateLimiter::new());
    rate_limit::spawn_idle_sweeper(rate_limiter.clone(), Duration::from_secs(60));

    let sandbox_config = SandboxConfig {
        max_memory_mb: args.max_memory_mb,
        max_cpu_percent: args.max_cpu_percent,
        max_execution_time_ms: args.max_execution_ms,
        session_idle_ms: args.session_idle_ms,
        ..SandboxConfig::default()
    };
    let sandbox_sessions = Arc::new(SessionStore::new(&sandbox_config));
    penny_sandbox::spawn_idle_sweeper(sandbox_sessions.clone(), Duration::from_secs(60));
    let scratch_root = args.sandbox_scratch_dir.unwrap_or_else(std::env::temp_dir);
    let sandbox = Arc::new(SandboxRunner::new(sandbox_config, sandbox_sessions.clone(), scratch_root));

    let tool_registry = Arc::new(ToolRegistry::new());
    tool_registry.register(python_code_definition())?;

    let tool_executor = Arc::new(
        ToolExecutor::new(tool_registry.clone(), rate_limiter.clone(), args.max_concurrency)
            .with_sandbox(sandbox.clone()),
    );
    tool_executor.register_handler("python_code", Arc::new(PythonCodeHandler::new(sandbox.clone())));

    let usage = Arc::new(UsageRecorder::new());

    let processor_config = MessageProcessorConfig {
        default_model: args.default_model.clone(),
        ..MessageProcessorConfig::default()
    };
    let processor = Arc::new(MessageProcessor::new(
        conversations.clone(),
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
        concurrency: args.max_concurrency,
        interval: Duration::from_millis(args.queue_interval_ms),
        interval_cap: args.queue_interval_cap,
        job_timeout: Duration::from_millis(args.default_timeout_ms * 2),
        max_retries: args.max_retries,
        ..JobQueueConfig::default()
    });
    queue.spawn_workers(processor.clone());

    let state = AppState {
        resolver,
        tenants,
        api_keys,
        conversations,
        queue,
        processor,
        tool_executor,
        sandbox,
        sandbox_sessions,
    };

    let app = penny_api::router(state);

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
