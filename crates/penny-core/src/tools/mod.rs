//! Registers [`ToolDefinition`]s, validates parameters against their
//! schema, and runs handlers with timeout/retry/resource-monitor
//! semantics.
//!
//! Directly generalizes `querymt_agent::tools::registry::ToolRegistry`
//! (a flat `name -> Arc<dyn Tool>` map) to the secondary indexes and
//! dependency graph a multi-tenant registry needs, and generalizes
//! `querymt_agent::middleware::limits::LimitsMiddleware`'s config-driven
//! limit tracking into the executor's per-tool timeout/retry/backoff engine.

pub mod builtin;
pub mod definition;
pub mod executor;
pub mod registry;

pub use builtin::{python_code_definition, PythonCodeHandler};
pub use definition::{RateLimitConfig, ToolConfig, ToolDefinition};
pub use executor::{ToolExecutor, ToolHandler};
pub use registry::ToolRegistry;
