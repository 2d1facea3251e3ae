//! The per-tenant AI request execution core: tenant resolution, model
//! routing, rate limiting, tool registration/execution, message processing,
//! usage accounting and the job queue that drives it all.
//!
//! # Layout
//!
//! - [`tenant`] — `Tenant`/`AuthPrincipal`.
//! - [`resolver`] — Tenant Context Resolver: authenticates a request and
//!   resolves it to a tenant-scoped principal.
//! - [`router`] — Model Router: picks a provider+model for a request.
//! - [`rate_limit`] — Rate Limiter / Quota Gate.
//! - [`tools`] — Tool Registry + Executor.
//! - [`conversation`] — Conversation/Message/Artifact store.
//! - [`processor`] — Message Processor: the orchestrator tying routing,
//!   completion, the tool loop, and usage accounting together for one
//!   execution job.
//! - [`usage`] — Usage Recorder.
//! - [`queue`] — Job Queue + Worker Pool.
//! - [`error`] — shared error taxonomy and redaction helper.
//!
//! `penny-provider` (the completion/streaming adapter layer) and
//! `penny-sandbox` (isolated code execution) are separate crates this one
//! depends on; everything else in the request's data flow — resolve tenant,
//! enqueue, route, complete, call tools, record usage — is wired up here.

pub mod conversation;
pub mod error;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod resolver;
pub mod router;
pub mod tenant;
pub mod tools;
pub mod usage;

pub use error::CoreError;
pub use tenant::{AuthPrincipal, PrincipalKind, Tenant, TenantId};
