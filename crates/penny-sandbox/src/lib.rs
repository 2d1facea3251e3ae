//! Executes untrusted tenant-submitted code under a static pre-execution
//! security policy, hard resource caps, and per-session variable
//! persistence.
//!
//! Grounded on `querymt-sandbox`, which wraps the `nono` crate to apply
//! OS-level process jailing (Seatbelt/Landlock) around a coding agent's own
//! shell/file tools running on the operator's machine. That is a different
//! problem from this crate's: running a multi-tenant service's untrusted,
//! model-requested snippets with a policy evaluated *before* the process is
//! ever spawned. This crate keeps `querymt-sandbox`'s naming and
//! `tracing`-based logging conventions but replaces its OS-jailing backend
//! with the policy-classification approach from `mesoclaw`'s
//! `security::policy` plus a subprocess-per-execution model.

pub mod config;
pub mod error;
pub mod policy;
pub mod runner;
pub mod session;

pub use config::SandboxConfig;
pub use error::SandboxError;
pub use policy::{Classification, ScanResult, Violation};
pub use runner::{ExecutionChunk, ExecutionOutcome, SandboxRunner};
pub use session::{SandboxSession, SessionId, SessionStore, spawn_idle_sweeper};
