use thiserror::Error;

/// Failures surfaced by the sandbox runner.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The static security policy rejected the program before it ran.
    #[error("policy violation ({classification:?}): {reason}")]
    PolicyViolation {
        classification: crate::policy::Classification,
        reason: String,
    },
    #[error("session {0} not found or expired")]
    SessionNotFound(String),
    #[error("execution exceeded its time budget")]
    Timeout,
    /// The resource sampler observed memory usage above the configured cap
    /// and killed the process.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),
    /// The resource sampler observed CPU usage above the configured cap
    /// and killed the process.
    #[error("cpu limit exceeded: {0}")]
    CpuLimitExceeded(String),
    #[error("failed to spawn sandbox process: {0}")]
    Spawn(String),
    #[error("failed to (de)serialize session state: {0}")]
    Codec(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Codec(err.to_string())
    }
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::PolicyViolation { .. } => "POLICY_VIOLATION",
            SandboxError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SandboxError::Timeout => "TIMEOUT",
            SandboxError::MemoryLimitExceeded(_) => "MEMORY_LIMIT_EXCEEDED",
            SandboxError::CpuLimitExceeded(_) => "CPU_LIMIT_EXCEEDED",
            SandboxError::Spawn(_) => "SPAWN_FAILED",
            SandboxError::Codec(_) => "CODEC_ERROR",
            SandboxError::Io(_) => "IO_ERROR",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, SandboxError::Timeout | SandboxError::Spawn(_))
    }
}
