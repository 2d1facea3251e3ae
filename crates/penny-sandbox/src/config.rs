use serde::{Deserialize, Serialize};

/// Hard resource caps enforced on every sandboxed execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u32,
    pub max_execution_time_ms: u64,
    pub max_file_size_bytes: u64,
    pub max_files: u32,
    pub session_idle_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_percent: 50,
            max_execution_time_ms: 30_000,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_files: 64,
            session_idle_ms: 1_800_000,
        }
    }
}
