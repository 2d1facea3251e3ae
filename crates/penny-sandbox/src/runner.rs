//! Execution engine: runs a program inside a subprocess with
//! hard resource caps, after the static security policy has cleared it.
//!
//! Grounded on `querymt-sandbox`'s `apply()`/`is_supported()` pattern of
//! "build a policy object, then irreversibly commit to it" — here the
//! static policy gate happens pre-spawn instead of as an OS jail, and the
//! resource caps are enforced by sampling the child process with `sysinfo`
//! rather than by a kernel capability set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::policy::{self, Classification};
use crate::session::{SessionId, SessionStore};

/// One chunk of a streaming execution.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionChunk {
    Stdout { text: String },
    Stderr { text: String },
    Plot { path: String },
    Variable { name: String, value: Value },
    Done { exit_code: i32, duration_ms: u64 },
    Error { code: String, message: String },
}

/// The non-streamed result of one execution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionOutcome {
    pub session_id: SessionId,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub variables: std::collections::HashMap<String, Value>,
    pub plot_files: Vec<String>,
    pub highest_classification: Classification,
}

/// Runs untrusted programs under the caps in [`SandboxConfig`], scoped to
/// sessions held in a [`SessionStore`].
pub struct SandboxRunner {
    config: SandboxConfig,
    sessions: Arc<SessionStore>,
    scratch_root: PathBuf,
    interpreter: String,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig, sessions: Arc<SessionStore>, scratch_root: PathBuf) -> Self {
        Self {
            config,
            sessions,
            scratch_root,
            interpreter: "python3".to_string(),
        }
    }

    /// Override the interpreter binary (tests use a stub shell command).
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    fn check_policy(code: &str) -> Result<Classification, SandboxError> {
        let scan = policy::scan(code);
        if !scan.is_admissible() {
            let worst = scan
                .violations
                .iter()
                .max_by_key(|v| v.classification)
                .expect("non-empty violations");
            return Err(SandboxError::PolicyViolation {
                classification: worst.classification,
                reason: worst.reason.clone(),
            });
        }
        Ok(scan.highest().unwrap_or(Classification::Low))
    }

    /// Run `code` to completion, returning the whole captured output.
    ///
    /// If `session_id` is `None` a new session is created lazily. A policy
    /// rejection never mutates session state.
    pub async fn execute(
        &self,
        session_id: Option<&str>,
        code: &str,
        allow_network: bool,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let classification = Self::check_policy(code)?;

        let session_id = match session_id {
            Some(id) => {
                self.sessions.get(id)?;
                id.to_string()
            }
            None => self.sessions.create(),
        };

        let session = self.sessions.get(&session_id)?;
        let scratch_dir = self.scratch_root.join(&session_id);
        tokio::fs::create_dir_all(&scratch_dir).await?;

        let state_in = scratch_dir.join("state_in.json");
        let state_out = scratch_dir.join("state_out.json");
        tokio::fs::write(&state_in, serde_json::to_vec(&session.variables)?).await?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-c")
            .arg(code)
            .current_dir(&scratch_dir)
            .env("SANDBOX_STATE_IN", &state_in)
            .env("SANDBOX_STATE_OUT", &state_out)
            .env("SANDBOX_ALLOW_NETWORK", allow_network.to_string())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let started = tokio::time::Instant::now();
        let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let pid = child.id();

        let resource_kill: Arc<std::sync::Mutex<Option<ResourceKill>>> = Arc::new(std::sync::Mutex::new(None));
        let monitor = pid.map(|pid| {
            let limit_mb = self.config.max_memory_mb;
            let limit_cpu = self.config.max_cpu_percent as f32;
            let killed = resource_kill.clone();
            tokio::spawn(async move { monitor_resources(pid, limit_mb, limit_cpu, killed).await })
        });

        let timeout = Duration::from_millis(self.config.max_execution_time_ms);
        let wait_result = tokio::time::timeout(timeout, child.wait_with_output()).await;

        if let Some(handle) = monitor {
            handle.abort();
        }

        let output = match wait_result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(SandboxError::Io(e)),
            Err(_) => return Err(SandboxError::Timeout),
        };

        if let Some(kill) = resource_kill.lock().expect("monitor mutex poisoned").take() {
            return Err(kill.into_error());
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout = cap_output(&output.stdout, self.config.max_file_size_bytes);
        let stderr = cap_output(&output.stderr, self.config.max_file_size_bytes);

        let variables = match tokio::fs::read(&state_out).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => session.variables.clone(),
        };

        self.sessions.update(&session_id, |s| {
            s.variables = variables.clone();
        })?;

        let plot_files = list_plot_files(&scratch_dir, self.config.max_files).await;

        Ok(ExecutionOutcome {
            session_id,
            stdout,
            stderr,
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms,
            variables,
            plot_files,
            highest_classification: classification,
        })
    }

    /// Streaming variant: emits chunks as stdout/stderr lines arrive, then
    /// exactly one `Done` or `Error` terminal chunk.
    pub async fn execute_stream(
        &self,
        session_id: Option<&str>,
        code: &str,
        allow_network: bool,
    ) -> Result<mpsc::Receiver<ExecutionChunk>, SandboxError> {
        let classification = Self::check_policy(code)?;

        let session_id = match session_id {
            Some(id) => {
                self.sessions.get(id)?;
                id.to_string()
            }
            None => self.sessions.create(),
        };
        let session = self.sessions.get(&session_id)?;
        let scratch_dir = self.scratch_root.join(&session_id);
        tokio::fs::create_dir_all(&scratch_dir).await?;
        let state_in = scratch_dir.join("state_in.json");
        let state_out = scratch_dir.join("state_out.json");
        tokio::fs::write(&state_in, serde_json::to_vec(&session.variables)?).await?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-c")
            .arg(code)
            .current_dir(&scratch_dir)
            .env("SANDBOX_STATE_IN", &state_in)
            .env("SANDBOX_STATE_OUT", &state_out)
            .env("SANDBOX_ALLOW_NETWORK", allow_network.to_string())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let pid = child.id();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (tx, rx) = mpsc::channel(256);
        let timeout = Duration::from_millis(self.config.max_execution_time_ms);
        let sessions = self.sessions.clone();
        let scratch_for_task = scratch_dir.clone();
        let max_files = self.config.max_files;

        let resource_kill: Arc<std::sync::Mutex<Option<ResourceKill>>> = Arc::new(std::sync::Mutex::new(None));
        let monitor = pid.map(|pid| {
            let limit_mb = self.config.max_memory_mb;
            let limit_cpu = self.config.max_cpu_percent as f32;
            let killed = resource_kill.clone();
            tokio::spawn(async move { monitor_resources(pid, limit_mb, limit_cpu, killed).await })
        });

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let tx_out = tx.clone();
            let out_task = tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx_out.send(ExecutionChunk::Stdout { text: line }).await;
                }
            });
            let tx_err = tx.clone();
            let err_task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx_err.send(ExecutionChunk::Stderr { text: line }).await;
                }
            });

            let wait_result = tokio::time::timeout(timeout, child.wait()).await;
            if let Some(handle) = monitor {
                handle.abort();
            }
            let _ = out_task.await;
            let _ = err_task.await;

            let kill = resource_kill.lock().expect("monitor mutex poisoned").take();

            match (wait_result, kill) {
                (_, Some(kill)) => {
                    let err = kill.into_error();
                    let _ = tx
                        .send(ExecutionChunk::Error {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        })
                        .await;
                }
                (Ok(Ok(status)), None) => {
                    let variables: std::collections::HashMap<String, Value> =
                        tokio::fs::read(&state_out)
                            .await
                            .ok()
                            .and_then(|b| serde_json::from_slice(&b).ok())
                            .unwrap_or_default();
                    let _ = sessions.update(&session_id, |s| {
                        s.variables = variables.clone();
                    });
                    for (name, value) in &variables {
                        let _ = tx
                            .send(ExecutionChunk::Variable {
                                name: name.clone(),
                                value: value.clone(),
                            })
                            .await;
                    }
                    for path in list_plot_files(&scratch_for_task, max_files).await {
                        let _ = tx.send(ExecutionChunk::Plot { path }).await;
                    }
                    let _ = tx
                        .send(ExecutionChunk::Done {
                            exit_code: status.code().unwrap_or(-1),
                            duration_ms: started.elapsed().as_millis() as u64,
                        })
                        .await;
                }
                (Ok(Err(e)), None) => {
                    let _ = tx
                        .send(ExecutionChunk::Error {
                            code: "IO_ERROR".into(),
                            message: e.to_string(),
                        })
                        .await;
                }
                (Err(_), None) => {
                    let _ = tx
                        .send(ExecutionChunk::Error {
                            code: "TIMEOUT".into(),
                            message: "execution exceeded its time budget".into(),
                        })
                        .await;
                }
            }
        });

        tracing::debug!(session_id = %session_id, ?classification, "started streaming sandbox execution");
        Ok(rx)
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }
}

/// Which cap a [`monitor_resources`] task killed the process for, handed
/// back to `execute`/`execute_stream` so they can distinguish a resource
/// kill from a normal exit instead of reporting `Ok` regardless.
#[derive(Debug, Clone, Copy)]
enum ResourceKill {
    Memory { mem_mb: u64, limit_mb: u64 },
    Cpu { cpu_percent: f32, limit_percent: f32 },
}

impl ResourceKill {
    fn into_error(self) -> SandboxError {
        match self {
            ResourceKill::Memory { mem_mb, limit_mb } => {
                SandboxError::MemoryLimitExceeded(format!("memory usage {mem_mb}MB exceeded cap {limit_mb}MB"))
            }
            ResourceKill::Cpu { cpu_percent, limit_percent } => SandboxError::CpuLimitExceeded(format!(
                "cpu usage {cpu_percent:.1}% exceeded cap {limit_percent:.1}%"
            )),
        }
    }
}

async fn monitor_resources(
    pid: u32,
    limit_mb: u64,
    limit_cpu_percent: f32,
    killed: Arc<std::sync::Mutex<Option<ResourceKill>>>,
) {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        ticker.tick().await;
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let Some(process) = system.process(pid) else {
            return;
        };
        let mem_mb = process.memory() / 1024 / 1024;
        if mem_mb > limit_mb {
            tracing::warn!(pid = pid.as_u32(), mem_mb, limit_mb, "killing sandboxed process over memory cap");
            *killed.lock().expect("monitor mutex poisoned") = Some(ResourceKill::Memory { mem_mb, limit_mb });
            process.kill();
            return;
        }
        if process.cpu_usage() > limit_cpu_percent {
            tracing::warn!(
                pid = pid.as_u32(),
                cpu = process.cpu_usage(),
                limit_cpu_percent,
                "killing sandboxed process over cpu cap"
            );
            *killed.lock().expect("monitor mutex poisoned") = Some(ResourceKill::Cpu {
                cpu_percent: process.cpu_usage(),
                limit_percent: limit_cpu_percent,
            });
            process.kill();
            return;
        }
    }
}

fn cap_output(bytes: &[u8], max_bytes: u64) -> String {
    let truncated = &bytes[..bytes.len().min(max_bytes as usize)];
    String::from_utf8_lossy(truncated).into_owned()
}

/// Enumerates plot files the executed code left behind, stopping once
/// `max_files` are found rather than returning an unbounded directory scan.
async fn list_plot_files(scratch_dir: &std::path::Path, max_files: u32) -> Vec<String> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(scratch_dir).await else {
        return out;
    };
    while out.len() < max_files as usize {
        let Ok(Some(entry)) = entries.next_entry().await else {
            break;
        };
        let path = entry.path();
        if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("png") | Some("svg") | Some("jpg")
        ) {
            out.push(path.display().to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;

    fn test_runner() -> (SandboxRunner, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(&SandboxConfig::default()));
        let runner = SandboxRunner::new(SandboxConfig::default(), sessions, dir.path().to_path_buf())
            .with_interpreter("true");
        (runner, dir)
    }

    #[tokio::test]
    async fn policy_violation_blocks_execution_without_touching_sessions() {
        let (runner, _dir) = test_runner();
        let result = runner.execute(None, "import os\nos.system('rm -rf /')", false).await;
        assert!(matches!(result, Err(SandboxError::PolicyViolation { .. })));
        assert!(runner.sessions().is_empty());
    }

    #[tokio::test]
    async fn admissible_code_creates_and_persists_a_session() {
        let (runner, _dir) = test_runner();
        let outcome = runner.execute(None, "x = 1", false).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(runner.sessions().get(&outcome.session_id).is_ok());
    }

    #[test]
    fn resource_kill_maps_to_the_matching_limit_error() {
        let mem = ResourceKill::Memory { mem_mb: 900, limit_mb: 512 }.into_error();
        assert!(matches!(mem, SandboxError::MemoryLimitExceeded(_)));
        assert_eq!(mem.code(), "MEMORY_LIMIT_EXCEEDED");

        let cpu = ResourceKill::Cpu { cpu_percent: 97.0, limit_percent: 80.0 }.into_error();
        assert!(matches!(cpu, SandboxError::CpuLimitExceeded(_)));
        assert_eq!(cpu.code(), "CPU_LIMIT_EXCEEDED");
    }
}
