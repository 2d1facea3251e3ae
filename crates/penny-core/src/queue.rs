//! Bounded priority queue, `concurrency`-gated
//! worker pool, retry with exponential backoff, cancellation.
//!
//! Each dequeued job is handed to a short-lived `kameo` actor
//! ([`JobActor`]) the way `querymt-worker` uses `kameo` for actor-style job
//! supervision, scaled down from `querymt-worker`'s sandboxed-subprocess-per-
//! session model (one OS process per session) to in-process async actors —
//! these jobs are short `ExecutionJob`s, not long-lived sessions, so a
//! process per job would be wasteful.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use kameo::Actor;
use kameo::message::{Context, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::tenant::AuthPrincipal;

/// `ExecutionJob` lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// A unit of work pulled off the queue by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub job_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub principal: AuthPrincipal,
    pub status: JobStatus,
    pub attempts: u32,
    pub priority: i32,
    pub payload: Value,
}

impl ExecutionJob {
    pub fn new(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        principal: AuthPrincipal,
        priority: i32,
        payload: Value,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            principal,
            status: JobStatus::Queued,
            attempts: 0,
            priority,
            payload,
        }
    }
}

/// Handles one job to completion. Implemented by `penny-core`'s message
/// processor; kept as a trait so the queue stays independently testable
/// with fakes.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &ExecutionJob, cancel: CancellationToken) -> Result<Value, CoreError>;
}

/// Tuning knobs, sourced from `MAX_CONCURRENCY`, `QUEUE_INTERVAL_MS`,
/// `QUEUE_INTERVAL_CAP`, `DEFAULT_TIMEOUT_MS`, and `MAX_RETRIES` config.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    pub concurrency: usize,
    pub interval: Duration,
    pub interval_cap: u32,
    pub job_timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub shutdown_grace: Duration,
    pub cancel_grace: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            interval: Duration::from_millis(1000),
            interval_cap: 20,
            job_timeout: Duration::from_millis(60_000), // 2 * DEFAULT_TIMEOUT_MS
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Heap entry. Lower `priority` dequeues first; ties break on ascending
/// `sequence` (enqueue order, i.e. FIFO), matching the router's "lower
/// number wins, then declaration order" tie-break convention.
struct HeapEntry {
    priority: i32,
    sequence: u64,
    job: ExecutionJob,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert both fields so lower priority and
        // earlier sequence sort "greater" (popped first).
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded priority queue + worker pool.
pub struct JobQueue {
    config: JobQueueConfig,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    notify: Notify,
    sequence: AtomicU64,
    concurrency: Arc<Semaphore>,
    interval_tokens: Arc<Semaphore>,
    statuses: DashMap<String, JobStatus>,
    results: DashMap<String, Value>,
    errors: DashMap<String, CoreError>,
    cancel_tokens: DashMap<String, CancellationToken>,
    cancelled_while_queued: DashSet<String>,
    shutting_down: CancellationToken,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig) -> Arc<Self> {
        let interval_tokens = Arc::new(Semaphore::new(config.interval_cap as usize));
        let queue = Arc::new(Self {
            concurrency: Arc::new(Semaphore::new(config.concurrency)),
            interval_tokens,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            statuses: DashMap::new(),
            results: DashMap::new(),
            errors: DashMap::new(),
            cancel_tokens: DashMap::new(),
            cancelled_while_queued: DashSet::new(),
            shutting_down: CancellationToken::new(),
            config,
        });
        spawn_interval_refill(queue.clone());
        queue
    }

    /// Admits `job`, rejecting new work once shutdown has begun.
    pub async fn enqueue(&self, job: ExecutionJob) -> Result<String, CoreError> {
        if self.shutting_down.is_cancelled() {
            return Err(CoreError::ServiceUnavailable("queue is shutting down".into()));
        }
        let job_id = job.job_id.clone();
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.statuses.insert(job_id.clone(), JobStatus::Queued);

        let mut heap = self.heap.lock().await;
        heap.push(HeapEntry {
            priority: job.priority,
            sequence,
            job,
        });
        drop(heap);
        self.notify.notify_one();
        Ok(job_id)
    }

    /// Cancels `job_id`: `QUEUED -> CANCELLED` synchronously;
    /// `RUNNING` jobs get a cancellation signal and are expected to stop
    /// within `cancel_grace`.
    pub fn cancel(&self, job_id: &str) -> Result<(), CoreError> {
        match self.statuses.get(job_id).map(|s| *s) {
            None => Err(CoreError::NotFound),
            Some(status) if status.is_terminal() => Ok(()),
            Some(JobStatus::Queued) => {
                self.cancelled_while_queued.insert(job_id.to_string());
                self.statuses.insert(job_id.to_string(), JobStatus::Cancelled);
                Ok(())
            }
            Some(_) => {
                if let Some(token) = self.cancel_tokens.get(job_id) {
                    token.cancel();
                }
                Ok(())
            }
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.statuses.get(job_id).map(|s| *s)
    }

    /// The completed job's return value, if any (set once, on `Completed`).
    /// Non-streaming callers poll `status()` to `Completed` then read this.
    pub fn result(&self, job_id: &str) -> Option<Value> {
        self.results.get(job_id).map(|v| v.clone())
    }

    /// The terminal error of a `Failed` job, if any.
    pub fn error(&self, job_id: &str) -> Option<CoreError> {
        self.errors.get(job_id).map(|e| e.clone())
    }

    async fn dequeue_one(&self) -> Option<ExecutionJob> {
        loop {
            let mut heap = self.heap.lock().await;
            let Some(entry) = heap.pop() else {
                return None;
            };
            drop(heap);

            if self.cancelled_while_queued.remove(&entry.job.job_id).is_some() {
                continue; // tombstoned: cancelled while still queued
            }
            return Some(entry.job);
        }
    }

    /// Spawns `concurrency` worker loops pulling jobs and handing them to
    /// `handler`. Returns the join handles so the caller can await shutdown.
    pub fn spawn_workers(
        self: &Arc<Self>,
        handler: Arc<dyn JobHandler>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.concurrency)
            .map(|worker_id| {
                let queue = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move { queue.worker_loop(worker_id, handler).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, handler: Arc<dyn JobHandler>) {
        loop {
            if self.shutting_down.is_cancelled() {
                return;
            }

            let job = loop {
                if let Some(job) = self.dequeue_one().await {
                    break job;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = self.shutting_down.cancelled() => return,
                }
            };

            // Interval cap: wait for a refill token before actually starting.
            let _interval_permit = match self.interval_tokens.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let _concurrency_permit = match self.concurrency.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            self.run_job(worker_id, job, handler.clone()).await;
        }
    }

    async fn run_job(&self, worker_id: usize, mut job: ExecutionJob, handler: Arc<dyn JobHandler>) {
        let job_id = job.job_id.clone();
        let cancel_token = CancellationToken::new();
        self.cancel_tokens.insert(job_id.clone(), cancel_token.clone());
        self.statuses.insert(job_id.clone(), JobStatus::Running);

        info!(worker_id, job_id = %job_id, "job started");

        loop {
            job.attempts += 1;

            let actor_ref = kameo::actor::spawn(JobActor {
                job: job.clone(),
                handler: handler.clone(),
                cancel: cancel_token.clone(),
            });
            let outcome = tokio::select! {
                reply = actor_ref.ask(RunJob) => match reply {
                    Ok(Ok(value)) => JobOutcome::Success(value),
                    Ok(Err(CoreError::Cancelled)) => JobOutcome::Cancelled,
                    Ok(Err(err)) => JobOutcome::Failure(err),
                    Err(_) => JobOutcome::Failure(CoreError::TemporaryError("job actor unreachable".into())),
                },
                _ = cancel_token.cancelled() => JobOutcome::Cancelled,
            };
            let _ = actor_ref.stop_gracefully().await;

            match outcome {
                JobOutcome::Success(value) => {
                    self.results.insert(job_id.clone(), value);
                    self.statuses.insert(job_id.clone(), JobStatus::Completed);
                    info!(worker_id, job_id = %job_id, attempts = job.attempts, "job completed");
                    break;
                }
                JobOutcome::Cancelled => {
                    self.statuses.insert(job_id.clone(), JobStatus::Cancelled);
                    warn!(worker_id, job_id = %job_id, "job cancelled");
                    break;
                }
                JobOutcome::Failure(err) if job.attempts < self.config.max_retries && err.retryable() => {
                    let delay = backoff_delay(job.attempts, self.config.base_delay);
                    self.statuses.insert(job_id.clone(), JobStatus::Retrying);
                    warn!(worker_id, job_id = %job_id, attempts = job.attempts, error = %err, delay_ms = delay.as_millis() as u64, "job retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel_token.cancelled() => {
                            self.statuses.insert(job_id.clone(), JobStatus::Cancelled);
                            break;
                        }
                    }
                    self.statuses.insert(job_id.clone(), JobStatus::Running);
                }
                JobOutcome::Failure(err) => {
                    self.errors.insert(job_id.clone(), err.clone());
                    self.statuses.insert(job_id.clone(), JobStatus::Failed);
                    warn!(worker_id, job_id = %job_id, attempts = job.attempts, error = %err, "job failed terminally");
                    break;
                }
            }
        }

        self.cancel_tokens.remove(&job_id);
    }

    /// Pauses admission and gives in-flight jobs up to `shutdown_grace` to
    /// drain, then cancels whatever remains.
    pub async fn shutdown(&self) {
        self.shutting_down.cancel();
        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            let still_running = self
                .statuses
                .iter()
                .any(|entry| matches!(*entry.value(), JobStatus::Running | JobStatus::Retrying));
            if !still_running {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = &mut deadline => break,
            }
        }
        for entry in self.cancel_tokens.iter() {
            entry.value().cancel();
        }
    }
}

/// Exponential backoff bounded at 30s:
/// `delay = min(baseDelay * 2^attempt, 30s)`.
fn backoff_delay(attempt: u32, base_delay: Duration) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let millis = base_delay.as_millis() as u64 * factor;
    Duration::from_millis(millis.min(30_000))
}

enum JobOutcome {
    Success(Value),
    Failure(CoreError),
    Cancelled,
}

/// Minimal per-job `kameo` actor. Exists so one job's execution is isolated
/// from the worker loop's own task the way `querymt-worker` isolates session
/// turns inside `SessionActor`, generalized here from one session per OS
/// process to one actor per job.
#[derive(Actor)]
struct JobActor {
    job: ExecutionJob,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
}

struct RunJob;

impl Message<RunJob> for JobActor {
    type Reply = Result<Value, CoreError>;

    async fn handle(&mut self, _msg: RunJob, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.handler.run(&self.job, self.cancel.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn principal() -> AuthPrincipal {
        AuthPrincipal {
            principal_id: "p1".into(),
            tenant_id: "t1".into(),
            kind: crate::tenant::PrincipalKind::User,
            scopes: HashSet::new(),
            roles: HashSet::new(),
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
        fail_until: usize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self, _job: &ExecutionJob, _cancel: CancellationToken) -> Result<Value, CoreError> {
            let attempt = self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if attempt <= self.fail_until {
                Err(CoreError::TemporaryError("not yet".into()))
            } else {
                Ok(Value::Null)
            }
        }
    }

    #[tokio::test]
    async fn enqueue_and_dequeue_respects_priority() {
        let queue = JobQueue::new(JobQueueConfig::default());
        let low = ExecutionJob::new("c1", "m1", principal(), 10, Value::Null);
        let high = ExecutionJob::new("c1", "m2", principal(), 1, Value::Null);
        queue.enqueue(low.clone()).await.unwrap();
        queue.enqueue(high.clone()).await.unwrap();

        let first = queue.dequeue_one().await.unwrap();
        assert_eq!(first.job_id, high.job_id);
        let second = queue.dequeue_one().await.unwrap();
        assert_eq!(second.job_id, low.job_id);
    }

    #[tokio::test]
    async fn fifo_tie_break_on_equal_priority() {
        let queue = JobQueue::new(JobQueueConfig::default());
        let first_job = ExecutionJob::new("c1", "m1", principal(), 5, Value::Null);
        let second_job = ExecutionJob::new("c1", "m2", principal(), 5, Value::Null);
        queue.enqueue(first_job.clone()).await.unwrap();
        queue.enqueue(second_job.clone()).await.unwrap();

        let popped_first = queue.dequeue_one().await.unwrap();
        assert_eq!(popped_first.job_id, first_job.job_id);
    }

    #[tokio::test]
    async fn cancel_queued_job_marks_cancelled_and_skips_on_dequeue() {
        let queue = JobQueue::new(JobQueueConfig::default());
        let job = ExecutionJob::new("c1", "m1", principal(), 1, Value::Null);
        let job_id = queue.enqueue(job).await.unwrap();
        queue.cancel(&job_id).unwrap();

        assert_eq!(queue.status(&job_id), Some(JobStatus::Cancelled));
        assert!(queue.dequeue_one().await.is_none());
    }

    #[tokio::test]
    async fn backoff_delay_is_bounded_at_30s() {
        assert_eq!(backoff_delay(1, Duration::from_millis(1000)), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2, Duration::from_millis(1000)), Duration::from_millis(2000));
        assert_eq!(backoff_delay(20, Duration::from_millis(1000)), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn run_job_retries_then_succeeds() {
        let queue = JobQueue::new(JobQueueConfig {
            base_delay: Duration::from_millis(1),
            ..JobQueueConfig::default()
        });
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_until: 2,
        });
        let job = ExecutionJob::new("c1", "m1", principal(), 1, Value::Null);
        let job_id = job.job_id.clone();
        queue.statuses.insert(job_id.clone(), JobStatus::Queued);

        queue.run_job(0, job, handler.clone()).await;
        assert_eq!(queue.status(&job_id), Some(JobStatus::Completed));
        assert_eq!(handler.calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn completed_job_result_is_retrievable() {
        let queue = JobQueue::new(JobQueueConfig::default());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_until: 0,
        });
        let job = ExecutionJob::new("c1", "m1", principal(), 1, Value::Null);
        let job_id = job.job_id.clone();
        queue.statuses.insert(job_id.clone(), JobStatus::Queued);

        queue.run_job(0, job, handler).await;
        assert_eq!(queue.result(&job_id), Some(Value::Null));
    }

    // Guards the dedup invariant that a cancellation doesn't leak tokens.
    #[tokio::test]
    async fn shutdown_drains_then_cancels_remaining() {
        let queue = JobQueue::new(JobQueueConfig {
            shutdown_grace: Duration::from_millis(50),
            ..JobQueueConfig::default()
        });
        let token = CancellationToken::new();
        queue.cancel_tokens.insert("stuck".into(), token.clone());
        queue.statuses.insert("stuck".into(), JobStatus::Running);
        queue.shutdown().await;
        assert!(token.is_cancelled());
    }
}

fn spawn_interval_refill(queue: Arc<JobQueue>) {
    let interval = queue.config.interval;
    let cap = queue.config.interval_cap as usize;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if queue.shutting_down.is_cancelled() {
                return;
            }
            let available = queue.interval_tokens.available_permits();
            if available < cap {
                queue.interval_tokens.add_permits(cap - available);
            }
        }
    });
}
