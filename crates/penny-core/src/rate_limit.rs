//! Per-`(tenantId, scope)` token-bucket admission control.
//!
//! Each key gets its own `governor` GCRA limiter, sharded in a
//! `dashmap::DashMap` the same way `penny-sandbox`'s `SessionStore` shards
//! sessions by ID. The in-process map is a best-effort fallback: it resets
//! on process restart, which is acceptable for short windows with no
//! persistence guarantee. [`DistributedCounter`] is the seam a real
//! distributed backend would plug into; no implementation ships.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{Quota, RateLimiter as GovernorLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};

use crate::error::CoreError;

/// Admission parameters for one rate-limit key: bucket capacity and refill rate.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSpec {
    pub requests: u32,
    pub window_sec: u32,
    pub burst: Option<u32>,
}

impl RateLimitSpec {
    fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.burst.unwrap_or(self.requests).max(1)).unwrap();
        let per = Duration::from_secs(self.window_sec.max(1) as u64) / self.requests.max(1);
        Quota::with_period(per).unwrap().allow_burst(burst)
    }
}

type Bucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Entry {
    bucket: Bucket,
    window_sec: u32,
    last_used: std::sync::Mutex<Instant>,
}

/// Backend a distributed deployment could swap in so admission decisions are
/// shared across processes instead of being process-local. No implementation
/// is provided in this workspace.
pub trait DistributedCounter: Send + Sync {
    fn try_admit(&self, key: &str, spec: RateLimitSpec) -> Result<bool, CoreError>;
}

/// Sharded, GCRA-backed admission gate keyed by `(tenant_id, scope)`.
/// Optionally backed by a [`DistributedCounter`]; falls back to the
/// in-process map when none is configured.
pub struct RateLimiter {
    buckets: DashMap<String, Entry>,
    distributed: Option<Arc<dyn DistributedCounter>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            distributed: None,
        }
    }

    pub fn with_distributed(distributed: Arc<dyn DistributedCounter>) -> Self {
        Self {
            buckets: DashMap::new(),
            distributed: Some(distributed),
        }
    }

    fn key(tenant_id: &str, scope: &str, principal_id: Option<&str>) -> String {
        match principal_id {
            Some(p) => format!("{tenant_id}:{scope}:{p}"),
            None => format!("{tenant_id}:{scope}"),
        }
    }

    /// Synchronous admission: accept (deduct one token) or reject with
    /// `RATE_LIMIT_EXCEEDED` (retryable by the client, never by the server
    /// itself).
    pub fn admit(
        &self,
        tenant_id: &str,
        scope: &str,
        principal_id: Option<&str>,
        spec: RateLimitSpec,
    ) -> Result<(), CoreError> {
        let key = Self::key(tenant_id, scope, principal_id);

        if let Some(distributed) = &self.distributed {
            return if distributed.try_admit(&key, spec)? {
                Ok(())
            } else {
                Err(CoreError::RateLimitExceeded)
            };
        }

        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Entry {
                bucket: GovernorLimiter::direct(spec.quota()),
                window_sec: spec.window_sec,
                last_used: std::sync::Mutex::new(Instant::now()),
            });

        *entry.last_used.lock().unwrap() = Instant::now();

        if entry.bucket.check().is_ok() {
            Ok(())
        } else {
            Err(CoreError::RateLimitExceeded)
        }
    }

    /// Evicts keys idle past `2 * window_sec`. Intended for a periodic sweep
    /// task.
    pub fn sweep_idle(&self) {
        self.buckets.retain(|_, entry| {
            let idle = entry.last_used.lock().unwrap().elapsed();
            idle <= Duration::from_secs(entry.window_sec as u64 * 2)
        });
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically sweeps idle keys out of `limiter` on `interval`.
pub fn spawn_idle_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            limiter.sweep_idle();
        }
    })
}
