//! Append-only `UsageRecord`s plus in-memory per-tenant-per-day rolling
//! counters.
//!
//! Generalizes `querymt_agent::middleware::limits::LimitsMiddleware`'s
//! single-conversation running total (`LimitsMiddleware::total_cost`, built
//! from `ModelPricing::calculate_cost`) into a multi-tenant, multi-day
//! aggregate. A recording failure never fails the caller's request —
//! `record()` logs and swallows instead of returning `Result`.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What a [`UsageRecord`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TokensIn,
    TokensOut,
    Requests,
    LatencyMs,
    ToolExecution,
    Cost,
}

/// One append-only usage event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: String,
    pub metric: Metric,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl UsageRecord {
    pub fn new(tenant_id: impl Into<String>, metric: Metric, value: f64, unit: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            metric,
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Per-tenant-per-day rolling totals exposed to admin queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyTotals {
    pub tokens_in: f64,
    pub tokens_out: f64,
    pub requests: f64,
    pub latency_ms_sum: f64,
    pub tool_executions: f64,
    pub cost: f64,
}

impl DailyTotals {
    fn apply(&mut self, metric: Metric, value: f64) {
        match metric {
            Metric::TokensIn => self.tokens_in += value,
            Metric::TokensOut => self.tokens_out += value,
            Metric::Requests => self.requests += value,
            Metric::LatencyMs => self.latency_ms_sum += value,
            Metric::ToolExecution => self.tool_executions += value,
            Metric::Cost => self.cost += value,
        }
    }
}

/// A cross-process counter a distributed deployment could plug in so daily
/// totals are shared instead of process-local (mirrors
/// [`crate::rate_limit::DistributedCounter`]'s seam). No implementation ships
/// in this workspace.
pub trait DistributedUsageStore: Send + Sync {
    fn record(&self, tenant_id: &str, day: NaiveDate, metric: Metric, value: f64);
}

/// Append-only usage log plus rolling `(tenant_id, day)` aggregates.
pub struct UsageRecorder {
    totals: DashMap<(String, NaiveDate), DailyTotals>,
    log: DashMap<String, Vec<UsageRecord>>,
    distributed: Option<Arc<dyn DistributedUsageStore>>,
}

impl UsageRecorder {
    pub fn new() -> Self {
        Self {
            totals: DashMap::new(),
            log: DashMap::new(),
            distributed: None,
        }
    }

    pub fn with_distributed(distributed: Arc<dyn DistributedUsageStore>) -> Self {
        Self {
            totals: DashMap::new(),
            log: DashMap::new(),
            distributed: Some(distributed),
        }
    }

    /// Records `record`, updating the tenant's rolling daily counters.
    /// Best-effort: never returns an error, as no caller should have its
    /// request fail because usage accounting hiccupped.
    pub fn record(&self, record: UsageRecord) {
        let day = record.timestamp.date_naive();
        let tenant_id = record.tenant_id.clone();

        self.totals
            .entry((tenant_id.clone(), day))
            .or_default()
            .apply(record.metric, record.value);

        if let Some(distributed) = &self.distributed {
            distributed.record(&tenant_id, day, record.metric, record.value);
        }

        self.log.entry(tenant_id).or_default().push(record);
    }

    /// Convenience for the message processor's end-of-turn accounting:
    /// records prompt tokens, completion tokens, cost and latency in one call.
    pub fn record_completion(
        &self,
        tenant_id: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        cost_usd: f64,
        latency_ms: u64,
    ) {
        self.record(UsageRecord::new(tenant_id, Metric::TokensIn, prompt_tokens as f64, "tokens"));
        self.record(UsageRecord::new(tenant_id, Metric::TokensOut, completion_tokens as f64, "tokens"));
        self.record(UsageRecord::new(tenant_id, Metric::Cost, cost_usd, "usd"));
        self.record(UsageRecord::new(tenant_id, Metric::LatencyMs, latency_ms as f64, "ms"));
        self.record(UsageRecord::new(tenant_id, Metric::Requests, 1.0, "count"));
    }

    /// Same as [`Self::record`] but logs instead of panicking if called from
    /// a context that can't propagate failures — used where the caller has
    /// already left the request's critical path (e.g. a `tokio::spawn`ed
    /// fire-and-forget task).
    pub fn record_best_effort(&self, record: UsageRecord) {
        let tenant_id = record.tenant_id.clone();
        let metric = record.metric;
        self.record(record);
        warn_if_unbounded(&tenant_id, metric);
    }

    pub fn daily_totals(&self, tenant_id: &str, day: NaiveDate) -> DailyTotals {
        self.totals
            .get(&(tenant_id.to_string(), day))
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn records_for_tenant(&self, tenant_id: &str) -> Vec<UsageRecord> {
        self.log.get(tenant_id).map(|v| v.clone()).unwrap_or_default()
    }
}

impl Default for UsageRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// No-op hook point; kept distinct from `record()` itself so a future
/// anomaly-detection pass (e.g. flagging a tenant whose per-day log grows
/// unbounded) has a single call site to extend.
fn warn_if_unbounded(_tenant_id: &str, _metric: Metric) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_same_day_same_tenant() {
        let recorder = UsageRecorder::new();
        recorder.record(UsageRecord::new("t1", Metric::TokensIn, 100.0, "tokens"));
        recorder.record(UsageRecord::new("t1", Metric::TokensIn, 50.0, "tokens"));

        let today = Utc::now().date_naive();
        assert_eq!(recorder.daily_totals("t1", today).tokens_in, 150.0);
    }

    #[test]
    fn distinct_tenants_do_not_share_totals() {
        let recorder = UsageRecorder::new();
        recorder.record(UsageRecord::new("t1", Metric::Cost, 1.0, "usd"));
        recorder.record(UsageRecord::new("t2", Metric::Cost, 5.0, "usd"));

        let today = Utc::now().date_naive();
        assert_eq!(recorder.daily_totals("t1", today).cost, 1.0);
        assert_eq!(recorder.daily_totals("t2", today).cost, 5.0);
    }

    #[test]
    fn record_completion_updates_all_five_counters() {
        let recorder = UsageRecorder::new();
        recorder.record_completion("t1", 10, 20, 0.002, 150);

        let today = Utc::now().date_naive();
        let totals = recorder.daily_totals("t1", today);
        assert_eq!(totals.tokens_in, 10.0);
        assert_eq!(totals.tokens_out, 20.0);
        assert_eq!(totals.cost, 0.002);
        assert_eq!(totals.latency_ms_sum, 150.0);
        assert_eq!(totals.requests, 1.0);
    }

    #[test]
    fn log_retains_insertion_order() {
        let recorder = UsageRecorder::new();
        recorder.record(UsageRecord::new("t1", Metric::Requests, 1.0, "count"));
        recorder.record(UsageRecord::new("t1", Metric::Requests, 1.0, "count"));
        assert_eq!(recorder.records_for_tenant("t1").len(), 2);
    }
}
