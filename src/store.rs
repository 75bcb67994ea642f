//! Persistence sink contract.
//!
//! The engine never talks to a database directly; it writes run status,
//! time-series metrics and per-request results through the [`RunStore`]
//! trait, which the hosting process implements. [`MemoryStore`] is the
//! in-process implementation used by the test suites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

use crate::types::RunStatus;

/// Names of the time-series metrics the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    Rps,
    LatencyAvg,
    LatencyP50,
    LatencyP75,
    LatencyP90,
    LatencyP95,
    LatencyP99,
    LatencyP999,
    ErrorRate,
    TotalRequests,
    Completed,
    TestDuration,
    SetupOverhead,
    StatusCodes,
    TestsValidating,
    TestsSampled,
    TestsPassed,
    TestsFailed,
    RequestsSent,
    RequestsExpected,
    ConnectionsActive,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Rps => "rps",
            MetricName::LatencyAvg => "latency_avg",
            MetricName::LatencyP50 => "latency_p50",
            MetricName::LatencyP75 => "latency_p75",
            MetricName::LatencyP90 => "latency_p90",
            MetricName::LatencyP95 => "latency_p95",
            MetricName::LatencyP99 => "latency_p99",
            MetricName::LatencyP999 => "latency_p999",
            MetricName::ErrorRate => "error_rate",
            MetricName::TotalRequests => "total_requests",
            MetricName::Completed => "completed",
            MetricName::TestDuration => "test_duration",
            MetricName::SetupOverhead => "setup_overhead",
            MetricName::StatusCodes => "status_codes",
            MetricName::TestsValidating => "tests_validating",
            MetricName::TestsSampled => "tests_sampled",
            MetricName::TestsPassed => "tests_passed",
            MetricName::TestsFailed => "tests_failed",
            MetricName::RequestsSent => "requests_sent",
            MetricName::RequestsExpected => "requests_expected",
            MetricName::ConnectionsActive => "connections_active",
        }
    }
}

/// One time-series sample.
#[derive(Debug, Clone)]
pub struct Metric {
    pub run_id: String,
    pub timestamp_ms: i64,
    pub name: MetricName,
    pub value: f64,
    /// Opaque label payload (JSON); empty when unused.
    pub labels: String,
}

impl Metric {
    pub fn new(run_id: &str, timestamp_ms: i64, name: MetricName, value: f64) -> Self {
        Self {
            run_id: run_id.to_string(),
            timestamp_ms,
            name,
            value,
            labels: String::new(),
        }
    }

    pub fn with_labels(mut self, labels: impl Into<String>) -> Self {
        self.labels = labels.into();
        self
    }
}

/// One persisted per-request record. `status_code` 0 denotes an error.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub run_id: String,
    pub timestamp_ms: i64,
    pub status_code: u16,
    pub latency_ms: f64,
    pub error: String,
    pub trace_data: String,
}

/// Store failures. Transient contention maps to `Busy`, which the
/// terminal-status writer retries with backoff.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store busy")]
    Busy,
    #[error("store write failed: {0}")]
    Write(String),
}

/// Contract the engine requires from the persistence layer. Writes must be
/// idempotent and resilient to concurrent writers.
pub trait RunStore: Send + Sync {
    fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError>;
    fn update_run_end_time(&self, run_id: &str, timestamp_ms: i64) -> Result<(), StoreError>;
    fn add_metric(&self, metric: Metric) -> Result<(), StoreError>;
    fn add_metrics_batch(&self, metrics: Vec<Metric>) -> Result<(), StoreError>;
    fn add_result(&self, result: ResultRow) -> Result<(), StoreError>;
    fn add_results_batch(&self, results: Vec<ResultRow>) -> Result<(), StoreError>;
    /// Configuration registry lookup; returns `default` when the key is
    /// absent. Never fails.
    fn get_config_int(&self, key: &str, default: i64) -> i64;
}

/// Terminal status writes tolerate transient lock contention: bounded
/// exponential backoff, 10ms doubling to a 500ms ceiling.
pub fn update_run_status_with_retry(store: &dyn RunStore, run_id: &str, status: RunStatus) {
    const MAX_ATTEMPTS: u32 = 6;
    let mut backoff = Duration::from_millis(10);

    for attempt in 1..=MAX_ATTEMPTS {
        match store.update_run_status(run_id, status) {
            Ok(()) => return,
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(
                    run_id,
                    status = status.as_str(),
                    attempt,
                    error = %e,
                    "status write failed, retrying"
                );
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(500));
            }
            Err(e) => {
                error!(
                    run_id,
                    status = status.as_str(),
                    error = %e,
                    "giving up on terminal status write"
                );
            }
        }
    }
}

/// In-memory store used by the integration tests.
#[derive(Default)]
pub struct MemoryStore {
    metrics: Mutex<Vec<Metric>>,
    results: Mutex<Vec<ResultRow>>,
    statuses: Mutex<HashMap<String, RunStatus>>,
    end_times: Mutex<HashMap<String, i64>>,
    config: Mutex<HashMap<String, i64>>,
    /// Number of upcoming status writes to reject, for retry testing.
    fail_status_writes: Mutex<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config_int(&self, key: &str, value: i64) {
        self.config.lock().unwrap().insert(key.to_string(), value);
    }

    /// Make the next `n` status writes fail with `Busy`.
    pub fn fail_next_status_writes(&self, n: u32) {
        *self.fail_status_writes.lock().unwrap() = n;
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.statuses.lock().unwrap().get(run_id).copied()
    }

    pub fn end_time(&self, run_id: &str) -> Option<i64> {
        self.end_times.lock().unwrap().get(run_id).copied()
    }

    pub fn metrics(&self, run_id: &str) -> Vec<Metric> {
        self.metrics
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn metrics_named(&self, run_id: &str, name: MetricName) -> Vec<Metric> {
        self.metrics
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.run_id == run_id && m.name == name)
            .cloned()
            .collect()
    }

    pub fn results(&self, run_id: &str) -> Vec<ResultRow> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }
}

impl RunStore for MemoryStore {
    fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        {
            let mut failures = self.fail_status_writes.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Busy);
            }
        }
        self.statuses
            .lock()
            .unwrap()
            .insert(run_id.to_string(), status);
        Ok(())
    }

    fn update_run_end_time(&self, run_id: &str, timestamp_ms: i64) -> Result<(), StoreError> {
        self.end_times
            .lock()
            .unwrap()
            .insert(run_id.to_string(), timestamp_ms);
        Ok(())
    }

    fn add_metric(&self, metric: Metric) -> Result<(), StoreError> {
        self.metrics.lock().unwrap().push(metric);
        Ok(())
    }

    fn add_metrics_batch(&self, mut metrics: Vec<Metric>) -> Result<(), StoreError> {
        self.metrics.lock().unwrap().append(&mut metrics);
        Ok(())
    }

    fn add_result(&self, result: ResultRow) -> Result<(), StoreError> {
        self.results.lock().unwrap().push(result);
        Ok(())
    }

    fn add_results_batch(&self, mut results: Vec<ResultRow>) -> Result<(), StoreError> {
        self.results.lock().unwrap().append(&mut results);
        Ok(())
    }

    fn get_config_int(&self, key: &str, default: i64) -> i64 {
        self.config
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.update_run_status("r1", RunStatus::Running).unwrap();
        assert_eq!(store.status("r1"), Some(RunStatus::Running));

        store
            .add_metric(Metric::new("r1", 1, MetricName::Rps, 100.0))
            .unwrap();
        store
            .add_metrics_batch(vec![
                Metric::new("r1", 2, MetricName::ErrorRate, 0.0),
                Metric::new("r2", 2, MetricName::ErrorRate, 5.0),
            ])
            .unwrap();
        assert_eq!(store.metrics("r1").len(), 2);
        assert_eq!(store.metrics_named("r1", MetricName::Rps).len(), 1);
    }

    #[test]
    fn test_config_registry_defaults() {
        let store = MemoryStore::new();
        assert_eq!(store.get_config_int("statsInterval", 100), 100);
        store.set_config_int("statsInterval", 250);
        assert_eq!(store.get_config_int("statsInterval", 100), 250);
    }

    #[test]
    fn test_status_retry_recovers_from_transient_failures() {
        let store = MemoryStore::new();
        store.fail_next_status_writes(2);
        update_run_status_with_retry(&store, "r1", RunStatus::Completed);
        assert_eq!(store.status("r1"), Some(RunStatus::Completed));
    }

    #[test]
    fn test_status_retry_gives_up_without_panic() {
        let store = MemoryStore::new();
        store.fail_next_status_writes(100);
        update_run_status_with_retry(&store, "r1", RunStatus::Failed);
        assert_eq!(store.status("r1"), None);
    }

    #[test]
    fn test_metric_names_are_stable() {
        assert_eq!(MetricName::LatencyP999.as_str(), "latency_p999");
        assert_eq!(MetricName::StatusCodes.as_str(), "status_codes");
        assert_eq!(MetricName::ConnectionsActive.as_str(), "connections_active");
        assert_eq!(MetricName::TestsValidating.as_str(), "tests_validating");
    }
}
