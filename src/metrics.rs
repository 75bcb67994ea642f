//! High-performance in-memory metrics collection.
//!
//! Lock-free counters give real-time aggregate stats while the worker
//! callbacks are firing at full rate; bounded vectors behind short-lived
//! mutexes keep the raw material for post-run analysis. Every buffer is
//! capped so a pathological target (100% error rate for a minute) cannot
//! OOM the process. Individual results are held in memory during the test
//! and batch-written to the store after completion.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::MetricsCollectorConfig;
use crate::store::{ResultRow, RunStore, StoreError};
use crate::types::{ErrorKind, Response};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Record for a single request result, lighter than a store row.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub timestamp_ms: i64,
    /// 0 denotes an error rather than an HTTP status.
    pub status_code: u16,
    pub latency_ms: f64,
    pub error_kind: ErrorKind,
    pub error_message: String,
    /// Opaque payload, typically a JSON timing breakdown or error detail.
    pub trace_data: String,
}

impl ResultRecord {
    pub fn success(timestamp_ms: i64, status_code: u16, latency_ms: f64) -> Self {
        Self {
            timestamp_ms,
            status_code,
            latency_ms,
            error_kind: ErrorKind::None,
            error_message: String::new(),
            trace_data: String::new(),
        }
    }

    pub fn error(timestamp_ms: i64, kind: ErrorKind, message: String) -> Self {
        Self {
            timestamp_ms,
            status_code: 0,
            latency_ms: 0.0,
            error_kind: kind,
            error_message: message,
            trace_data: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_kind != ErrorKind::None
    }
}

/// A response retained for deferred script validation.
#[derive(Debug, Clone)]
pub struct ResponseSample {
    pub response: Response,
    pub timestamp_ms: i64,
}

/// Latency percentiles over the recorded sample, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Percentiles {
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

/// CAS loop adding onto an f64 stored as atomic bits. Off the submission
/// critical path: called once per completed request, not per submission.
fn atomic_add_f64(target: &AtomicU64, value: f64) {
    let mut current = target.load(Ordering::Relaxed);
    loop {
        let next = f64::from_bits(current) + value;
        match target.compare_exchange_weak(
            current,
            next.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// In-memory metrics collector for one run.
///
/// Thread-safe for concurrent writes from every worker callback. The atomic
/// counters are authoritative for real-time readouts; the vectors are
/// authoritative for post-run analysis.
pub struct MetricsCollector {
    run_id: String,
    config: MetricsCollectorConfig,

    total_requests: AtomicUsize,
    total_errors: AtomicUsize,
    /// f64 bits; see `atomic_add_f64`.
    total_latency_sum: AtomicU64,

    status_2xx: AtomicUsize,
    status_3xx: AtomicUsize,
    status_4xx: AtomicUsize,
    status_5xx: AtomicUsize,

    latencies: Mutex<Vec<f64>>,
    errors: Mutex<Vec<ResultRecord>>,
    success_results: Mutex<Vec<ResultRecord>>,
    success_sample_counter: AtomicUsize,
    response_samples: Mutex<Vec<ResponseSample>>,
    response_sample_counter: AtomicUsize,

    status_code_counts: Mutex<BTreeMap<u16, usize>>,
}

impl MetricsCollector {
    pub fn new(run_id: &str, config: MetricsCollectorConfig) -> Self {
        let expected = config.expected_requests;

        // Pre-allocate to avoid reallocation mid-test.
        let latency_reserve = if config.max_latencies > 0 {
            expected.min(config.max_latencies)
        } else {
            expected
        };
        let error_reserve = if config.max_errors > 0 {
            config.max_errors
        } else {
            (expected / 20).max(10_000)
        };
        let success_reserve = if config.store_success_traces {
            if config.max_success_results > 0 {
                config.max_success_results
            } else {
                expected / config.success_sample_rate.max(1)
            }
        } else {
            0
        };

        Self {
            run_id: run_id.to_string(),
            total_requests: AtomicUsize::new(0),
            total_errors: AtomicUsize::new(0),
            total_latency_sum: AtomicU64::new(0f64.to_bits()),
            status_2xx: AtomicUsize::new(0),
            status_3xx: AtomicUsize::new(0),
            status_4xx: AtomicUsize::new(0),
            status_5xx: AtomicUsize::new(0),
            latencies: Mutex::new(Vec::with_capacity(latency_reserve)),
            errors: Mutex::new(Vec::with_capacity(error_reserve)),
            success_results: Mutex::new(Vec::with_capacity(success_reserve)),
            success_sample_counter: AtomicUsize::new(0),
            response_samples: Mutex::new(Vec::with_capacity(config.max_response_samples)),
            response_sample_counter: AtomicUsize::new(0),
            status_code_counts: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Record a successful request.
    pub fn record_success(&self, status_code: u16, latency_ms: f64, trace_data: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        atomic_add_f64(&self.total_latency_sum, latency_ms);

        match status_code {
            200..=299 => self.status_2xx.fetch_add(1, Ordering::Relaxed),
            300..=399 => self.status_3xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.status_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.status_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        {
            let mut latencies = self.latencies.lock().unwrap();
            if self.config.max_latencies == 0 || latencies.len() < self.config.max_latencies {
                latencies.push(latency_ms);
            }
        }

        {
            let mut counts = self.status_code_counts.lock().unwrap();
            *counts.entry(status_code).or_insert(0) += 1;
        }

        if self.config.store_success_traces && !trace_data.is_empty() {
            let counter = self.success_sample_counter.fetch_add(1, Ordering::Relaxed);
            if counter % self.config.success_sample_rate.max(1) == 0 {
                let mut successes = self.success_results.lock().unwrap();
                if self.config.max_success_results == 0
                    || successes.len() < self.config.max_success_results
                {
                    let mut record = ResultRecord::success(now_ms(), status_code, latency_ms);
                    record.trace_data = trace_data.to_string();
                    successes.push(record);
                }
            }
        }
    }

    /// Record a failed request. Errors are never sampled; oversubscription
    /// is capped, not decimated, so the first `max_errors` are preserved.
    pub fn record_error(&self, kind: ErrorKind, message: &str, trace_data: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);

        let mut errors = self.errors.lock().unwrap();
        if self.config.max_errors == 0 || errors.len() < self.config.max_errors {
            let mut record = ResultRecord::error(now_ms(), kind, message.to_string());
            record.trace_data = trace_data.to_string();
            errors.push(record);
        }
    }

    /// Record a bare latency value for percentile calculation.
    pub fn record_latency(&self, latency_ms: f64) {
        atomic_add_f64(&self.total_latency_sum, latency_ms);

        let mut latencies = self.latencies.lock().unwrap();
        if self.config.max_latencies == 0 || latencies.len() < self.config.max_latencies {
            latencies.push(latency_ms);
        }
    }

    /// Retain a 1-in-k sample of responses for deferred script validation.
    pub fn record_response_sample(&self, response: &Response) {
        let counter = self.response_sample_counter.fetch_add(1, Ordering::Relaxed);
        if counter % self.config.response_sample_rate.max(1) != 0 {
            return;
        }

        let mut samples = self.response_samples.lock().unwrap();
        if samples.len() < self.config.max_response_samples {
            samples.push(ResponseSample {
                response: response.clone(),
                timestamp_ms: now_ms(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Real-time stats (lock-free reads)
    // ------------------------------------------------------------------

    pub fn total_requests(&self) -> usize {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> usize {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> usize {
        self.total_requests().saturating_sub(self.total_errors())
    }

    pub fn total_latency_sum(&self) -> f64 {
        f64::from_bits(self.total_latency_sum.load(Ordering::Relaxed))
    }

    pub fn average_latency(&self) -> f64 {
        let count = self.success_count();
        if count > 0 {
            self.total_latency_sum() / count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests();
        if total > 0 {
            self.total_errors() as f64 * 100.0 / total as f64
        } else {
            0.0
        }
    }

    pub fn status_class_counts(&self) -> (usize, usize, usize, usize) {
        (
            self.status_2xx.load(Ordering::Relaxed),
            self.status_3xx.load(Ordering::Relaxed),
            self.status_4xx.load(Ordering::Relaxed),
            self.status_5xx.load(Ordering::Relaxed),
        )
    }

    /// Lock-free snapshot for the live-stats stream.
    pub fn get_current_stats(&self, current_active: usize, elapsed_seconds: f64) -> serde_json::Value {
        let total = self.total_requests();
        let errors = self.total_errors();
        let success = total.saturating_sub(errors);
        let current_rps = if elapsed_seconds > 0.0 {
            total as f64 / elapsed_seconds
        } else {
            0.0
        };
        let (s2, s3, s4, s5) = self.status_class_counts();

        serde_json::json!({
            "totalRequests": total,
            "totalErrors": errors,
            "totalSuccess": success,
            "errorRate": self.error_rate(),
            "avgLatencyMs": self.average_latency(),
            "currentRps": current_rps,
            "activeConnections": current_active,
            "elapsedSeconds": elapsed_seconds,
            "status2xx": s2,
            "status3xx": s3,
            "status4xx": s4,
            "status5xx": s5,
        })
    }

    // ------------------------------------------------------------------
    // Post-test analysis
    // ------------------------------------------------------------------

    /// Nearest-rank percentiles over a snapshot of the latency sample.
    /// Empty input yields all zeros.
    pub fn calculate_percentiles(&self) -> Percentiles {
        let mut sorted = self.latencies.lock().unwrap().clone();
        if sorted.is_empty() {
            return Percentiles::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let pick = |p: f64| -> f64 {
            let idx = ((sorted.len() as f64 * p / 100.0) as usize).min(sorted.len() - 1);
            sorted[idx]
        };

        Percentiles {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: pick(50.0),
            p75: pick(75.0),
            p90: pick(90.0),
            p95: pick(95.0),
            p99: pick(99.0),
            p999: pick(99.9),
        }
    }

    /// Per-code status counts.
    pub fn status_code_distribution(&self) -> BTreeMap<u16, usize> {
        self.status_code_counts.lock().unwrap().clone()
    }

    pub fn latency_count(&self) -> usize {
        self.latencies.lock().unwrap().len()
    }

    pub fn error_records(&self) -> Vec<ResultRecord> {
        self.errors.lock().unwrap().clone()
    }

    pub fn success_records(&self) -> Vec<ResultRecord> {
        self.success_results.lock().unwrap().clone()
    }

    pub fn response_samples(&self) -> Vec<ResponseSample> {
        self.response_samples.lock().unwrap().clone()
    }

    /// Rough accounting of buffer memory, for diagnostics.
    pub fn memory_usage_bytes(&self) -> usize {
        let mut bytes = std::mem::size_of::<Self>();
        bytes += self.latencies.lock().unwrap().capacity() * std::mem::size_of::<f64>();
        {
            let errors = self.errors.lock().unwrap();
            bytes += errors.capacity() * std::mem::size_of::<ResultRecord>();
            for e in errors.iter() {
                bytes += e.error_message.capacity() + e.trace_data.capacity();
            }
        }
        {
            let successes = self.success_results.lock().unwrap();
            bytes += successes.capacity() * std::mem::size_of::<ResultRecord>();
            for s in successes.iter() {
                bytes += s.trace_data.capacity();
            }
        }
        bytes
    }

    /// Move all error records and sampled success records to the store in
    /// a single batch. Returns the number of rows written.
    pub fn flush(&self, store: &dyn RunStore) -> Result<usize, StoreError> {
        let mut batch: Vec<ResultRow> = Vec::new();

        {
            let errors = self.errors.lock().unwrap();
            let successes = self.success_results.lock().unwrap();
            batch.reserve(errors.len() + successes.len());

            for error in errors.iter() {
                batch.push(ResultRow {
                    run_id: self.run_id.clone(),
                    timestamp_ms: error.timestamp_ms,
                    status_code: 0,
                    latency_ms: 0.0,
                    error: error.error_message.clone(),
                    trace_data: error.trace_data.clone(),
                });
            }
            for success in successes.iter() {
                batch.push(ResultRow {
                    run_id: self.run_id.clone(),
                    timestamp_ms: success.timestamp_ms,
                    status_code: success.status_code,
                    latency_ms: success.latency_ms,
                    error: String::new(),
                    trace_data: success.trace_data.clone(),
                });
            }
        }

        let written = batch.len();
        if written > 0 {
            store.add_results_batch(batch)?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn collector(config: MetricsCollectorConfig) -> MetricsCollector {
        MetricsCollector::new("run-1", config)
    }

    #[test]
    fn test_totals_identity() {
        let c = collector(MetricsCollectorConfig::default());
        c.record_success(200, 10.0, "");
        c.record_success(301, 12.0, "");
        c.record_success(404, 8.0, "");
        c.record_success(500, 30.0, "");
        c.record_error(ErrorKind::Timeout, "timed out", "");

        let (s2, s3, s4, s5) = c.status_class_counts();
        assert_eq!(c.total_requests(), c.total_errors() + s2 + s3 + s4 + s5);
        assert_eq!(c.total_requests(), 5);
        assert_eq!(c.total_errors(), 1);
        assert_eq!(c.error_rate(), 20.0);
    }

    #[test]
    fn test_average_latency_over_successes() {
        let c = collector(MetricsCollectorConfig::default());
        c.record_success(200, 10.0, "");
        c.record_success(200, 20.0, "");
        c.record_error(ErrorKind::ConnectionFailed, "refused", "");
        assert!((c.average_latency() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_latencies_capped() {
        let config = MetricsCollectorConfig {
            max_latencies: 100,
            ..Default::default()
        };
        let c = collector(config);
        for _ in 0..500 {
            c.record_success(200, 1.0, "");
        }
        assert_eq!(c.latency_count(), 100);
        assert_eq!(c.total_requests(), 500);
    }

    #[test]
    fn test_errors_capped_not_decimated() {
        let config = MetricsCollectorConfig {
            max_errors: 50,
            ..Default::default()
        };
        let c = collector(config);
        for i in 0..200 {
            c.record_error(ErrorKind::ConnectionFailed, &format!("e{i}"), "");
        }
        let errors = c.error_records();
        assert_eq!(errors.len(), 50);
        // The first max_errors errors are preserved, in order.
        assert_eq!(errors[0].error_message, "e0");
        assert_eq!(errors[49].error_message, "e49");
        assert_eq!(c.total_errors(), 200);
    }

    #[test]
    fn test_success_trace_sampling() {
        let config = MetricsCollectorConfig {
            store_success_traces: true,
            success_sample_rate: 10,
            ..Default::default()
        };
        let c = collector(config);
        for _ in 0..100 {
            c.record_success(200, 5.0, "{\"total_ms\":5.0}");
        }
        // Counter-based 1-in-10: exactly 10 stored.
        assert_eq!(c.success_records().len(), 10);
    }

    #[test]
    fn test_success_traces_disabled_by_default() {
        let c = collector(MetricsCollectorConfig::default());
        c.record_success(200, 5.0, "{\"total_ms\":5.0}");
        assert!(c.success_records().is_empty());
    }

    #[test]
    fn test_response_samples_bounded() {
        let config = MetricsCollectorConfig {
            max_response_samples: 5,
            response_sample_rate: 1,
            ..Default::default()
        };
        let c = collector(config);
        let response = Response {
            status_code: 200,
            ..Default::default()
        };
        for _ in 0..50 {
            c.record_response_sample(&response);
        }
        assert_eq!(c.response_samples().len(), 5);
    }

    #[test]
    fn test_response_sample_rate() {
        let config = MetricsCollectorConfig {
            max_response_samples: 1000,
            response_sample_rate: 100,
            ..Default::default()
        };
        let c = collector(config);
        let response = Response::default();
        for _ in 0..1000 {
            c.record_response_sample(&response);
        }
        assert_eq!(c.response_samples().len(), 10);
    }

    #[test]
    fn test_percentiles_empty_all_zero() {
        let c = collector(MetricsCollectorConfig::default());
        let p = c.calculate_percentiles();
        assert_eq!(p, Percentiles::default());
    }

    #[test]
    fn test_percentiles_monotonic() {
        let c = collector(MetricsCollectorConfig::default());
        for i in 1..=1000 {
            c.record_latency(i as f64);
        }
        let p = c.calculate_percentiles();
        assert!(p.min <= p.p50);
        assert!(p.p50 <= p.p75);
        assert!(p.p75 <= p.p90);
        assert!(p.p90 <= p.p95);
        assert!(p.p95 <= p.p99);
        assert!(p.p99 <= p.p999);
        assert!(p.p999 <= p.max);
        assert_eq!(p.min, 1.0);
        assert_eq!(p.max, 1000.0);
        assert_eq!(p.p50, 501.0); // nearest-rank: floor(1000 * 0.5) = index 500
    }

    #[test]
    fn test_percentiles_single_sample() {
        let c = collector(MetricsCollectorConfig::default());
        c.record_latency(42.0);
        let p = c.calculate_percentiles();
        assert_eq!(p.p50, 42.0);
        assert_eq!(p.p999, 42.0);
        assert_eq!(p.min, 42.0);
        assert_eq!(p.max, 42.0);
    }

    #[test]
    fn test_status_code_distribution() {
        let c = collector(MetricsCollectorConfig::default());
        c.record_success(200, 1.0, "");
        c.record_success(200, 1.0, "");
        c.record_success(404, 1.0, "");
        let dist = c.status_code_distribution();
        assert_eq!(dist.get(&200), Some(&2));
        assert_eq!(dist.get(&404), Some(&1));
    }

    #[test]
    fn test_current_stats_snapshot() {
        let c = collector(MetricsCollectorConfig::default());
        c.record_success(200, 10.0, "");
        c.record_error(ErrorKind::Timeout, "slow", "");
        let stats = c.get_current_stats(3, 2.0);
        assert_eq!(stats["totalRequests"], 2);
        assert_eq!(stats["totalErrors"], 1);
        assert_eq!(stats["activeConnections"], 3);
        assert_eq!(stats["currentRps"], 1.0);
        assert_eq!(stats["status2xx"], 1);
    }

    #[test]
    fn test_flush_moves_errors_and_sampled_successes() {
        let config = MetricsCollectorConfig {
            store_success_traces: true,
            success_sample_rate: 1,
            ..Default::default()
        };
        let c = collector(config);
        c.record_success(200, 5.0, "{\"total_ms\":5.0}");
        c.record_error(ErrorKind::DnsError, "no such host", "{\"error_code\":3}");

        let store = MemoryStore::new();
        let written = c.flush(&store).unwrap();
        assert_eq!(written, 2);

        let rows = store.results("run-1");
        assert_eq!(rows.len(), 2);
        let error_row = rows.iter().find(|r| r.status_code == 0).unwrap();
        assert_eq!(error_row.error, "no such host");
        let success_row = rows.iter().find(|r| r.status_code == 200).unwrap();
        assert_eq!(success_row.latency_ms, 5.0);
    }

    #[test]
    fn test_concurrent_recording() {
        let c = std::sync::Arc::new(collector(MetricsCollectorConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    c.record_success(200, 1.0, "");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.total_requests(), 40_000);
        assert!((c.total_latency_sum() - 40_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_memory_usage_accounts_buffers() {
        let c = collector(MetricsCollectorConfig::default());
        let before = c.memory_usage_bytes();
        assert!(before > 0);
    }
}
