//! Run lifecycle: context, registry, supervisor and metrics sampler.
//!
//! One run = one supervisor thread (built here), N worker threads (owned by
//! the run's event loop) and one sampler thread. `is_running` is set before
//! either thread spawns so a just-started sampler can never observe it
//! false and exit immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{
    EventLoopConfig, MetricsCollectorConfig, RunConfig, DEFAULT_DNS_CACHE_TIMEOUT_S,
    DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_PER_HOST, DEFAULT_STATS_INTERVAL_MS, BURST_MULTIPLIER,
};
use crate::event_loop::EventLoop;
use crate::metrics::{now_ms, MetricsCollector};
use crate::script;
use crate::store::{update_run_status_with_retry, Metric, MetricName, RunStore};
use crate::strategy::LoadStrategy;
use crate::types::RunStatus;

/// Shared state for one run, mutated by the supervisor, the sampler and
/// every worker callback.
pub struct RunContext {
    pub run_id: String,
    /// The configuration document as submitted.
    pub config: Value,
    /// Terminal test script, extracted from `request.tests` or `tests`.
    pub test_script: String,
    metrics: Arc<MetricsCollector>,
    event_loop: Mutex<Option<Arc<EventLoop>>>,
    sampler_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    pub start_time_ms: AtomicI64,
    pub requests_sent: AtomicU64,
    pub requests_expected: AtomicU64,
    should_stop: AtomicBool,
    is_running: AtomicBool,
}

impl RunContext {
    /// Build the context, deriving the collector's pre-allocation hint from
    /// the configured duration and rate (plus a 20% buffer).
    pub fn new(run_id: &str, config: Value) -> Self {
        let duration_s = match config.get("duration") {
            Some(Value::String(s)) => crate::config::parse_duration_string(s)
                .map(|d| d.as_secs_f64())
                .unwrap_or(60.0),
            Some(v) if v.is_u64() => v.as_u64().unwrap_or(60) as f64,
            _ => 60.0,
        };
        let mut rps_estimate = config
            .get("rps")
            .and_then(Value::as_f64)
            .filter(|rps| *rps > 0.0)
            .or_else(|| config.get("targetRps").and_then(Value::as_f64))
            .unwrap_or(0.0);
        if rps_estimate <= 0.0 {
            rps_estimate = 1000.0;
        }

        let collector_config = MetricsCollectorConfig {
            expected_requests: ((duration_s * rps_estimate * 1.2) as usize).max(10_000),
            // The strategy applies the ordinal/slow-request sampling
            // discipline before any trace reaches the collector, so the
            // collector itself stores every trace it is handed.
            success_sample_rate: 1,
            store_success_traces: config
                .get("save_timing_breakdown")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            max_response_samples: config
                .get("max_response_samples")
                .and_then(Value::as_u64)
                .map(|m| m as usize)
                .unwrap_or(1000),
            response_sample_rate: config
                .get("response_sample_rate")
                .and_then(Value::as_u64)
                .map(|r| (r as usize).max(1))
                .unwrap_or(100),
            ..Default::default()
        };

        let test_script = config
            .get("request")
            .and_then(|r| r.get("tests"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| config.get("tests").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        Self {
            metrics: Arc::new(MetricsCollector::new(run_id, collector_config)),
            run_id: run_id.to_string(),
            config,
            test_script,
            event_loop: Mutex::new(None),
            sampler_thread: Mutex::new(None),
            start_time_ms: AtomicI64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_expected: AtomicU64::new(0),
            should_stop: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn metrics_arc(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.lock().unwrap().clone()
    }

    fn set_event_loop(&self, event_loop: Arc<EventLoop>) {
        *self.event_loop.lock().unwrap() = Some(event_loop);
    }

    /// Cooperative cancellation flag. Monotonic: once set, never cleared.
    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::Release);
    }

    /// In-flight transfer count, zero once the loop is torn down.
    pub fn active_connections(&self) -> usize {
        self.event_loop()
            .map(|event_loop| event_loop.active_count())
            .unwrap_or(0)
    }

    /// Lock-free stats snapshot for the control plane's live stream.
    pub fn current_stats(&self) -> Value {
        let started = self.start_time_ms.load(Ordering::Acquire);
        let elapsed_s = if started > 0 {
            ((now_ms() - started) as f64 / 1000.0).max(0.0)
        } else {
            0.0
        };
        self.metrics
            .get_current_stats(self.active_connections(), elapsed_s)
    }

    fn join_sampler(&self) {
        if let Some(handle) = self.sampler_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                error!(run_id = %self.run_id, "sampler thread panicked");
            }
        }
    }
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The flag was raised on a live run.
    Requested,
    /// The run was already stopping; counters are untouched.
    AlreadyStopping,
    /// No live run with that id.
    NotFound,
}

/// Map of live run-id → shared context, guarded by a single mutex that is
/// only touched on register/lookup/unregister — never on the hot path.
/// Cloning the registry clones a handle to the same map.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, Arc<RunContext>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, context: Arc<RunContext>) {
        self.runs
            .lock()
            .unwrap()
            .insert(context.run_id.clone(), context);
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunContext>> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    pub fn unregister(&self, run_id: &str) {
        self.runs.lock().unwrap().remove(run_id);
    }

    pub fn active_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn all_runs(&self) -> Vec<Arc<RunContext>> {
        self.runs.lock().unwrap().values().cloned().collect()
    }

    /// Start a run: construct the context, mark it running *before* any
    /// thread spawns, then launch the sampler and the supervisor.
    pub fn start_run(
        &self,
        run_id: &str,
        config: Value,
        store: Arc<dyn RunStore>,
        verbose: bool,
    ) {
        let context = Arc::new(RunContext::new(run_id, config));
        self.register(context.clone());

        context.set_running(true);
        context.start_time_ms.store(now_ms(), Ordering::Release);

        // Sampler first; the supervisor joins it during teardown.
        let sampler_ctx = context.clone();
        let sampler_store = store.clone();
        let sampler = std::thread::Builder::new()
            .name(format!("pulse-sampler-{run_id}"))
            .spawn(move || collect_metrics(sampler_ctx, sampler_store))
            .expect("failed to spawn sampler thread");
        *context.sampler_thread.lock().unwrap() = Some(sampler);

        let registry = self.clone();
        std::thread::Builder::new()
            .name(format!("pulse-run-{run_id}"))
            .spawn(move || execute_load_test(context, store, verbose, registry))
            .expect("failed to spawn supervisor thread");
    }

    /// Raise `should_stop` on a live run. Returns immediately; idempotent.
    pub fn stop_run(&self, run_id: &str) -> StopOutcome {
        match self.get(run_id) {
            Some(context) => {
                if context.should_stop() {
                    StopOutcome::AlreadyStopping
                } else {
                    info!(run_id, "stop requested");
                    context.request_stop();
                    StopOutcome::Requested
                }
            }
            None => StopOutcome::NotFound,
        }
    }

    /// Process shutdown: flag every live run and wait up to `timeout` for
    /// all of them to deregister. If the deadline lapses, shutdown
    /// proceeds anyway.
    pub fn shutdown_all(&self, timeout: Duration) {
        let runs = self.all_runs();
        if runs.is_empty() {
            return;
        }
        info!(count = runs.len(), "stopping all active runs");
        for run in &runs {
            run.request_stop();
        }

        let deadline = Instant::now() + timeout;
        while self.active_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        if self.active_count() > 0 {
            warn!(
                remaining = self.active_count(),
                "shutdown deadline lapsed with runs still active"
            );
        }
    }
}

/// Supervisor body: drives one run end-to-end and always leaves it in
/// exactly one terminal state.
fn execute_load_test(
    context: Arc<RunContext>,
    store: Arc<dyn RunStore>,
    verbose: bool,
    registry: RunRegistry,
) {
    if let Err(e) = run_body(&context, &*store, verbose) {
        error!(run_id = %context.run_id, error = %e, "load test failed");
        context.set_running(false);
        context.join_sampler();
        update_run_status_with_retry(&*store, &context.run_id, RunStatus::Failed);
        let _ = store.add_metric(Metric::new(
            &context.run_id,
            now_ms(),
            MetricName::Completed,
            1.0,
        ));
    }

    context.set_running(false);
    registry.unregister(&context.run_id);
}

fn run_body(
    context: &Arc<RunContext>,
    store: &dyn RunStore,
    verbose: bool,
) -> Result<(), crate::errors::EngineError> {
    store.update_run_status(&context.run_id, RunStatus::Running)?;

    // Defaults come from the external configuration registry; the per-run
    // document can override them.
    let default_max_concurrent =
        store.get_config_int("eventLoopMaxConcurrent", DEFAULT_MAX_CONCURRENT as i64);
    let default_max_per_host =
        store.get_config_int("eventLoopMaxPerHost", DEFAULT_MAX_PER_HOST as i64);
    let configured_workers = store.get_config_int("workers", 0);
    let dns_cache_timeout =
        store.get_config_int("dnsCacheTimeout", DEFAULT_DNS_CACHE_TIMEOUT_S as i64);

    let run_config = match RunConfig::from_json(&context.config) {
        Ok(run_config) => run_config,
        Err(e) => {
            warn!(run_id = %context.run_id, error = %e, "invalid run configuration");
            context.set_running(false);
            context.join_sampler();
            update_run_status_with_retry(store, &context.run_id, RunStatus::Failed);
            let _ = store.add_metric(Metric::new(
                &context.run_id,
                now_ms(),
                MetricName::Completed,
                1.0,
            ));
            return Ok(());
        }
    };

    let concurrency = run_config
        .concurrency
        .unwrap_or(default_max_concurrent.max(1) as usize);
    let target_rps = run_config.target_rps;

    let loop_config = EventLoopConfig {
        num_workers: run_config.workers.unwrap_or(configured_workers.max(0) as usize),
        max_concurrent: concurrency.max(100),
        max_per_host: default_max_per_host.max(1) as usize,
        target_rps,
        burst_size: if target_rps > 0.0 {
            target_rps * BURST_MULTIPLIER
        } else {
            0.0
        },
        dns_cache_timeout_s: dns_cache_timeout.max(0) as u64,
        verbose: run_config.verbose,
        ..Default::default()
    };
    debug!(
        run_id = %context.run_id,
        workers = loop_config.num_workers,
        max_concurrent = loop_config.max_concurrent,
        max_per_host = loop_config.max_per_host,
        target_rps,
        timeout_ms = run_config.request.timeout_ms,
        "event loop config resolved"
    );

    let event_loop = Arc::new(EventLoop::new(loop_config));
    event_loop.start();
    context.set_event_loop(event_loop.clone());

    let test_start = Instant::now();
    let strategy = LoadStrategy::from_config(&run_config, concurrency);
    strategy.execute(context, &run_config, &run_config.request);

    // Quiescence barrier: every outstanding transfer completes or errors
    // before anything downstream reads the collector.
    event_loop.stop(true);

    // Stamp the test end before teardown so the reported duration excludes
    // cleanup overhead.
    let test_end = Instant::now();
    let total_duration_s = test_end.duration_since(test_start).as_secs_f64();
    store.update_run_end_time(&context.run_id, now_ms())?;

    context.set_running(false);
    context.join_sampler();

    let cleanup_end = Instant::now();
    let setup_overhead_s = cleanup_end.duration_since(test_end).as_secs_f64();

    let metrics = context.metrics();
    let completed = metrics.total_requests();
    let errors = metrics.total_errors();
    let avg_latency = metrics.average_latency();
    let error_rate = metrics.error_rate();
    let actual_rps = if total_duration_s > 0.0 {
        completed as f64 / total_duration_s
    } else {
        0.0
    };
    let percentiles = metrics.calculate_percentiles();

    // Final summary metrics, batched into a single store call.
    {
        let timestamp = now_ms();
        let id = context.run_id.as_str();
        let mut final_metrics = vec![
            Metric::new(id, timestamp, MetricName::Rps, actual_rps),
            Metric::new(id, timestamp, MetricName::LatencyAvg, avg_latency),
            Metric::new(id, timestamp, MetricName::LatencyP50, percentiles.p50)
                .with_labels(r#"{"percentile":"p50"}"#),
            Metric::new(id, timestamp, MetricName::LatencyP95, percentiles.p95)
                .with_labels(r#"{"percentile":"p95"}"#),
            Metric::new(id, timestamp, MetricName::LatencyP99, percentiles.p99)
                .with_labels(r#"{"percentile":"p99"}"#),
            Metric::new(id, timestamp, MetricName::ErrorRate, error_rate),
            Metric::new(id, timestamp, MetricName::TotalRequests, completed as f64),
            Metric::new(id, timestamp, MetricName::Completed, 1.0),
            Metric::new(id, timestamp, MetricName::TestDuration, total_duration_s),
            Metric::new(id, timestamp, MetricName::SetupOverhead, setup_overhead_s),
        ];

        let status_codes = metrics.status_code_distribution();
        if !status_codes.is_empty() {
            let labels: serde_json::Map<String, Value> = status_codes
                .iter()
                .map(|(code, count)| (code.to_string(), Value::from(*count)))
                .collect();
            final_metrics.push(
                Metric::new(id, timestamp, MetricName::StatusCodes, 0.0)
                    .with_labels(Value::Object(labels).to_string()),
            );
        }

        if let Err(e) = store.add_metrics_batch(final_metrics) {
            error!(run_id = %context.run_id, error = %e, "failed to store final metrics");
        }
    }

    match metrics.flush(store) {
        Ok(flushed) if verbose && flushed > 0 => {
            info!(run_id = %context.run_id, flushed, "flushed results to store");
        }
        Ok(_) => {}
        Err(e) => error!(run_id = %context.run_id, error = %e, "failed to flush results"),
    }

    script::validate_samples(context, store, verbose);

    let final_status = if context.should_stop() {
        RunStatus::Stopped
    } else {
        RunStatus::Completed
    };
    update_run_status_with_retry(store, &context.run_id, final_status);

    if verbose {
        let target_desc = if target_rps > 0.0 {
            target_rps.to_string()
        } else {
            "unlimited".to_string()
        };
        info!(
            run_id = %context.run_id,
            status = final_status.as_str(),
            total_requests = completed,
            errors,
            error_rate,
            duration_s = total_duration_s,
            target_rps = %target_desc,
            actual_rps,
            avg_latency_ms = avg_latency,
            p50 = percentiles.p50,
            p95 = percentiles.p95,
            p99 = percentiles.p99,
            "load test finished"
        );
    }

    Ok(())
}

/// Sampler thread: periodic aggregate metrics, one batch per tick. Exits
/// as soon as the run stops being live.
fn collect_metrics(context: Arc<RunContext>, store: Arc<dyn RunStore>) {
    let stats_interval = store
        .get_config_int("statsInterval", DEFAULT_STATS_INTERVAL_MS as i64)
        .max(10) as u64;
    let tick = Duration::from_millis(stats_interval);

    let mut last_update = Instant::now();
    let mut last_total = 0usize;

    while context.is_running() && !context.should_stop() {
        std::thread::sleep(tick);

        let elapsed = last_update.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            continue;
        }

        let metrics = context.metrics();
        let current_total = metrics.total_requests();
        let delta = current_total.saturating_sub(last_total);
        let current_rps = delta as f64 / elapsed;
        let error_rate = metrics.error_rate();
        let active = context.active_connections();

        debug!(
            run_id = %context.run_id,
            rps = current_rps,
            error_rate,
            active,
            sent = context.requests_sent.load(Ordering::Relaxed),
            "sampler tick"
        );

        let timestamp = now_ms();
        let id = context.run_id.as_str();
        let batch = vec![
            Metric::new(id, timestamp, MetricName::Rps, current_rps),
            Metric::new(id, timestamp, MetricName::ErrorRate, error_rate),
            Metric::new(id, timestamp, MetricName::ConnectionsActive, active as f64),
            Metric::new(
                id,
                timestamp,
                MetricName::RequestsSent,
                context.requests_sent.load(Ordering::Relaxed) as f64,
            ),
            Metric::new(
                id,
                timestamp,
                MetricName::RequestsExpected,
                context.requests_expected.load(Ordering::Relaxed) as f64,
            ),
        ];
        // Per-tick write failures are swallowed; the next tick writes a
        // fresh sample anyway.
        let _ = store.add_metrics_batch(batch);

        last_update = Instant::now();
        last_total = current_total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_register_lookup_unregister() {
        let registry = RunRegistry::new();
        let ctx = Arc::new(RunContext::new("r1", json!({})));
        registry.register(ctx.clone());
        assert_eq!(registry.active_count(), 1);
        assert!(registry.get("r1").is_some());
        assert!(registry.get("r2").is_none());
        registry.unregister("r1");
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_stop_run_idempotent() {
        let registry = RunRegistry::new();
        let ctx = Arc::new(RunContext::new("r1", json!({})));
        registry.register(ctx.clone());

        assert_eq!(registry.stop_run("r1"), StopOutcome::Requested);
        assert!(ctx.should_stop());
        assert_eq!(registry.stop_run("r1"), StopOutcome::AlreadyStopping);
        assert_eq!(registry.stop_run("missing"), StopOutcome::NotFound);
    }

    #[test]
    fn test_context_expected_requests_estimation() {
        let ctx = RunContext::new(
            "r1",
            json!({"duration": "10s", "rps": 500.0, "request": {"url": "http://x/"}}),
        );
        // 10s * 500 rps * 1.2 = 6000, floored at 10k minimum
        assert_eq!(ctx.metrics().total_requests(), 0);
        assert!(ctx.test_script.is_empty());
    }

    #[test]
    fn test_context_extracts_test_script() {
        let ctx = RunContext::new(
            "r1",
            json!({"request": {"url": "http://x/", "tests": "pm.test(...)"}}),
        );
        assert_eq!(ctx.test_script, "pm.test(...)");

        let ctx = RunContext::new("r2", json!({"tests": "top"}));
        assert_eq!(ctx.test_script, "top");
    }

    #[test]
    fn test_shutdown_all_with_no_runs_returns() {
        let registry = RunRegistry::new();
        registry.shutdown_all(Duration::from_secs(5));
    }

    #[test]
    fn test_current_stats_before_traffic() {
        let ctx = RunContext::new("r1", json!({}));
        let stats = ctx.current_stats();
        assert_eq!(stats["totalRequests"], 0);
        assert_eq!(stats["activeConnections"], 0);
        assert_eq!(stats["currentRps"], 0.0);
    }

    #[test]
    fn test_stop_flag_is_monotonic() {
        let ctx = RunContext::new("r1", json!({}));
        assert!(!ctx.should_stop());
        ctx.request_stop();
        assert!(ctx.should_stop());
        ctx.request_stop();
        assert!(ctx.should_stop());
    }
}
