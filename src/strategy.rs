//! Load strategies.
//!
//! A strategy decides how many requests to submit and how fast, then
//! returns once every intended submission has been issued (not necessarily
//! completed — quiescence is the supervisor's job). The per-response
//! callback built here is the only bridge between the HTTP path and the
//! metrics path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::{LoadPattern, RateLimiterConfig, RunConfig};
use crate::metrics::MetricsCollector;
use crate::rate_limiter::SharedRateLimiter;
use crate::run::RunContext;
use crate::transfer::{CompletionHandler, TransferCallback};
use crate::types::{Request, TransferResult};

/// Pause between submission attempts when the worker queues are saturated
/// or the in-flight window is full.
const BACKPRESSURE_PAUSE: Duration = Duration::from_micros(200);

/// Interval at which a ramp re-targets the worker pacers.
const RAMP_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Traffic pattern driver.
#[derive(Debug, Clone)]
pub enum LoadStrategy {
    /// Open loop: submit for the full duration; pacing is delegated to the
    /// worker pacers, which absorb the difference through the queues.
    OpenLoop {
        duration: Duration,
        ramp: Option<(f64, f64)>,
    },
    /// Closed loop: exactly `iterations` submissions, bounded by an
    /// in-flight concurrency target; each completion frees one slot.
    ClosedLoop { iterations: u64, concurrency: usize },
}

impl LoadStrategy {
    pub fn from_config(config: &RunConfig, default_concurrency: usize) -> Self {
        match config.pattern {
            LoadPattern::Iterations { iterations } => LoadStrategy::ClosedLoop {
                iterations,
                concurrency: config.concurrency.unwrap_or(default_concurrency).max(1),
            },
            LoadPattern::Duration { duration } => LoadStrategy::OpenLoop {
                duration,
                ramp: config.ramp,
            },
        }
    }

    /// Issue every intended submission, honouring cooperative cancellation.
    pub fn execute(&self, ctx: &Arc<RunContext>, config: &RunConfig, request: &Request) {
        let Some(event_loop) = ctx.event_loop() else {
            return;
        };
        let handler = Arc::new(ResultHandler::new(ctx.metrics_arc(), config));

        match *self {
            LoadStrategy::OpenLoop { duration, ramp } => {
                let expected = (duration.as_secs_f64() * config.target_rps) as u64;
                ctx.requests_expected.store(expected, Ordering::Relaxed);
                info!(
                    run_id = %ctx.run_id,
                    duration_s = duration.as_secs_f64(),
                    target_rps = config.target_rps,
                    expected,
                    "open-loop strategy starting"
                );

                // The submission side paces with the blocking limiter so
                // the dispatch queues never grow past the burst allowance;
                // the worker pacers then smooth admission. Without this,
                // quiescence would have to drain an arbitrarily deep queue
                // at the paced rate.
                let initial_rps = ramp.map(|(start, _)| start).unwrap_or(config.target_rps);
                let pacing = (initial_rps > 0.0 || ramp.is_some())
                    .then(|| {
                        RateLimiterConfig::new(initial_rps, 0.0)
                            .map(SharedRateLimiter::new)
                            .ok()
                    })
                    .flatten();

                let started = Instant::now();
                let mut last_ramp_update = started;
                while !ctx.should_stop() && started.elapsed() < duration {
                    if let Some((start_rps, end_rps)) = ramp {
                        if last_ramp_update.elapsed() >= RAMP_UPDATE_INTERVAL {
                            let fraction =
                                (started.elapsed().as_secs_f64() / duration.as_secs_f64()).min(1.0);
                            let current = start_rps + (end_rps - start_rps) * fraction;
                            event_loop.set_target_rps(current);
                            if let Some(limiter) = &pacing {
                                limiter.set_target_rps(current);
                            }
                            last_ramp_update = Instant::now();
                        }
                    }

                    if let Some(limiter) = &pacing {
                        limiter.acquire();
                        if ctx.should_stop() || started.elapsed() >= duration {
                            break;
                        }
                    }

                    let callback = CompletionHandler::Callback(handler.callback());
                    match event_loop.try_submit(request.clone(), callback) {
                        Ok(_) => {
                            ctx.requests_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(rejected) => {
                            // Queue saturated: drop this attempt (the
                            // handler never fires) and re-check
                            // cancellation before retrying.
                            drop(rejected);
                            std::thread::sleep(BACKPRESSURE_PAUSE);
                        }
                    }
                }
            }

            LoadStrategy::ClosedLoop {
                iterations,
                concurrency,
            } => {
                ctx.requests_expected.store(iterations, Ordering::Relaxed);
                info!(
                    run_id = %ctx.run_id,
                    iterations,
                    concurrency,
                    "closed-loop strategy starting"
                );

                let in_flight = Arc::new(AtomicUsize::new(0));
                let mut submitted = 0u64;
                while submitted < iterations && !ctx.should_stop() {
                    if in_flight.load(Ordering::Acquire) >= concurrency {
                        std::thread::sleep(BACKPRESSURE_PAUSE);
                        continue;
                    }

                    let inner = handler.callback();
                    let slot = in_flight.clone();
                    let callback: TransferCallback = Box::new(move |id, result| {
                        inner(id, result);
                        slot.fetch_sub(1, Ordering::AcqRel);
                    });

                    in_flight.fetch_add(1, Ordering::AcqRel);
                    match event_loop.try_submit(request.clone(), CompletionHandler::Callback(callback)) {
                        Ok(_) => {
                            submitted += 1;
                            ctx.requests_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(rejected) => {
                            in_flight.fetch_sub(1, Ordering::AcqRel);
                            drop(rejected);
                            std::thread::sleep(BACKPRESSURE_PAUSE);
                        }
                    }
                }
            }
        }
        debug!(run_id = %ctx.run_id, sent = ctx.requests_sent.load(Ordering::Relaxed), "strategy submissions complete");
    }
}

/// Shared state behind every per-submission callback. Safe to invoke from
/// any worker thread concurrently.
pub struct ResultHandler {
    metrics: Arc<MetricsCollector>,
    success_sample_rate: u64,
    slow_threshold_ms: f64,
    save_timing_breakdown: bool,
    ordinal: AtomicU64,
}

impl ResultHandler {
    pub fn new(metrics: Arc<MetricsCollector>, config: &RunConfig) -> Self {
        Self {
            metrics,
            success_sample_rate: config.success_sample_rate.max(1) as u64,
            slow_threshold_ms: config.slow_threshold_ms,
            save_timing_breakdown: config.save_timing_breakdown,
            ordinal: AtomicU64::new(0),
        }
    }

    /// A fresh boxed callback for one submission.
    pub fn callback(self: &Arc<Self>) -> TransferCallback {
        let handler = self.clone();
        Box::new(move |request_id, result| handler.handle(request_id, result))
    }

    fn handle(&self, _request_id: u64, result: TransferResult) {
        let ordinal = self.ordinal.fetch_add(1, Ordering::Relaxed) + 1;

        match result {
            Ok(response) => {
                let latency = response.timing.total_ms;
                let is_slow = latency >= self.slow_threshold_ms;
                // Record persistence-bound traces for slow requests and the
                // 1-in-N ordinal sample; the collector keeps them capped.
                let should_save = is_slow || ordinal % self.success_sample_rate == 0;
                let trace = if self.save_timing_breakdown && should_save {
                    let timing = &response.timing;
                    let mut trace_json = serde_json::json!({
                        "total_ms": timing.total_ms,
                        "dns_ms": timing.dns_ms,
                        "connect_ms": timing.connect_ms,
                        "tls_ms": timing.tls_ms,
                        "first_byte_ms": timing.first_byte_ms,
                        "download_ms": timing.download_ms,
                    });
                    if is_slow {
                        trace_json["is_slow"] = serde_json::Value::Bool(true);
                        trace_json["threshold_ms"] = serde_json::json!(self.slow_threshold_ms);
                    }
                    trace_json.to_string()
                } else {
                    String::new()
                };

                self.metrics
                    .record_success(response.status_code, latency, &trace);
                self.metrics.record_response_sample(&response);
            }
            Err(error) => {
                let trace = serde_json::json!({
                    "error_code": error.kind.code(),
                    "error_type": error.kind.label(),
                    "message": error.message,
                    "request_number": ordinal,
                })
                .to_string();
                self.metrics.record_error(error.kind, &error.message, &trace);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsCollectorConfig;
    use crate::types::{ErrorKind, Response, Timing, TransferError};
    use serde_json::json;

    fn run_config(value: serde_json::Value) -> RunConfig {
        RunConfig::from_json(&value).unwrap()
    }

    fn handler_with(config: &RunConfig) -> (Arc<ResultHandler>, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new(
            "run-1",
            MetricsCollectorConfig {
                store_success_traces: config.save_timing_breakdown,
                success_sample_rate: 1,
                ..Default::default()
            },
        ));
        (Arc::new(ResultHandler::new(metrics.clone(), config)), metrics)
    }

    fn ok_response(latency_ms: f64) -> TransferResult {
        Ok(Response {
            status_code: 200,
            timing: Timing {
                total_ms: latency_ms,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_strategy_selection() {
        let config = run_config(json!({
            "request": {"url": "http://localhost/"},
            "iterations": 500,
        }));
        match LoadStrategy::from_config(&config, 100) {
            LoadStrategy::ClosedLoop {
                iterations,
                concurrency,
            } => {
                assert_eq!(iterations, 500);
                assert_eq!(concurrency, 100);
            }
            other => panic!("unexpected strategy {other:?}"),
        }

        let config = run_config(json!({
            "request": {"url": "http://localhost/"},
            "duration": "5s",
            "rps": 50,
        }));
        match LoadStrategy::from_config(&config, 100) {
            LoadStrategy::OpenLoop { duration, ramp } => {
                assert_eq!(duration, Duration::from_secs(5));
                assert!(ramp.is_none());
            }
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn test_handler_records_success_and_error() {
        let config = run_config(json!({"request": {"url": "http://localhost/"}}));
        let (handler, metrics) = handler_with(&config);

        (handler.callback())(1, ok_response(12.0));
        (handler.callback())(
            2,
            Err(TransferError::new(ErrorKind::Timeout, "deadline exceeded")),
        );

        assert_eq!(metrics.total_requests(), 2);
        assert_eq!(metrics.total_errors(), 1);
        let errors = metrics.error_records();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_kind, ErrorKind::Timeout);
        let trace: serde_json::Value = serde_json::from_str(&errors[0].trace_data).unwrap();
        assert_eq!(trace["error_type"], "timeout");
        assert_eq!(trace["request_number"], 2);
    }

    #[test]
    fn test_slow_requests_always_traced() {
        let config = run_config(json!({
            "request": {"url": "http://localhost/"},
            "save_timing_breakdown": true,
            "success_sample_rate": 1000,
            "slow_threshold_ms": 100.0,
        }));
        let (handler, metrics) = handler_with(&config);

        // Fast requests: ordinal sampling at 1-in-1000 skips them all.
        for _ in 0..10 {
            (handler.callback())(0, ok_response(5.0));
        }
        assert!(metrics.success_records().is_empty());

        // A slow request is traced regardless of the ordinal.
        (handler.callback())(0, ok_response(250.0));
        let records = metrics.success_records();
        assert_eq!(records.len(), 1);
        let trace: serde_json::Value = serde_json::from_str(&records[0].trace_data).unwrap();
        assert_eq!(trace["is_slow"], true);
        assert_eq!(trace["threshold_ms"], 100.0);
    }

    #[test]
    fn test_ordinal_sampling_of_success_traces() {
        let config = run_config(json!({
            "request": {"url": "http://localhost/"},
            "save_timing_breakdown": true,
            "success_sample_rate": 10,
            "slow_threshold_ms": 10000.0,
        }));
        let (handler, metrics) = handler_with(&config);
        for _ in 0..100 {
            (handler.callback())(0, ok_response(1.0));
        }
        assert_eq!(metrics.success_records().len(), 10);
    }

    #[test]
    fn test_response_samples_fed_from_callback() {
        let config = run_config(json!({
            "request": {"url": "http://localhost/"},
            "response_sample_rate": 1,
        }));
        let metrics = Arc::new(MetricsCollector::new(
            "run-1",
            MetricsCollectorConfig {
                response_sample_rate: 1,
                ..Default::default()
            },
        ));
        let handler = Arc::new(ResultHandler::new(metrics.clone(), &config));
        (handler.callback())(1, ok_response(3.0));
        assert_eq!(metrics.response_samples().len(), 1);
    }
}
