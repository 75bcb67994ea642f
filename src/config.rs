//! Engine and run configuration.
//!
//! [`RunConfig`] is parsed from the JSON document the control plane submits
//! with a run; the remaining structs configure the event loop, the
//! rate limiter and the metrics collector.

use std::time::Duration;

use serde_json::Value;

use crate::errors::EngineError;
use crate::types::{Body, BodyMode, Headers, HttpMethod, Request};

/// Default maximum concurrent transfers per worker.
pub const DEFAULT_MAX_CONCURRENT: usize = 1000;
/// Default maximum connections per host.
pub const DEFAULT_MAX_PER_HOST: usize = 100;
/// Default event loop poll timeout.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;
/// Default DNS cache TTL in seconds.
pub const DEFAULT_DNS_CACHE_TIMEOUT_S: u64 = 60;
/// Burst capacity multiplier applied when no explicit burst size is set.
pub const BURST_MULTIPLIER: f64 = 2.0;
/// Default sampler tick interval.
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 100;

/// Event loop configuration.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Number of worker event loops (0 = auto-detect CPU cores).
    pub num_workers: usize,
    /// Maximum concurrent transfers per worker.
    pub max_concurrent: usize,
    /// Maximum connections per host.
    pub max_per_host: usize,
    /// User-Agent applied when the request carries none.
    pub user_agent: String,
    /// Enable per-transfer debug tracing.
    pub verbose: bool,
    /// Optional proxy URL.
    pub proxy_url: Option<String>,
    /// Event loop poll timeout in milliseconds.
    pub poll_timeout_ms: u64,
    /// DNS cache TTL in seconds (0 = no caching).
    pub dns_cache_timeout_s: u64,
    /// TCP keep-alive idle time in seconds (0 disables keep-alive).
    pub tcp_keepalive_idle_s: u64,
    /// Target requests per second across all workers (0 = unlimited).
    pub target_rps: f64,
    /// Token bucket burst size (0 = defaults to 2x target_rps).
    pub burst_size: f64,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_per_host: DEFAULT_MAX_PER_HOST,
            user_agent: concat!("pulse-engine/", env!("CARGO_PKG_VERSION")).to_string(),
            verbose: false,
            proxy_url: None,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            dns_cache_timeout_s: DEFAULT_DNS_CACHE_TIMEOUT_S,
            tcp_keepalive_idle_s: 60,
            target_rps: 0.0,
            burst_size: 0.0,
        }
    }
}

/// Rate limiter configuration. Limiting is enabled iff `target_rps > 0`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub target_rps: f64,
    pub burst_size: f64,
}

impl RateLimiterConfig {
    pub fn new(target_rps: f64, burst_size: f64) -> Result<Self, EngineError> {
        if target_rps < 0.0 || !target_rps.is_finite() {
            return Err(EngineError::InvalidRateLimit(format!(
                "target_rps must be non-negative and finite, got {target_rps}"
            )));
        }
        if burst_size < 0.0 || !burst_size.is_finite() {
            return Err(EngineError::InvalidRateLimit(format!(
                "burst_size must be non-negative and finite, got {burst_size}"
            )));
        }
        Ok(Self {
            target_rps,
            burst_size,
        })
    }

    pub fn enabled(&self) -> bool {
        self.target_rps > 0.0
    }
}

/// Metrics collector configuration.
#[derive(Debug, Clone)]
pub struct MetricsCollectorConfig {
    /// Expected number of requests (pre-allocation hint).
    pub expected_requests: usize,
    /// Maximum latencies to store (0 = unlimited).
    pub max_latencies: usize,
    /// Maximum errors to store (prevents OOM at high error rates).
    pub max_errors: usize,
    /// Maximum success results to store.
    pub max_success_results: usize,
    /// Sample rate for success results (1 = all, k = 1 in k).
    pub success_sample_rate: usize,
    /// Whether to store detailed trace data for successes.
    pub store_success_traces: bool,
    /// Maximum response samples retained for script validation.
    pub max_response_samples: usize,
    /// Sample rate for response samples (1 = all, k = 1 in k).
    pub response_sample_rate: usize,
}

impl Default for MetricsCollectorConfig {
    fn default() -> Self {
        Self {
            expected_requests: 10_000,
            max_latencies: 0,
            max_errors: 100_000,
            max_success_results: 50_000,
            success_sample_rate: 100,
            store_success_traces: false,
            max_response_samples: 1000,
            response_sample_rate: 100,
        }
    }
}

/// Traffic pattern selected by the run configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadPattern {
    /// Open loop: submit for `duration` at the configured target rate.
    Duration { duration: Duration },
    /// Closed loop: submit exactly `iterations` requests, bounded by the
    /// in-flight concurrency target.
    Iterations { iterations: u64 },
}

/// Parsed run configuration document.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub request: Request,
    pub pattern: LoadPattern,
    /// Target requests per second (0 = unlimited).
    pub target_rps: f64,
    /// Optional linear ramp: (start_rps, end_rps) over the run duration.
    pub ramp: Option<(f64, f64)>,
    pub concurrency: Option<usize>,
    pub workers: Option<usize>,
    pub success_sample_rate: usize,
    pub save_timing_breakdown: bool,
    pub slow_threshold_ms: f64,
    pub max_response_samples: usize,
    pub response_sample_rate: usize,
    pub test_script: String,
    pub verbose: bool,
}

impl RunConfig {
    /// Parse the control-plane configuration document.
    ///
    /// `request` is required; everything else falls back to defaults. An
    /// unrecognised method or a missing URL fails the parse so the run can
    /// be marked failed before any transfer is submitted.
    pub fn from_json(config: &Value) -> Result<Self, EngineError> {
        let request_value = config
            .get("request")
            .ok_or_else(|| EngineError::InvalidConfig("missing 'request'".into()))?;
        let mut request = parse_request(request_value)?;

        let target_rps = config
            .get("rps")
            .and_then(Value::as_f64)
            .filter(|rps| *rps > 0.0)
            .or_else(|| config.get("targetRps").and_then(Value::as_f64))
            .unwrap_or(0.0);
        if target_rps < 0.0 || !target_rps.is_finite() {
            return Err(EngineError::InvalidConfig(format!(
                "rps must be non-negative, got {target_rps}"
            )));
        }

        // A top-level timeout overrides the request's own.
        if let Some(timeout) = config.get("timeout").and_then(Value::as_u64) {
            request.timeout_ms = timeout;
        }

        let pattern = if let Some(iterations) = config.get("iterations").and_then(Value::as_u64) {
            LoadPattern::Iterations { iterations }
        } else {
            let duration = match config.get("duration") {
                Some(Value::String(s)) => parse_duration_string(s)?,
                Some(v) if v.is_u64() => Duration::from_secs(v.as_u64().unwrap_or(60)),
                _ => Duration::from_secs(60),
            };
            LoadPattern::Duration { duration }
        };

        let ramp = config.get("ramp").and_then(|ramp| {
            let start = ramp.get("startRps").and_then(Value::as_f64)?;
            let end = ramp.get("endRps").and_then(Value::as_f64)?;
            (start >= 0.0 && end >= 0.0).then_some((start, end))
        });

        // Script source: request.tests first, then the top-level field.
        let test_script = request_value
            .get("tests")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| config.get("tests").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            request,
            pattern,
            target_rps,
            ramp,
            concurrency: config
                .get("concurrency")
                .and_then(Value::as_u64)
                .map(|c| c as usize),
            workers: config
                .get("workers")
                .and_then(Value::as_u64)
                .map(|w| w as usize),
            success_sample_rate: config
                .get("success_sample_rate")
                .and_then(Value::as_u64)
                .map(|r| (r as usize).max(1))
                .unwrap_or(100),
            save_timing_breakdown: config
                .get("save_timing_breakdown")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            slow_threshold_ms: config
                .get("slow_threshold_ms")
                .and_then(Value::as_f64)
                .unwrap_or(1000.0),
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
            test_script,
            verbose: config
                .get("verbose")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Duration of the traffic phase, where defined.
    pub fn duration(&self) -> Option<Duration> {
        match self.pattern {
            LoadPattern::Duration { duration } => Some(duration),
            LoadPattern::Iterations { .. } => None,
        }
    }
}

/// Deserialize the `request` object of a configuration document.
pub fn parse_request(value: &Value) -> Result<Request, EngineError> {
    let method_str = value
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET");
    let method = HttpMethod::parse(method_str).ok_or_else(|| {
        EngineError::InvalidConfig(format!("unsupported HTTP method '{method_str}'"))
    })?;

    let url = value
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| EngineError::InvalidConfig("request URL is required".into()))?
        .to_string();

    let mut headers = Headers::new();
    if let Some(map) = value.get("headers").and_then(Value::as_object) {
        for (name, header_value) in map {
            if let Some(v) = header_value.as_str() {
                headers.insert(name.clone(), v.to_string());
            }
        }
    }

    let body = match value.get("body") {
        Some(body_value) => {
            let mode = body_value
                .get("mode")
                .and_then(Value::as_str)
                .map(parse_body_mode)
                .unwrap_or(BodyMode::None);
            let content = body_value
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Body { mode, content }
        }
        None => Body::default(),
    };

    Ok(Request {
        method,
        url,
        headers,
        body,
        timeout_ms: value
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(30_000),
        follow_redirects: value
            .get("followRedirects")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        max_redirects: value
            .get("maxRedirects")
            .and_then(Value::as_u64)
            .map(|m| m as u32)
            .unwrap_or(10),
        verify_ssl: value
            .get("verifySSL")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    })
}

fn parse_body_mode(s: &str) -> BodyMode {
    match s {
        "json" => BodyMode::Json,
        "text" => BodyMode::Text,
        "form" => BodyMode::Form,
        "form-data" => BodyMode::FormData,
        "binary" => BodyMode::Binary,
        "graphql" => BodyMode::Graphql,
        _ => BodyMode::None,
    }
}

/// Parse a duration of the form `"<N>s"` (or a bare integer of seconds).
pub fn parse_duration_string(s: &str) -> Result<Duration, EngineError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::InvalidConfig(
            "duration string cannot be empty".into(),
        ));
    }

    let digits = s.strip_suffix('s').unwrap_or(s);
    let seconds: u64 = digits.parse().map_err(|_| {
        EngineError::InvalidConfig(format!("invalid duration '{s}', expected e.g. \"30s\""))
    })?;
    Ok(Duration::from_secs(seconds))
}
