//! pulse-engine: an HTTP load-generation engine.
//!
//! A long-running daemon core that, on command, issues HTTP requests
//! against a target at a controlled rate and concurrency, records
//! per-request outcomes in memory, aggregates summary statistics, and
//! persists a compact sample of raw results plus time-series metrics
//! through a pluggable store. A post-run validator checks sampled
//! responses against user-supplied test scripts.
//!
//! The moving parts, bottom up:
//! - [`rate_limiter`]: token-bucket pacer, one unlocked instance per worker
//! - [`spsc`]: lock-free queue handing transfers from strategy to worker
//! - [`dns_cache`]: TTL'd resolver cache shared across workers
//! - [`worker`] / [`event_loop`]: the multi-worker async transfer engine
//! - [`metrics`]: lock-free counters plus bounded result buffers
//! - [`strategy`]: open-loop, closed-loop and ramp traffic patterns
//! - [`run`]: per-run supervisor, sampler thread and the live-run registry
//! - [`script`]: deferred Postman-style response validation

pub mod config;
pub mod dns_cache;
pub mod errors;
pub mod event_loop;
pub mod metrics;
pub mod rate_limiter;
pub mod run;
pub mod script;
pub mod spsc;
pub mod store;
pub mod strategy;
pub mod transfer;
pub mod types;
pub mod worker;

pub use config::{EventLoopConfig, MetricsCollectorConfig, RateLimiterConfig, RunConfig};
pub use errors::EngineError;
pub use event_loop::EventLoop;
pub use metrics::MetricsCollector;
pub use run::{RunContext, RunRegistry, StopOutcome};
pub use store::{MemoryStore, Metric, MetricName, ResultRow, RunStore, StoreError};
pub use types::{
    Body, BodyMode, ErrorKind, Headers, HttpMethod, Request, Response, RunStatus, Timing,
    TransferError, TransferResult,
};
