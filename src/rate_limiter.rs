//! Token-bucket rate limiter.
//!
//! Two variants: [`RateLimiter`] is the unlocked per-worker pacer — the
//! worker loop is single-threaded and checks the bucket tens of thousands
//! of times per second, so mutex acquisition on that path is off the table.
//! [`SharedRateLimiter`] wraps the same bucket in a mutex and adds a
//! blocking `acquire` for multi-threaded callers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{RateLimiterConfig, BURST_MULTIPLIER};

const TOKEN_COST: f64 = 1.0;

/// Single-threaded token bucket. Rate limiting is disabled iff
/// `target_rps == 0`; then every acquire succeeds immediately.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    /// Whether burst was derived (2x rps) rather than configured; a later
    /// `set_target_rps` re-derives it in that case.
    derived_burst: bool,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(mut config: RateLimiterConfig) -> Self {
        let derived_burst = config.burst_size == 0.0;
        if derived_burst && config.target_rps > 0.0 {
            config.burst_size = config.target_rps * BURST_MULTIPLIER;
        }
        Self {
            config,
            derived_burst,
            // Start with full burst capacity
            tokens: config.burst_size,
            last_refill: Instant::now(),
        }
    }

    fn refill_tokens(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.config.target_rps;
        self.tokens = (self.tokens + new_tokens).min(self.config.burst_size);
        self.last_refill = now;
    }

    /// Non-blocking acquire. Returns true when a token was deducted (or
    /// limiting is disabled).
    pub fn try_acquire(&mut self) -> bool {
        if !self.config.enabled() {
            return true;
        }

        self.refill_tokens();
        if self.tokens >= TOKEN_COST {
            self.tokens -= TOKEN_COST;
            return true;
        }
        false
    }

    /// Sleep needed before the next token becomes available.
    pub fn time_until_token(&mut self) -> Duration {
        if !self.config.enabled() {
            return Duration::ZERO;
        }
        self.refill_tokens();
        if self.tokens >= TOKEN_COST {
            return Duration::ZERO;
        }
        let deficit = TOKEN_COST - self.tokens;
        Duration::from_secs_f64(deficit / self.config.target_rps)
    }

    /// Restore the bucket to full burst capacity.
    pub fn reset(&mut self) {
        self.tokens = self.config.burst_size;
        self.last_refill = Instant::now();
    }

    pub fn available_tokens(&self) -> f64 {
        self.tokens
    }

    pub fn target_rps(&self) -> f64 {
        self.config.target_rps
    }

    /// Update the target rate in place (ramp support). Keeps accumulated
    /// tokens, clamped to the new burst capacity.
    pub fn set_target_rps(&mut self, target_rps: f64) {
        if target_rps < 0.0 || !target_rps.is_finite() {
            return;
        }
        self.config.target_rps = target_rps;
        if self.derived_burst {
            self.config.burst_size = if target_rps > 0.0 {
                target_rps * BURST_MULTIPLIER
            } else {
                0.0
            };
        }
        self.tokens = self.tokens.min(self.config.burst_size);
    }
}

/// Thread-safe token bucket with a blocking acquire.
#[derive(Debug)]
pub struct SharedRateLimiter {
    inner: Mutex<RateLimiter>,
}

impl SharedRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Mutex::new(RateLimiter::new(config)),
        }
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self) -> bool {
        self.inner.lock().unwrap().try_acquire()
    }

    /// Blocking acquire: sleeps for the token deficit and retries.
    pub fn acquire(&self) {
        loop {
            let wait = {
                let mut limiter = self.inner.lock().unwrap();
                if limiter.try_acquire() {
                    return;
                }
                limiter.time_until_token()
            };
            std::thread::sleep(wait);
        }
    }

    pub fn available_tokens(&self) -> f64 {
        self.inner.lock().unwrap().available_tokens()
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().reset();
    }

    /// Re-target the bucket (ramp support).
    pub fn set_target_rps(&self, target_rps: f64) {
        self.inner.lock().unwrap().set_target_rps(target_rps);
    }
}
