//! Worker event loop.
//!
//! Each worker is a native thread owning a current-thread async runtime, a
//! multiplexed set of in-flight transfers, a token-bucket pacer and the
//! consumer side of its dispatch queue. The loop is single-threaded by
//! construction: the transfer set, the client cache and the pacer are never
//! touched by any other thread. The producer side of the queue is the only
//! cross-thread hazard, and the queue's own synchronisation covers it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::config::{EventLoopConfig, RateLimiterConfig};
use crate::dns_cache::CachingResolver;
use crate::errors::{classify_reqwest_error, EngineError};
use crate::rate_limiter::RateLimiter;
use crate::spsc::{self, Consumer, Producer};
use crate::transfer::TransferContext;
use crate::types::{
    status_text, BodyMode, Headers, HttpMethod, Response, Timing, TransferError, TransferResult,
};
use crate::types::ErrorKind;

/// State shared between the worker thread and its owner.
struct WorkerShared {
    config: EventLoopConfig,
    notify: Notify,
    stop: AtomicBool,
    /// Set when stop(wait_for_pending=false) was requested: queued
    /// transfers are flushed as cancellation errors instead of executed.
    cancel_pending: AtomicBool,
    active: AtomicUsize,
    local_processed: AtomicU64,
    /// Current per-worker target rps as f64 bits; the loop re-applies it
    /// to the pacer when it changes (ramp support).
    rps_bits: AtomicU64,
    resolver: Option<Arc<CachingResolver>>,
}

/// A single worker event loop.
pub struct Worker {
    shared: Arc<WorkerShared>,
    producer: Producer<TransferContext>,
    consumer: Mutex<Option<Consumer<TransferContext>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Worker {
    /// `config.target_rps` and `config.burst_size` must already be this
    /// worker's share of the aggregate target.
    pub fn new(config: EventLoopConfig, resolver: Option<Arc<CachingResolver>>) -> Self {
        let queue_capacity = (config.max_concurrent * 4).max(1024);
        let (producer, consumer) = spsc::channel(queue_capacity);
        let shared = Arc::new(WorkerShared {
            rps_bits: AtomicU64::new(config.target_rps.to_bits()),
            config,
            notify: Notify::new(),
            stop: AtomicBool::new(false),
            cancel_pending: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            local_processed: AtomicU64::new(0),
            resolver,
        });
        Self {
            shared,
            producer,
            consumer: Mutex::new(Some(consumer)),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let Some(consumer) = self.consumer.lock().unwrap().take() else {
            return;
        };
        let shared = self.shared.clone();
        *thread = Some(
            std::thread::Builder::new()
                .name("pulse-worker".into())
                .spawn(move || run_loop(shared, consumer))
                .expect("failed to spawn worker thread"),
        );
    }

    /// Stop the worker. With `wait_for_pending` the loop drains the queue
    /// and lets in-flight transfers finish; without it, queued transfers
    /// are delivered a cancellation error (in-flight ones still complete —
    /// they cannot be aborted mid-transfer).
    pub fn stop(&self, wait_for_pending: bool) {
        if !wait_for_pending {
            self.shared.cancel_pending.store(true, Ordering::Release);
        }
        self.shared.stop.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    /// Hand a transfer to this worker. On a full queue the context comes
    /// back so the caller can retry or cancel it.
    pub fn submit(&self, ctx: TransferContext) -> Result<(), TransferContext> {
        self.producer.push(ctx)?;
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.producer.len()
    }

    pub fn local_processed(&self) -> u64 {
        self.shared.local_processed.load(Ordering::Relaxed)
    }

    /// Update this worker's pacer target (applied by the loop on its next
    /// iteration).
    pub fn set_target_rps(&self, target_rps: f64) {
        self.shared
            .rps_bits
            .store(target_rps.to_bits(), Ordering::Relaxed);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn run_loop(shared: Arc<WorkerShared>, consumer: Consumer<TransferContext>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build worker runtime");
            while let Some(ctx) = consumer.pop() {
                let id = ctx.request_id;
                ctx.handler
                    .complete(id, Err(TransferError::new(ErrorKind::InternalError, e.to_string())));
            }
            return;
        }
    };

    runtime.block_on(async move {
        let mut clients = ClientCache::new(shared.config.clone(), shared.resolver.clone());
        let limiter_config = RateLimiterConfig {
            target_rps: shared.config.target_rps,
            burst_size: shared.config.burst_size,
        };
        let mut pacer = RateLimiter::new(limiter_config);
        let mut applied_rps_bits = shared.rps_bits.load(Ordering::Relaxed);

        let max_concurrent = shared.config.max_concurrent.max(1);
        let poll_timeout = Duration::from_millis(shared.config.poll_timeout_ms.max(1));
        let verbose = shared.config.verbose;
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            let stopping = shared.stop.load(Ordering::Acquire);

            if stopping && shared.cancel_pending.load(Ordering::Acquire) {
                while let Some(ctx) = consumer.pop() {
                    ctx.cancel();
                }
            }

            if stopping && consumer.is_empty() && tasks.is_empty() {
                break;
            }

            let rps_bits = shared.rps_bits.load(Ordering::Relaxed);
            if rps_bits != applied_rps_bits {
                pacer.set_target_rps(f64::from_bits(rps_bits));
                applied_rps_bits = rps_bits;
            }

            // Admit pending transfers while the concurrency cap and the
            // pacer both allow it. The queue is checked before the pacer so
            // an empty queue never burns a token.
            while shared.active.load(Ordering::Relaxed) < max_concurrent
                && !consumer.is_empty()
                && pacer.try_acquire()
            {
                let Some(ctx) = consumer.pop() else { break };
                let TransferContext {
                    request_id,
                    request,
                    handler,
                } = ctx;

                let client = match clients.client_for(&request) {
                    Ok(client) => client,
                    Err(e) => {
                        handler.complete(
                            request_id,
                            Err(TransferError::new(ErrorKind::InternalError, e.to_string())),
                        );
                        continue;
                    }
                };

                shared.active.fetch_add(1, Ordering::Relaxed);
                let shared = shared.clone();
                tasks.spawn(async move {
                    if verbose {
                        debug!(request_id, url = %request.url, method = %request.method, "transfer start");
                    }
                    let result = perform_transfer(&client, &request).await;
                    if verbose {
                        match &result {
                            Ok(r) => debug!(
                                request_id,
                                status = r.status_code,
                                latency_ms = r.timing.total_ms,
                                "transfer complete"
                            ),
                            Err(e) => debug!(
                                request_id,
                                kind = %e.kind,
                                error = %e.message,
                                "transfer failed"
                            ),
                        }
                    }
                    handler.complete(request_id, result);
                    shared.active.fetch_sub(1, Ordering::Relaxed);
                    shared.local_processed.fetch_add(1, Ordering::Relaxed);
                });
            }

            // One multiplex step: drive in-flight transfers until something
            // completes, a submission arrives, or the poll interval lapses.
            if !tasks.is_empty() {
                tokio::select! {
                    biased;
                    joined = tasks.join_next() => {
                        if let Some(Err(e)) = joined {
                            if e.is_panic() {
                                warn!(error = %e, "transfer task panicked");
                            }
                        }
                        while let Some(joined) = tasks.try_join_next() {
                            if let Err(e) = joined {
                                if e.is_panic() {
                                    warn!(error = %e, "transfer task panicked");
                                }
                            }
                        }
                    }
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep(poll_timeout) => {}
                }
            } else {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep(poll_timeout) => {}
                }
            }
        }
    });
}

/// Clients keyed by the request options reqwest fixes at build time.
/// A run reuses one request shape, so this holds one client in practice.
struct ClientCache {
    config: EventLoopConfig,
    resolver: Option<Arc<CachingResolver>>,
    clients: HashMap<ClientKey, reqwest::Client>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientKey {
    follow_redirects: bool,
    max_redirects: u32,
    verify_ssl: bool,
}

impl ClientCache {
    fn new(config: EventLoopConfig, resolver: Option<Arc<CachingResolver>>) -> Self {
        Self {
            config,
            resolver,
            clients: HashMap::new(),
        }
    }

    fn client_for(&mut self, request: &crate::types::Request) -> Result<reqwest::Client, EngineError> {
        let key = ClientKey {
            follow_redirects: request.follow_redirects,
            max_redirects: request.max_redirects,
            verify_ssl: request.verify_ssl,
        };
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, self.resolver.clone(), key)?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}

fn build_client(
    config: &EventLoopConfig,
    resolver: Option<Arc<CachingResolver>>,
    key: ClientKey,
) -> Result<reqwest::Client, EngineError> {
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .pool_max_idle_per_host(config.max_per_host)
        .user_agent(config.user_agent.clone());

    builder = if key.follow_redirects {
        builder.redirect(reqwest::redirect::Policy::limited(key.max_redirects as usize))
    } else {
        builder.redirect(reqwest::redirect::Policy::none())
    };

    if !key.verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder = if config.tcp_keepalive_idle_s > 0 {
        builder.tcp_keepalive(Some(Duration::from_secs(config.tcp_keepalive_idle_s)))
    } else {
        builder.tcp_keepalive(None)
    };

    if let Some(proxy_url) = &config.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| EngineError::ClientBuild(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    if let Some(resolver) = resolver {
        builder = builder.dns_resolver(resolver);
    }

    builder
        .build()
        .map_err(|e| EngineError::ClientBuild(e.to_string()))
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

/// Execute one transfer and build the engine-level response or error.
async fn perform_transfer(client: &reqwest::Client, request: &crate::types::Request) -> TransferResult {
    let started = Instant::now();

    let mut builder = client
        .request(to_reqwest_method(request.method), &request.url)
        .timeout(Duration::from_millis(request.timeout_ms.max(1)));

    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }

    if request.body.mode != BodyMode::None && !request.body.content.is_empty() {
        let has_content_type = request
            .headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            if let Some(content_type) = request.body.mode.default_content_type() {
                builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
            }
        }
        builder = builder.body(request.body.content.clone());
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => return Err(classify_reqwest_error(&e)),
    };
    let first_byte = started.elapsed();

    let status_code = response.status().as_u16();
    // Header names arrive lowercased; duplicates overwrite in arrival
    // order so the final value wins.
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        headers.insert(
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }

    let body = match response.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => return Err(classify_reqwest_error(&e)),
    };
    let total = started.elapsed();

    let timing = Timing {
        total_ms: total.as_secs_f64() * 1000.0,
        first_byte_ms: first_byte.as_secs_f64() * 1000.0,
        download_ms: (total - first_byte).as_secs_f64() * 1000.0,
        ..Default::default()
    };

    Ok(Response {
        status_code,
        status_text: status_text(status_code).to_string(),
        body_size: body.len(),
        headers,
        body,
        timing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::CompletionHandler;
    use crate::types::Request;
    use std::sync::mpsc;

    fn test_config() -> EventLoopConfig {
        EventLoopConfig {
            num_workers: 1,
            max_concurrent: 8,
            poll_timeout_ms: 5,
            dns_cache_timeout_s: 0,
            ..Default::default()
        }
    }

    fn request_for(url: &str) -> Request {
        Request {
            url: url.to_string(),
            timeout_ms: 2000,
            ..Default::default()
        }
    }

    #[test]
    fn test_worker_reports_connection_failure() {
        let worker = Worker::new(test_config(), None);
        worker.start();

        let (tx, rx) = mpsc::channel();
        let callback = CompletionHandler::Callback(Box::new(move |_, result| {
            tx.send(result).unwrap();
        }));
        worker
            .submit(TransferContext::new(1, request_for("http://127.0.0.1:1/"), callback))
            .unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionFailed);

        worker.stop(true);
        assert_eq!(worker.local_processed(), 1);
        assert_eq!(worker.active_count(), 0);
        assert_eq!(worker.pending_count(), 0);
    }

    #[test]
    fn test_worker_invalid_url_reported() {
        let worker = Worker::new(test_config(), None);
        worker.start();

        let (tx, rx) = mpsc::channel();
        let callback = CompletionHandler::Callback(Box::new(move |_, result| {
            tx.send(result).unwrap();
        }));
        worker
            .submit(TransferContext::new(
                1,
                request_for("http://[bad-host/"),
                callback,
            ))
            .unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_err());
        worker.stop(true);
    }

    #[test]
    fn test_stop_without_wait_cancels_queued() {
        // Worker never started: queued contexts are flushed as
        // cancellations when the loop starts in the stopped state.
        let worker = Worker::new(test_config(), None);

        let (tx, rx) = mpsc::channel();
        for id in 0..3u64 {
            let tx = tx.clone();
            let callback = CompletionHandler::Callback(Box::new(move |_, result| {
                tx.send(result).unwrap();
            }));
            worker
                .submit(TransferContext::new(id, request_for("http://127.0.0.1:1/"), callback))
                .unwrap();
        }

        worker.shared.cancel_pending.store(true, Ordering::Release);
        worker.shared.stop.store(true, Ordering::Release);
        worker.start();
        worker.stop(false);

        for _ in 0..3 {
            let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            let err = result.unwrap_err();
            assert_eq!(err.message, "Request cancelled");
        }
    }

    #[test]
    fn test_submit_backpressure_returns_context() {
        let config = EventLoopConfig {
            max_concurrent: 1,
            ..test_config()
        };
        let worker = Worker::new(config, None);
        // Not started: fill the queue to capacity.
        let capacity = {
            let mut count = 0u64;
            loop {
                let ctx =
                    TransferContext::new(count, request_for("http://127.0.0.1:1/"), CompletionHandler::Discard);
                match worker.submit(ctx) {
                    Ok(()) => count += 1,
                    Err(_) => break,
                }
            }
            count
        };
        assert!(capacity >= 1023);
        assert_eq!(worker.pending_count() as u64, capacity);
    }
}
