//! Per-transfer state.
//!
//! A [`TransferContext`] travels from the submitter through the dispatch
//! queue into a worker, which owns it exclusively until completion. The two
//! completion styles — fire a callback, or fulfil a one-shot slot a waiter
//! is blocked on — are variants of one [`CompletionHandler`] sum type so
//! the worker dispatches without caring which was requested.

use tokio::sync::oneshot;

use crate::types::{ErrorKind, Request, TransferError, TransferResult};

/// Callback invoked when a transfer completes. Must be safe to call from
/// any worker thread.
pub type TransferCallback = Box<dyn FnOnce(u64, TransferResult) + Send>;

/// How a completed transfer reports its outcome.
pub enum CompletionHandler {
    /// Fire-and-forget; the outcome is dropped.
    Discard,
    /// Invoke a callback with the request id and outcome.
    Callback(TransferCallback),
    /// Fulfil a one-shot slot a synchronous or async waiter holds.
    Slot(oneshot::Sender<TransferResult>),
}

impl CompletionHandler {
    /// Deliver the outcome. Consumes the handler: a transfer completes
    /// exactly once.
    pub fn complete(self, request_id: u64, result: TransferResult) {
        match self {
            CompletionHandler::Discard => {}
            CompletionHandler::Callback(callback) => callback(request_id, result),
            CompletionHandler::Slot(sender) => {
                // A dropped receiver just means nobody is waiting anymore.
                let _ = sender.send(result);
            }
        }
    }
}

impl std::fmt::Debug for CompletionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionHandler::Discard => f.write_str("Discard"),
            CompletionHandler::Callback(_) => f.write_str("Callback"),
            CompletionHandler::Slot(_) => f.write_str("Slot"),
        }
    }
}

/// State bag for one in-flight request. Created on submission; destroyed
/// once the completion handler has fired.
#[derive(Debug)]
pub struct TransferContext {
    /// Monotonic id allocated by the dispatcher.
    pub request_id: u64,
    pub request: Request,
    pub handler: CompletionHandler,
}

impl TransferContext {
    pub fn new(request_id: u64, request: Request, handler: CompletionHandler) -> Self {
        Self {
            request_id,
            request,
            handler,
        }
    }

    /// Complete this transfer as cancelled (queued but never executed).
    pub fn cancel(self) {
        let id = self.request_id;
        self.handler.complete(id, Err(TransferError::cancelled()));
    }
}

/// Handle returned by `submit_async`: the request id plus a waitable slot.
#[derive(Debug)]
pub struct RequestHandle {
    pub id: u64,
    receiver: oneshot::Receiver<TransferResult>,
}

impl RequestHandle {
    pub fn new(id: u64, receiver: oneshot::Receiver<TransferResult>) -> Self {
        Self { id, receiver }
    }

    /// Block until the transfer resolves. Must not be called from inside an
    /// async runtime.
    pub fn wait(self) -> TransferResult {
        self.receiver.blocking_recv().unwrap_or_else(|_| {
            Err(TransferError::new(
                ErrorKind::InternalError,
                "worker dropped the transfer",
            ))
        })
    }

    /// Await the transfer from async contexts.
    pub async fn wait_async(self) -> TransferResult {
        self.receiver.await.unwrap_or_else(|_| {
            Err(TransferError::new(
                ErrorKind::InternalError,
                "worker dropped the transfer",
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callback_handler_fires_once() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_inner = seen.clone();
        let handler = CompletionHandler::Callback(Box::new(move |id, result| {
            assert!(result.is_err());
            seen_inner.store(id, Ordering::SeqCst);
        }));
        handler.complete(42, Err(TransferError::cancelled()));
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_slot_handler_delivers_to_waiter() {
        let (tx, rx) = oneshot::channel();
        let handle = RequestHandle::new(7, rx);
        CompletionHandler::Slot(tx).complete(7, Err(TransferError::cancelled()));
        let result = handle.wait();
        let err = result.unwrap_err();
        assert_eq!(err.message, "Request cancelled");
    }

    #[test]
    fn test_wait_survives_dropped_worker() {
        let (tx, rx) = oneshot::channel::<TransferResult>();
        drop(tx);
        let handle = RequestHandle::new(1, rx);
        let err = handle.wait().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
    }

    #[test]
    fn test_cancel_reports_synthetic_error() {
        let (tx, rx) = oneshot::channel();
        let ctx = TransferContext::new(
            3,
            Request::default(),
            CompletionHandler::Slot(tx),
        );
        ctx.cancel();
        let err = RequestHandle::new(3, rx).wait().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert_eq!(err.message, "Request cancelled");
    }
}
