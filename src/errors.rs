//! Engine error types and transfer-error classification.
//!
//! Transport failures from the HTTP client are mapped onto the engine's
//! error taxonomy so downstream reporting can distinguish timeouts, network
//! failures, DNS failures and TLS failures without parsing free-form text.

use thiserror::Error;

use crate::types::{ErrorKind, TransferError};

/// Errors raised while constructing or driving the engine itself (as
/// opposed to per-transfer failures, which use [`TransferError`]).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid rate limiter configuration: {0}")]
    InvalidRateLimit(String),

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Full error text including the source chain.
///
/// `reqwest::Error`'s `Display` is often just "error sending request"; the
/// useful detail (connection refused, dns failure, certificate problem)
/// lives in the source chain.
fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Classify a client error into the transfer-error taxonomy.
pub fn classify_reqwest_error(error: &reqwest::Error) -> TransferError {
    let message = error_chain(error);
    let lowered = message.to_lowercase();

    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else if error.is_builder() {
        // Request construction failures are malformed URLs in practice
        ErrorKind::InvalidUrl
    } else if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl")
    {
        ErrorKind::SslError
    } else if lowered.contains("dns") || lowered.contains("resolve") {
        ErrorKind::DnsError
    } else if error.is_connect()
        || lowered.contains("connect")
        || lowered.contains("connection")
    {
        ErrorKind::ConnectionFailed
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        ErrorKind::Timeout
    } else {
        ErrorKind::InternalError
    };

    TransferError::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_classified() {
        let client = reqwest::Client::new();
        let err = client.get("ht!tp://bad url").build().unwrap_err();
        let e = classify_reqwest_error(&err);
        assert_eq!(e.kind, ErrorKind::InvalidUrl);
    }

    #[tokio::test]
    async fn test_connection_refused_classified() {
        // Port 1 on localhost is refused essentially immediately.
        let client = reqwest::Client::new();
        let err = client
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .expect_err("connect must fail");
        let e = classify_reqwest_error(&err);
        assert_eq!(e.kind, ErrorKind::ConnectionFailed);
        assert!(!e.message.is_empty());
    }
}
