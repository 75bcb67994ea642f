//! Common types used throughout the engine.
//!
//! Requests, responses, timing breakdowns, the transfer error taxonomy and
//! the run lifecycle states. Everything here is plain data; behaviour lives
//! in the worker and metrics modules.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// HTTP methods supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Parse a method string. Returns `None` for anything outside the
    /// supported set; callers surface that as an `InvalidMethod` error.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "PATCH" => Some(HttpMethod::Patch),
            "HEAD" => Some(HttpMethod::Head),
            "OPTIONS" => Some(HttpMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header mapping. Response-side names are lowercased on receipt; duplicate
/// headers overwrite in arrival order (final value wins).
pub type Headers = BTreeMap<String, String>;

/// Request body content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BodyMode {
    #[default]
    None,
    Json,
    Text,
    Form,
    FormData,
    Binary,
    Graphql,
}

impl BodyMode {
    /// Content-Type applied when the request carries no explicit header.
    pub fn default_content_type(&self) -> Option<&'static str> {
        match self {
            BodyMode::None | BodyMode::Binary => None,
            BodyMode::Json | BodyMode::Graphql => Some("application/json"),
            BodyMode::Text => Some("text/plain"),
            BodyMode::Form => Some("application/x-www-form-urlencoded"),
            BodyMode::FormData => Some("multipart/form-data"),
        }
    }
}

/// Request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Body {
    pub mode: BodyMode,
    #[serde(default)]
    pub content: String,
}

/// An HTTP request definition. Immutable once handed to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Body,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> u32 {
    10
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            url: String::new(),
            headers: Headers::new(),
            body: Body::default(),
            timeout_ms: default_timeout_ms(),
            follow_redirects: true,
            max_redirects: default_max_redirects(),
            verify_ssl: true,
        }
    }
}

/// Timing breakdown for a completed transfer, in milliseconds.
///
/// The dns/connect/tls phases are not observable per-request through the
/// client stack; they report 0.0 while total, first-byte and download are
/// measured around the transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timing {
    pub total_ms: f64,
    pub dns_ms: f64,
    pub connect_ms: f64,
    pub tls_ms: f64,
    pub first_byte_ms: f64,
    pub download_ms: f64,
}

/// An HTTP response as recorded by a worker.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status_code: u16,
    pub status_text: String,
    /// Lowercased header names; duplicates resolved last-value-wins.
    pub headers: Headers,
    pub body: Vec<u8>,
    pub body_size: usize,
    pub timing: Timing,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code)
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Status text for common HTTP codes. Uncommon codes map to "Unknown"
/// rather than allocating per-code strings.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Transfer error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    None,
    Timeout,
    ConnectionFailed,
    DnsError,
    SslError,
    InvalidUrl,
    InvalidMethod,
    ScriptError,
    InternalError,
}

impl ErrorKind {
    /// Stable snake_case label used in error trace payloads.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::DnsError => "dns_failed",
            ErrorKind::SslError => "ssl_error",
            ErrorKind::InvalidUrl => "invalid_url",
            ErrorKind::InvalidMethod => "invalid_method",
            ErrorKind::ScriptError => "script_error",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Numeric code carried in error trace payloads.
    pub fn code(&self) -> u8 {
        match self {
            ErrorKind::None => 0,
            ErrorKind::Timeout => 1,
            ErrorKind::ConnectionFailed => 2,
            ErrorKind::DnsError => 3,
            ErrorKind::SslError => 4,
            ErrorKind::InvalidUrl => 5,
            ErrorKind::InvalidMethod => 6,
            ErrorKind::ScriptError => 7,
            ErrorKind::InternalError => 8,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A failed transfer: exactly one of `Response` or `TransferError` is
/// produced per completed transfer.
#[derive(Debug, Clone)]
pub struct TransferError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The synthetic error delivered to queued transfers flushed on
    /// non-waiting shutdown.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::InternalError, "Request cancelled")
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.label(), self.message)
    }
}

/// Outcome of a single transfer.
pub type TransferResult = Result<Response, TransferError>;

/// Run lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment variables handed to test scripts.
pub type Environment = BTreeMap<String, String>;
