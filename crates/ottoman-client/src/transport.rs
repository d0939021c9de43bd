use std::fmt;

use serde_json::Value;

use crate::error::TransportResult;

/// HTTP verbs used by the document protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded store response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `error` member of a CouchDB error body, or `"unknown"`.
    pub fn error_name(&self) -> &str {
        self.body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    /// The `reason` member of a CouchDB error body, or `""`.
    pub fn reason(&self) -> &str {
        self.body
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Synchronous request/response primitive the engine is built on.
///
/// Bodies are JSON in both directions. Implementations decide on timeouts,
/// connection handling and retries; callers assume none of them.
pub trait Transport: Send + Sync {
    /// Issue one request and wait for its response.
    ///
    /// `path` includes the query string. Returns `Err` only when no usable
    /// response was obtained; non-2xx statuses are ordinary responses.
    fn request(&self, method: Method, path: &str, body: Option<&Value>) -> TransportResult<Response>;
}
