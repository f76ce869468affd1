use std::fmt;

use serde_json::Value;
use thiserror::Error;

pub mod encoder;
pub mod truncate;
pub mod upload;
pub mod writer;

pub const UNEXPECTED_RESPONSE_MESSAGE: &str = "Unexpected APM Server response";

/// Kind tag of a record on the intake wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Metadata,
    Transaction,
    Span,
    Error,
    Metricset,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Metadata => "metadata",
            EventKind::Transaction => "transaction",
            EventKind::Span => "span",
            EventKind::Error => "error",
            EventKind::Metricset => "metricset",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to the APM Server that failed or was rejected.
///
/// `code` is absent when no response was received at all.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct RequestError {
    pub code: Option<u16>,
    pub message: String,
    pub accepted: Option<u64>,
    pub errors: Option<Vec<Value>>,
    pub response: Option<String>,
}

impl RequestError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        RequestError {
            code: None,
            message: message.into(),
            accepted: None,
            errors: None,
            response: None,
        }
    }

    pub(crate) fn network(context: &str, err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("{context}: request timed out")
        } else {
            format!("{context}: {err}")
        };
        RequestError {
            code: err.status().map(|s| s.as_u16()),
            ..RequestError::new(message)
        }
    }

    /// Builds the error for a non-2xx intake response.
    ///
    /// JSON bodies are mined for the `accepted` and `errors` fields, any other
    /// non-empty body is kept verbatim.
    pub(crate) fn from_intake_response(status: u16, content_type: Option<&str>, body: &str) -> Self {
        let mut err = RequestError {
            code: Some(status),
            ..RequestError::new(UNEXPECTED_RESPONSE_MESSAGE)
        };

        let is_json = content_type.is_some_and(|ct| ct.contains("application/json"));
        if is_json {
            if let Ok(Value::Object(parsed)) = serde_json::from_str::<Value>(body) {
                err.accepted = parsed.get("accepted").and_then(Value::as_u64);
                err.errors = parsed.get("errors").and_then(Value::as_array).cloned();
            }
        }
        if err.accepted.is_none() && err.errors.is_none() && !body.is_empty() {
            err.response = Some(body.to_string());
        }
        err
    }
}
