//! Worker error types

use std::time::Duration;
use thiserror::Error;

/// Answerer failure with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl WorkerError {
    pub fn new(kind: WorkerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::RateLimit, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::ServerError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::InvalidRequest, message)
    }

    pub fn unknown_model(model_id: &str) -> Self {
        Self::new(WorkerErrorKind::UnknownModel, format!("no answerer for model '{model_id}'"))
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Unknown, message)
    }

    /// Classify an HTTP failure from a remote answerer
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            429 => {
                let mut err = Self::rate_limit(format!("Rate limited: {body}"));
                if let Some(secs) = serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|v| v.get("retry_after").and_then(serde_json::Value::as_f64))
                {
                    err = err.with_retry_after(Duration::from_secs_f64(secs));
                }
                err
            }
            400 | 404 | 422 => Self::invalid_request(format!("Invalid request: {body}")),
            500..=599 => Self::server_error(format!("Server error: {body}")),
            _ => Self::unknown(format!("HTTP {status}: {body}")),
        }
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorKind {
    /// Network issues, timeouts - retryable
    Network,
    /// Rate limited (429) - retryable with backoff
    RateLimit,
    /// Server error (5xx) - retryable
    ServerError,
    /// Bad request - not retryable
    InvalidRequest,
    /// Model id not served by this worker
    UnknownModel,
    Unknown,
}

impl WorkerErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::ServerError)
    }
}
