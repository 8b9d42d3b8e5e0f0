//! Common error types for Tidecast
//!
//! This module defines the error taxonomy shared by the serving core and the
//! ingress API. Every error carries a stable [`ErrorKind`] so telemetry can
//! count failures by class and the API can map them onto HTTP status codes.

use std::fmt;
use thiserror::Error;

/// Main error type for Tidecast
#[derive(Error, Debug)]
pub enum ServeError {
    /// Malformed or inconsistent payload (never retried)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No model handle has been loaded yet
    #[error("Model not ready: {0}")]
    ModelNotReady(String),

    /// Admission queue is at capacity (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Timestamps collapse onto a zero sampling interval
    #[error("Degenerate timebase: {0}")]
    DegenerateTimebase(String),

    /// Artifact or dataset store unreachable
    #[error("Upstream fetch failure: {0}")]
    UpstreamFetchFailure(String),

    /// A fetched artifact failed validation
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    /// External request deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("Unhandled error: {0}")]
    Unhandled(String),
}

/// Stable classification of a [`ServeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    ModelNotReady,
    QueueFull,
    DegenerateTimebase,
    UpstreamFetchFailure,
    InvalidArtifact,
    Timeout,
    Config,
    Unhandled,
}

impl ErrorKind {
    /// Every kind, in label order
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::InvalidInput,
        ErrorKind::ModelNotReady,
        ErrorKind::QueueFull,
        ErrorKind::DegenerateTimebase,
        ErrorKind::UpstreamFetchFailure,
        ErrorKind::InvalidArtifact,
        ErrorKind::Timeout,
        ErrorKind::Config,
        ErrorKind::Unhandled,
    ];

    /// Label used for the `errors_total{kind}` metric and API error bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ModelNotReady => "model_not_ready",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::DegenerateTimebase => "degenerate_timebase",
            ErrorKind::UpstreamFetchFailure => "upstream_fetch_failure",
            ErrorKind::InvalidArtifact => "invalid_artifact",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Config => "config",
            ErrorKind::Unhandled => "unhandled_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServeError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServeError::InvalidInput(_) => ErrorKind::InvalidInput,
            ServeError::ModelNotReady(_) => ErrorKind::ModelNotReady,
            ServeError::QueueFull(_) => ErrorKind::QueueFull,
            ServeError::DegenerateTimebase(_) => ErrorKind::DegenerateTimebase,
            ServeError::UpstreamFetchFailure(_) => ErrorKind::UpstreamFetchFailure,
            ServeError::InvalidArtifact(_) => ErrorKind::InvalidArtifact,
            ServeError::Timeout(_) => ErrorKind::Timeout,
            ServeError::Config(_) => ErrorKind::Config,
            ServeError::Serialization(_) | ServeError::Io(_) | ServeError::Unhandled(_) => {
                ErrorKind::Unhandled
            }
        }
    }

    /// Whether an internal retry may succeed
    ///
    /// Only transient upstream failures qualify; validation and backpressure
    /// errors go straight back to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServeError::UpstreamFetchFailure(_))
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ServeError::InvalidInput(msg.into())
    }

    /// Create a model-not-ready error
    pub fn model_not_ready(msg: impl Into<String>) -> Self {
        ServeError::ModelNotReady(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        ServeError::QueueFull(msg.into())
    }

    /// Create a degenerate timebase error
    pub fn degenerate_timebase(msg: impl Into<String>) -> Self {
        ServeError::DegenerateTimebase(msg.into())
    }

    /// Create an upstream fetch failure
    pub fn upstream(msg: impl Into<String>) -> Self {
        ServeError::UpstreamFetchFailure(msg.into())
    }

    /// Create an invalid artifact error
    pub fn invalid_artifact(msg: impl Into<String>) -> Self {
        ServeError::InvalidArtifact(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ServeError::Timeout(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ServeError::Config(msg.into())
    }

    /// Create an unhandled error
    pub fn unhandled(msg: impl Into<String>) -> Self {
        ServeError::Unhandled(msg.into())
    }
}

/// Result type alias for Tidecast operations
pub type Result<T> = std::result::Result<T, ServeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_are_unique() {
        let mut labels: Vec<&str> = ErrorKind::ALL.iter().map(|k| k.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), ErrorKind::ALL.len());
    }

    #[test]
    fn test_only_upstream_is_retryable() {
        assert!(ServeError::upstream("s3 down").is_retryable());
        assert!(!ServeError::queue_full("full").is_retryable());
        assert!(!ServeError::invalid_input("bad").is_retryable());
        assert!(!ServeError::invalid_artifact("corrupt").is_retryable());
    }

    #[test]
    fn test_io_errors_classify_as_unhandled() {
        let err: ServeError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::Unhandled);
        assert_eq!(
            ServeError::degenerate_timebase("zero").kind().as_str(),
            "degenerate_timebase"
        );
    }
}
