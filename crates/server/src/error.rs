//! API error handling

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tidecast_common::{ErrorKind, ServeError};
use tidecast_proto::{ErrorDetail, ErrorResponse};
use tracing::error;

/// Retry hint sent with queue-full rejections when none is configured
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// API error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: String,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.into(),
            message: msg.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::InvalidInput.as_str(), msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
    }

    /// Replace the retry hint on errors that carry one
    pub fn with_retry_after(mut self, secs: u64) -> Self {
        if self.retry_after.is_some() {
            self.retry_after = Some(secs);
        }
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: ErrorDetail {
                kind: self.kind,
                message: self.message,
            },
        });
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<ServeError> for ApiError {
    fn from(err: ServeError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::InvalidInput | ErrorKind::DegenerateTimebase => StatusCode::BAD_REQUEST,
            ErrorKind::ModelNotReady | ErrorKind::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::UpstreamFetchFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::InvalidArtifact | ErrorKind::Config | ErrorKind::Unhandled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(kind = %kind, error = %err, "Request failed with server error");
        }

        let mut api = Self::new(status, kind.as_str(), err.to_string());
        if kind == ErrorKind::QueueFull {
            api.retry_after = Some(DEFAULT_RETRY_AFTER_SECS);
        }
        api
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ServeError::invalid_input("x"), StatusCode::BAD_REQUEST),
            (ServeError::degenerate_timebase("x"), StatusCode::BAD_REQUEST),
            (ServeError::model_not_ready("x"), StatusCode::SERVICE_UNAVAILABLE),
            (ServeError::queue_full("x"), StatusCode::SERVICE_UNAVAILABLE),
            (ServeError::timeout("x"), StatusCode::GATEWAY_TIMEOUT),
            (ServeError::upstream("x"), StatusCode::BAD_GATEWAY),
            (ServeError::unhandled("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_retry_after_only_on_queue_full() {
        let full = ApiError::from(ServeError::queue_full("busy")).with_retry_after(5);
        let response = full.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");

        let not_ready = ApiError::from(ServeError::model_not_ready("no model")).with_retry_after(5);
        assert!(not_ready.retry_after.is_none());
    }
}
