//! Tidecast wire types
//!
//! Serde messages exchanged over the HTTP surface and the internal message
//! channels (promotion events, claim checks and their output events).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Status string of a freshly computed forecast
pub const STATUS_SUCCESS: &str = "SUCCESS";
/// Status string of a forecast answered from the last-prediction cache
pub const STATUS_SUCCESS_CACHED: &str = "SUCCESS_CACHED";

// Prediction

/// Body of `POST /predict`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Named columns of equal length; `None` selects the cached dataset
    #[serde(default)]
    pub data: Option<BTreeMap<String, Vec<Value>>>,

    /// Name of the timestamp column
    #[serde(default)]
    pub index_col: Option<String>,

    /// Forecast horizon in steps
    #[serde(default)]
    pub inference_length: Option<usize>,
}

/// Response of `POST /predict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub status: String,
    pub model_id: String,
    pub model_kind: String,
    /// RFC 3339 forecast timestamps
    pub timestamps: Vec<String>,
    /// Forecast values per feature, aligned with `timestamps`
    pub predictions: BTreeMap<String, Vec<f64>>,
    pub req_id: String,
    #[serde(default)]
    pub cached: bool,
}

// Promotion channel

/// Pointer to a promoted model, produced by the evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionPointer {
    pub model_id: String,
    pub model_kind: String,
    pub artifact_uri: String,
    #[serde(default)]
    pub score: Option<f64>,
    pub config_fingerprint: String,
    /// Promotion time, RFC 3339
    pub timestamp: String,
}

/// Response of `POST /promote`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteAccepted {
    pub status: String,
    pub model_id: String,
}

/// Response of `POST /reload_latest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    /// `loaded` or `not_loaded`
    pub status: String,
    pub model_id: Option<String>,
    pub model_kind: Option<String>,
}

// Claim-check channel

/// Message referencing a stored dataset object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimCheck {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub inference_length: Option<usize>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Stored dataset object addressed by a [`ClaimCheck`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetObject {
    pub data: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub index_col: Option<String>,
}

/// Response of `POST /claims`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimAccepted {
    pub status: String,
    pub bucket: String,
    pub key: String,
}

// Prediction output

/// Status string of a failed operation reported on the dead-letter channel
pub const STATUS_FAILURE: &str = "FAILURE";

/// One line of the prediction log, appended per served claim check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Write time, RFC 3339
    pub timestamp: String,
    /// Deployment identifier the log is partitioned by
    pub identifier: String,
    pub req_id: String,
    #[serde(default)]
    pub claim_id: Option<String>,
    pub source_bucket: String,
    pub source_key: String,
    pub model_id: String,
    pub model_kind: String,
    pub status: String,
    pub rows_predicted: usize,
    pub timestamps: Vec<String>,
    pub predictions: BTreeMap<String, Vec<f64>>,
}

/// Confirmation emitted on the output channel for every served claim check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceEvent {
    pub operation: String,
    pub status: String,
    pub identifier: String,
    pub req_id: String,
    #[serde(default)]
    pub claim_id: Option<String>,
    pub model_id: String,
    pub model_kind: String,
    pub rows: usize,
    /// Where the prediction line was stored, when the log is enabled
    #[serde(default)]
    pub log_bucket: Option<String>,
    #[serde(default)]
    pub log_object_key: Option<String>,
}

/// Message sent to the dead-letter channel when an operation fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub operation: String,
    pub status: String,
    /// Error kind label, as used by `inference_errors_total{kind}`
    pub kind: String,
    pub error: String,
    /// The message or object the operation was working on
    pub payload: Value,
    /// Failure time, RFC 3339
    pub timestamp: String,
}

// Administration

/// Body of `POST /scale_workers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleWorkersRequest {
    pub workers: usize,
}

/// Response of `POST /scale_workers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleWorkersResponse {
    pub previous: usize,
    pub workers: usize,
}

// Health

/// Response of `GET /healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_ready: bool,
    pub queue_length: usize,
    pub uptime_secs: u64,
}

/// Response of `GET /ready`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub model_id: Option<String>,
    pub model_kind: Option<String>,
}

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_predict_request() {
        let req: PredictRequest = serde_json::from_str("{}").unwrap();
        assert!(req.data.is_none());
        assert!(req.inference_length.is_none());
    }

    #[test]
    fn test_predict_request_with_data() {
        let body = r#"{"data":{"ts":["2024-01-01","2024-01-02"],"load":[1.5,null]},"inference_length":3}"#;
        let req: PredictRequest = serde_json::from_str(body).unwrap();
        let data = req.data.unwrap();
        assert_eq!(data["load"][1], Value::Null);
        assert_eq!(req.inference_length, Some(3));
    }

    #[test]
    fn test_inference_event_without_log_location() {
        let body = r#"{
            "operation": "Inference",
            "status": "SUCCESS",
            "identifier": "default",
            "req_id": "8c1d",
            "model_id": "run-42",
            "model_kind": "naive",
            "rows": 3
        }"#;
        let event: InferenceEvent = serde_json::from_str(body).unwrap();
        assert!(event.claim_id.is_none());
        assert!(event.log_object_key.is_none());
    }

    #[test]
    fn test_promotion_pointer_without_score() {
        let body = r#"{
            "model_id": "run-42",
            "model_kind": "gru",
            "artifact_uri": "runs:/run-42/model",
            "config_fingerprint": "abc",
            "timestamp": "2024-05-01T10:00:00Z"
        }"#;
        let pointer: PromotionPointer = serde_json::from_str(body).unwrap();
        assert_eq!(pointer.model_id, "run-42");
        assert!(pointer.score.is_none());
    }
}
