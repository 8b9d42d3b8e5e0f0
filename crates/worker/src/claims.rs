//! Claim-check consumer
//!
//! Claim-check messages reference a stored dataset instead of carrying it.
//! The consumer fetches the dataset with bounded retries, replaces the
//! shared reference dataset wholesale and routes a request-local copy
//! through the same admission queue as interactive traffic.
//!
//! Served predictions are appended to a JSON-lines log in the artifact
//! store and announced on an output channel. Failed claims and failed log
//! writes go to a dead-letter channel.

use crate::artifact::ArtifactStore;
use crate::features::Frame;
use crate::inference::{InferenceRequest, Prediction};
use crate::retry::RetryPolicy;
use crate::service::InferenceService;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tidecast_common::{Result, ServeError};
use tidecast_proto::{
    ClaimCheck, ErrorEvent, InferenceEvent, PredictionRecord, STATUS_FAILURE, STATUS_SUCCESS,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Operation label of a claim-check inference
pub const OPERATION_CLAIM: &str = "Inference";
/// Operation label of a prediction log write
pub const OPERATION_LOG_WRITE: &str = "Prediction Log Write";

/// Where served predictions are logged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionLog {
    pub bucket: String,
    pub identifier: String,
}

impl PredictionLog {
    pub fn new(bucket: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            identifier: identifier.into(),
        }
    }

    /// Object key for records written at `at`: one object per identifier and UTC day
    pub fn key(&self, at: DateTime<Utc>) -> String {
        format!("{}/{}/results.jsonl", self.identifier, at.format("%Y%m%d"))
    }
}

/// Consumes claim checks one at a time
pub struct ClaimConsumer {
    service: InferenceService,
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
    log: Option<PredictionLog>,
    events: Option<mpsc::Sender<InferenceEvent>>,
    dead_letters: Option<mpsc::Sender<ErrorEvent>>,
}

impl ClaimConsumer {
    pub fn new(
        service: InferenceService,
        store: Arc<dyn ArtifactStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            store,
            retry,
            log: None,
            events: None,
            dead_letters: None,
        }
    }

    /// Append every served prediction to `log`
    pub fn with_prediction_log(mut self, log: PredictionLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Announce served predictions on `events`
    pub fn with_events(mut self, events: mpsc::Sender<InferenceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Report failures on `dead_letters`
    pub fn with_dead_letters(mut self, dead_letters: mpsc::Sender<ErrorEvent>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Process one claim check
    ///
    /// The prediction is logged and announced before it is returned. A
    /// failed log write is reported as a dead letter and does not fail the
    /// claim.
    pub async fn process(&self, claim: &ClaimCheck) -> Result<Prediction> {
        let (frame, length) = self.prepare(claim).await.map_err(|e| {
            self.service.telemetry().record_error(e.kind(), None);
            e
        })?;

        self.service.dataset().replace(frame.clone());
        let prediction = self
            .service
            .predict(InferenceRequest::inline(frame, length))
            .await?;
        self.publish(claim, &prediction).await;
        Ok(prediction)
    }

    async fn prepare(&self, claim: &ClaimCheck) -> Result<(Frame, usize)> {
        let (bucket, key) = (claim.bucket.as_str(), claim.key.as_str());
        let dataset = self
            .retry
            .run("claim-check dataset", || self.store.fetch_dataset(bucket, key))
            .await?;
        let frame = Frame::from_payload(&dataset.data, dataset.index_col.as_deref())?;

        let settings = self.service.settings();
        let length = claim
            .inference_length
            .unwrap_or(settings.default_inference_length);
        if length == 0 || length > settings.max_inference_length {
            return Err(ServeError::invalid_input(format!(
                "inference_length must be within 1..={}",
                settings.max_inference_length
            )));
        }
        Ok((frame, length))
    }

    async fn publish(&self, claim: &ClaimCheck, prediction: &Prediction) {
        let now = Utc::now();
        let response = prediction.to_response(false);
        let identifier = self
            .log
            .as_ref()
            .map(|log| log.identifier.clone())
            .unwrap_or_else(|| "default".to_string());

        let mut stored_at = None;
        if let Some(log) = &self.log {
            let key = log.key(now);
            let record = PredictionRecord {
                timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
                identifier: identifier.clone(),
                req_id: response.req_id.clone(),
                claim_id: claim.request_id.clone(),
                source_bucket: claim.bucket.clone(),
                source_key: claim.key.clone(),
                model_id: response.model_id.clone(),
                model_kind: response.model_kind.clone(),
                status: STATUS_SUCCESS.to_string(),
                rows_predicted: response.timestamps.len(),
                timestamps: response.timestamps.clone(),
                predictions: response.predictions.clone(),
            };

            let written = self
                .retry
                .run("prediction log", || {
                    self.store.append_prediction(&log.bucket, &key, &record)
                })
                .await;
            match written {
                Ok(()) => {
                    debug!(bucket = %log.bucket, key = %key, req_id = %record.req_id, "Prediction logged");
                    stored_at = Some((log.bucket.clone(), key));
                }
                Err(e) => {
                    error!(bucket = %log.bucket, key = %key, error = %e, "Failed to log prediction");
                    let payload = serde_json::json!({
                        "bucket": log.bucket,
                        "key": key,
                        "req_id": record.req_id,
                        "attempts": self.retry.max_attempts,
                    });
                    self.dead_letter(OPERATION_LOG_WRITE, &e, payload).await;
                }
            }
        }

        if let Some(events) = &self.events {
            let (log_bucket, log_object_key) = stored_at.unzip();
            let event = InferenceEvent {
                operation: OPERATION_CLAIM.to_string(),
                status: STATUS_SUCCESS.to_string(),
                identifier,
                req_id: response.req_id,
                claim_id: claim.request_id.clone(),
                model_id: response.model_id,
                model_kind: response.model_kind,
                rows: response.timestamps.len(),
                log_bucket,
                log_object_key,
            };
            if events.send(event).await.is_err() {
                warn!("Output channel closed; inference event dropped");
            }
        }
    }

    async fn dead_letter(&self, operation: &str, err: &ServeError, payload: serde_json::Value) {
        let Some(dead_letters) = &self.dead_letters else {
            return;
        };
        let event = ErrorEvent {
            operation: operation.to_string(),
            status: STATUS_FAILURE.to_string(),
            kind: err.kind().to_string(),
            error: err.to_string(),
            payload,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        if dead_letters.send(event).await.is_err() {
            warn!(operation, "Dead-letter channel closed; failure report dropped");
        }
    }

    /// Consume messages until the channel closes
    pub async fn run(self, mut claims: mpsc::Receiver<ClaimCheck>) {
        info!("Claim-check consumer started");
        while let Some(claim) = claims.recv().await {
            let tag = claim.request_id.clone().unwrap_or_default();
            match self.process(&claim).await {
                Ok(prediction) => info!(
                    claim = %tag,
                    bucket = %claim.bucket,
                    key = %claim.key,
                    request_id = %prediction.request_id,
                    model_id = %prediction.model_id,
                    "Claim check served"
                ),
                Err(e) => {
                    if let ServeError::UpstreamFetchFailure(_) = e {
                        error!(
                            claim = %tag,
                            bucket = %claim.bucket,
                            key = %claim.key,
                            error = %e,
                            "Claim-check dataset unavailable"
                        );
                    } else {
                        warn!(
                            claim = %tag,
                            bucket = %claim.bucket,
                            key = %claim.key,
                            kind = %e.kind(),
                            error = %e,
                            "Claim check failed"
                        );
                    }
                    let payload = serde_json::to_value(&claim).unwrap_or(serde_json::Value::Null);
                    self.dead_letter(OPERATION_CLAIM, &e, payload).await;
                }
            }
        }
        info!("Claim-check channel closed");
    }
}
