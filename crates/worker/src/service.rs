//! Inference service
//!
//! Wires the admission queue, worker pool, model registry, shared caches
//! and telemetry into one serving core. Every input path (HTTP, claim
//! checks) goes through [`InferenceService::enqueue`], and a single
//! dispatcher task moves admitted work onto the pool.

use crate::dataset::{DatasetCache, PredictionCache};
use crate::features::Frame;
use crate::inference::{self, InferenceRequest, Prediction, RequestInput};
use crate::pool::WorkerPool;
use crate::queue::{AdmissionQueue, QueueEntry, Sequence};
use crate::registry::ModelRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidecast_common::config::ServeConfig;
use tidecast_common::{ErrorKind, Result, ServeError, Telemetry, TelemetrySnapshot};
use tidecast_proto::{PredictRequest, PredictResponse};
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Request-handling settings taken from [`ServeConfig`]
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub request_timeout: Option<Duration>,
    pub simulated_delay: Duration,
    pub default_inference_length: usize,
    pub max_inference_length: usize,
    pub serve_cached_prediction: bool,
}

impl From<&ServeConfig> for ServiceSettings {
    fn from(config: &ServeConfig) -> Self {
        Self {
            workers: config.worker.max_concurrency,
            queue_capacity: config.queue.capacity,
            request_timeout: config.request_timeout(),
            simulated_delay: Duration::from_millis(config.worker.simulated_delay_ms),
            default_inference_length: config.inference.default_inference_length,
            max_inference_length: config.inference.max_inference_length,
            serve_cached_prediction: config.inference.serve_cached_prediction,
        }
    }
}

/// Admitted work waiting for a slot
struct Job {
    request: InferenceRequest,
    reply: oneshot::Sender<Result<Prediction>>,
}

struct Inner {
    settings: ServiceSettings,
    queue: Arc<AdmissionQueue<Job>>,
    pool: Arc<WorkerPool>,
    registry: Arc<ModelRegistry>,
    dataset: DatasetCache,
    predictions: PredictionCache,
    telemetry: Telemetry,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the serving core
#[derive(Clone)]
pub struct InferenceService {
    inner: Arc<Inner>,
}

/// Withdraws a still-queued entry when dropped
pub struct QueueTicket {
    seq: Sequence,
    queue: Arc<AdmissionQueue<Job>>,
    telemetry: Telemetry,
    armed: bool,
}

impl QueueTicket {
    /// Withdraw the entry without counting it as cancelled
    fn withdraw(&mut self) -> bool {
        self.armed = false;
        self.queue.cancel(self.seq)
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.armed && self.queue.cancel(self.seq) {
            self.telemetry.record_cancelled();
        }
    }
}

/// A prediction that has been admitted but not yet answered
///
/// Dropping it before a worker picks the request up removes the request
/// from the queue. After that point the worker finishes and the result is
/// discarded.
pub struct PendingPrediction {
    request_id: Uuid,
    rx: oneshot::Receiver<Result<Prediction>>,
    ticket: QueueTicket,
}

impl PendingPrediction {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Wait for the result
    pub async fn wait(self) -> Result<Prediction> {
        let PendingPrediction { rx, mut ticket, .. } = self;
        let result = rx.await;
        ticket.disarm();
        result.unwrap_or_else(|_| Err(ServeError::unhandled("Request was dropped before completion")))
    }

    /// Wait for the result, giving up after `deadline`
    pub async fn wait_for(self, deadline: Duration) -> Result<Prediction> {
        let PendingPrediction {
            request_id,
            mut rx,
            mut ticket,
        } = self;

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(result) => {
                ticket.disarm();
                result.unwrap_or_else(|_| {
                    Err(ServeError::unhandled("Request was dropped before completion"))
                })
            }
            Err(_) => {
                if ticket.withdraw() {
                    ticket.telemetry.record_error(ErrorKind::Timeout, None);
                }
                warn!(%request_id, deadline_ms = deadline.as_millis() as u64, "Request deadline elapsed");
                Err(ServeError::timeout(format!(
                    "No result within {} ms",
                    deadline.as_millis()
                )))
            }
        }
    }
}

/// JSON view served by `GET /metrics`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    #[serde(flatten)]
    pub telemetry: TelemetrySnapshot,
    pub peak_active_workers: usize,
    pub queue_capacity: usize,
    pub queue_high_water: usize,
    pub model_id: Option<String>,
    pub model_kind: Option<String>,
    pub model_loaded_at: Option<DateTime<Utc>>,
    pub dataset_cached: bool,
}

impl InferenceService {
    pub fn new(settings: ServiceSettings, registry: Arc<ModelRegistry>, telemetry: Telemetry) -> Self {
        let queue = Arc::new(AdmissionQueue::new(settings.queue_capacity, telemetry.clone()));
        let pool = Arc::new(WorkerPool::new(settings.workers, telemetry.clone()));
        Self {
            inner: Arc::new(Inner {
                settings,
                queue,
                pool,
                registry,
                dataset: DatasetCache::new(),
                predictions: PredictionCache::new(),
                telemetry,
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Start the dispatcher task; calling it again has no effect
    pub fn start(&self) {
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let service = self.clone();
        *dispatcher = Some(tokio::spawn(async move { service.dispatch_loop().await }));
        info!(
            workers = self.inner.settings.workers,
            queue_capacity = self.inner.settings.queue_capacity,
            "Inference dispatcher started"
        );
    }

    async fn dispatch_loop(self) {
        loop {
            // Idle dispatchers hold no slot; queued work stays visible until a slot frees
            if !self.inner.queue.wait_pending().await {
                break;
            }
            let permit = match self.inner.pool.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // The entry may have been cancelled while waiting for the slot
            let Some(entry) = self.inner.queue.try_dequeue() else {
                drop(permit);
                continue;
            };
            let service = self.clone();
            tokio::spawn(async move { service.execute(entry, permit).await });
        }
        debug!("Dispatcher stopped");
    }

    async fn execute(self, entry: QueueEntry<Job>, permit: OwnedSemaphorePermit) {
        let inner = &self.inner;
        inner.telemetry.record_queue_wait(entry.waited());
        let started = Instant::now();
        let active = inner.pool.enter();

        let Job { request, reply } = entry.item;
        let request_id = request.id;

        if !inner.settings.simulated_delay.is_zero() {
            tokio::time::sleep(inner.settings.simulated_delay).await;
        }

        let result = self.run(request).await;
        let latency = started.elapsed();
        match &result {
            Ok(prediction) => {
                inner.telemetry.record_success(latency);
                inner.predictions.store(prediction.clone());
                debug!(
                    %request_id,
                    model_id = %prediction.model_id,
                    latency_ms = latency.as_millis() as u64,
                    "Request served"
                );
            }
            Err(e) => {
                inner.telemetry.record_error(e.kind(), Some(latency));
                match e.kind() {
                    ErrorKind::Unhandled => {
                        error!(%request_id, error = %e, "Request failed")
                    }
                    kind => warn!(%request_id, kind = %kind, error = %e, "Request failed"),
                }
            }
        }

        drop(active);
        drop(permit);
        if reply.send(result).is_err() {
            debug!(%request_id, "Caller went away; result discarded");
        }
    }

    /// Capture the model, build request-local data and compute
    async fn run(&self, request: InferenceRequest) -> Result<Prediction> {
        let handle = self
            .inner
            .registry
            .current()
            .ok_or_else(|| ServeError::model_not_ready("No model has been loaded"))?;

        let frame = match request.input {
            RequestInput::Inline(frame) => frame,
            RequestInput::Cached => self.inner.dataset.snapshot().ok_or_else(|| {
                ServeError::invalid_input("No data in request and no cached dataset")
            })?,
        };

        let request_id = request.id;
        let horizon = request.inference_length;
        self.inner
            .pool
            .compute(move || inference::predict(&handle, request_id, &frame, horizon))
            .await
    }

    /// Admit a request without waiting
    pub fn enqueue(&self, request: InferenceRequest) -> Result<PendingPrediction> {
        let inner = &self.inner;
        if !inner.registry.is_ready() {
            return Err(self.reject(ServeError::model_not_ready("No model has been loaded")));
        }

        let request_id = request.id;
        let (reply, rx) = oneshot::channel();
        let seq = inner
            .queue
            .enqueue(Job { request, reply })
            .map_err(|e| self.reject(e))?;

        Ok(PendingPrediction {
            request_id,
            rx,
            ticket: QueueTicket {
                seq,
                queue: inner.queue.clone(),
                telemetry: inner.telemetry.clone(),
                armed: true,
            },
        })
    }

    /// Admit a request and wait for its result
    ///
    /// Honors the configured request deadline, if any.
    pub async fn predict(&self, request: InferenceRequest) -> Result<Prediction> {
        let pending = self.enqueue(request)?;
        match self.inner.settings.request_timeout {
            Some(deadline) => pending.wait_for(deadline).await,
            None => pending.wait().await,
        }
    }

    /// Serve a wire request
    ///
    /// `query_length` overrides the body's `inference_length`.
    pub async fn handle(
        &self,
        request: PredictRequest,
        query_length: Option<usize>,
    ) -> Result<PredictResponse> {
        let settings = &self.inner.settings;
        let explicit_length = query_length.or(request.inference_length);

        if request.data.is_none() && explicit_length.is_none() && settings.serve_cached_prediction {
            if let Some(last) = self.inner.predictions.get() {
                self.inner.telemetry.record_served_cached();
                return Ok(last.to_response(true));
            }
        }

        let length = explicit_length.unwrap_or(settings.default_inference_length);
        if length == 0 || length > settings.max_inference_length {
            return Err(self.reject(ServeError::invalid_input(format!(
                "inference_length must be within 1..={}",
                settings.max_inference_length
            ))));
        }

        let input = match &request.data {
            Some(data) => {
                let frame = Frame::from_payload(data, request.index_col.as_deref())
                    .map_err(|e| self.reject(e))?;
                RequestInput::Inline(frame)
            }
            None => RequestInput::Cached,
        };

        let prediction = self.predict(InferenceRequest::new(input, length)).await?;
        Ok(prediction.to_response(false))
    }

    /// Count an error raised before the request reached a worker
    fn reject(&self, error: ServeError) -> ServeError {
        self.inner.telemetry.record_error(error.kind(), None);
        debug!(kind = %error.kind(), error = %error, "Request rejected at admission");
        error
    }

    /// Resize the worker pool, returning the previous size
    pub fn scale_workers(&self, workers: usize) -> Result<usize> {
        self.inner.pool.resize(workers)
    }

    /// Stop accepting work and fail everything still queued
    pub fn shutdown(&self) {
        let drained = self.inner.queue.close();
        let count = drained.len();
        for entry in drained {
            self.inner
                .telemetry
                .record_error(ErrorKind::ModelNotReady, None);
            let _ = entry
                .item
                .reply
                .send(Err(ServeError::model_not_ready("Service is shutting down")));
        }
        self.inner.pool.close();
        info!(drained = count, "Inference service shut down");
    }

    pub fn is_ready(&self) -> bool {
        self.inner.registry.is_ready()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn dataset(&self) -> &DatasetCache {
        &self.inner.dataset
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.inner.telemetry
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Build the JSON metrics view
    pub fn report(&self) -> ServiceReport {
        let inner = &self.inner;
        inner.telemetry.set_oldest_wait(inner.queue.oldest_wait());
        let model = inner.registry.current();

        ServiceReport {
            telemetry: inner.telemetry.snapshot(),
            peak_active_workers: inner.pool.peak_active(),
            queue_capacity: inner.queue.capacity(),
            queue_high_water: inner.queue.high_water(),
            model_id: model.as_ref().map(|m| m.model_id().to_string()),
            model_kind: model.as_ref().map(|m| m.kind().to_string()),
            model_loaded_at: model.as_ref().map(|m| m.loaded_at()),
            dataset_cached: inner.dataset.is_loaded(),
        }
    }

    /// Prometheus text exposition
    pub fn prometheus_text(&self) -> Result<String> {
        self.inner
            .telemetry
            .set_oldest_wait(self.inner.queue.oldest_wait());
        self.inner.telemetry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::model::{test_support, ModelArtifacts};
    use crate::retry::RetryPolicy;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use tidecast_common::config::default_latency_buckets;

    fn settings() -> ServiceSettings {
        ServiceSettings {
            workers: 2,
            queue_capacity: 4,
            request_timeout: None,
            simulated_delay: Duration::ZERO,
            default_inference_length: 1,
            max_inference_length: 100,
            serve_cached_prediction: true,
        }
    }

    async fn service(settings: ServiceSettings, loaded: bool) -> InferenceService {
        let store = Arc::new(MemoryArtifactStore::new());
        let telemetry = Telemetry::new(default_latency_buckets()).unwrap();
        let registry = Arc::new(ModelRegistry::new(
            store.clone(),
            None,
            RetryPolicy::immediate(1),
            telemetry.clone(),
        ));
        if loaded {
            let pointer = test_support::pointer("m1", "naive", "2024-01-01T00:00:00Z");
            store.insert_model(
                pointer.artifact_uri.clone(),
                ModelArtifacts {
                    weights: test_support::naive(2, 1),
                    scaler: test_support::scaler(&["load"], &[0.0], &[1.0]),
                },
            );
            registry.promote(&pointer).await.unwrap();
        }
        InferenceService::new(settings, registry, telemetry)
    }

    fn body(data: Value, length: Option<usize>) -> PredictRequest {
        PredictRequest {
            data: Some(serde_json::from_value::<BTreeMap<String, Vec<Value>>>(data).unwrap()),
            index_col: None,
            inference_length: length,
        }
    }

    fn series() -> Value {
        json!({"ts": ["2024-01-01", "2024-01-02", "2024-01-03"], "load": [1.0, 2.0, 4.0]})
    }

    #[tokio::test]
    async fn test_handle_inline_request() {
        let service = service(settings(), true).await;
        service.start();

        let response = service.handle(body(series(), Some(2)), None).await.unwrap();
        assert_eq!(response.status, "SUCCESS");
        assert_eq!(response.predictions["load"], vec![4.0, 4.0]);
        assert_eq!(response.timestamps[0], "2024-01-04T00:00:00Z");
        assert_eq!(service.report().telemetry.completed_count, 1);
    }

    #[tokio::test]
    async fn test_not_ready_rejects_at_admission() {
        let service = service(settings(), false).await;
        service.start();

        let err = service.handle(body(series(), None), None).await.unwrap_err();
        assert!(matches!(err, ServeError::ModelNotReady(_)));
        assert_eq!(service.report().telemetry.error_count, 1);
    }

    #[tokio::test]
    async fn test_cached_prediction_and_dataset() {
        let service = service(settings(), true).await;
        service.start();

        let err = service.handle(PredictRequest::default(), None).await.unwrap_err();
        assert!(matches!(err, ServeError::InvalidInput(_)));

        let frame = Frame::from_payload(
            &serde_json::from_value(series()).unwrap(),
            None,
        )
        .unwrap();
        service.dataset().replace(frame);

        let fresh = service.handle(PredictRequest::default(), Some(1)).await.unwrap();
        assert!(!fresh.cached);

        let cached = service.handle(PredictRequest::default(), None).await.unwrap();
        assert!(cached.cached);
        assert_eq!(cached.status, "SUCCESS_CACHED");
        assert_eq!(cached.req_id, fresh.req_id);
        assert_eq!(service.report().telemetry.served_cached, 1);
    }

    #[tokio::test]
    async fn test_length_bounds() {
        let service = service(settings(), true).await;
        let err = service.handle(body(series(), Some(0)), None).await.unwrap_err();
        assert!(matches!(err, ServeError::InvalidInput(_)));
        let err = service.handle(body(series(), None), Some(101)).await.unwrap_err();
        assert!(matches!(err, ServeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_dropped_pending_request_is_cancelled() {
        let service = service(settings(), true).await;
        let frame = Frame::from_payload(&serde_json::from_value(series()).unwrap(), None).unwrap();

        let pending = service.enqueue(InferenceRequest::inline(frame, 1)).unwrap();
        assert_eq!(service.queue_len(), 1);
        drop(pending);

        assert_eq!(service.queue_len(), 0);
        assert_eq!(service.report().telemetry.cancelled_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_withdraws_queued_request() {
        let mut settings = settings();
        settings.request_timeout = Some(Duration::from_millis(50));
        let service = service(settings, true).await;
        let frame = Frame::from_payload(&serde_json::from_value(series()).unwrap(), None).unwrap();

        // Dispatcher not started, so the request can only time out in the queue
        let err = service
            .predict(InferenceRequest::inline(frame, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::Timeout(_)));
        assert_eq!(service.queue_len(), 0);
        assert_eq!(
            service.report().telemetry.errors_by_kind.get("timeout"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_requests() {
        let service = service(settings(), true).await;
        let frame = Frame::from_payload(&serde_json::from_value(series()).unwrap(), None).unwrap();
        let pending = service.enqueue(InferenceRequest::inline(frame.clone(), 1)).unwrap();

        service.shutdown();
        assert!(matches!(pending.wait().await, Err(ServeError::ModelNotReady(_))));
        assert!(service.enqueue(InferenceRequest::inline(frame, 1)).is_err());
    }

    #[tokio::test]
    async fn test_caller_leaving_mid_execution_discards_result() {
        let mut settings = settings();
        settings.simulated_delay = Duration::from_millis(50);
        let service = service(settings, true).await;
        service.start();
        let frame = Frame::from_payload(&serde_json::from_value(series()).unwrap(), None).unwrap();

        let pending = service.enqueue(InferenceRequest::inline(frame, 1)).unwrap();
        while service.pool().active() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(service.queue_len(), 0);
        drop(pending);

        while service.pool().active() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let report = service.report();
        assert_eq!(report.telemetry.completed_count, 1);
        assert_eq!(report.telemetry.cancelled_count, 0);
        assert_eq!(report.telemetry.active_workers, 0);
        assert_eq!(service.queue_len(), 0);

        // Permit release trails the active guard by one statement
        for _ in 0..100 {
            if service.pool().available() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(service.pool().available(), 2);
    }

    #[tokio::test]
    async fn test_idle_dispatcher_holds_no_slot() {
        let service = service(settings(), true).await;
        service.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.pool().available(), 2);

        service.handle(body(series(), Some(1)), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.pool().available(), 2);
    }

    #[tokio::test]
    async fn test_horizon_past_date_range_is_invalid_input() {
        let mut settings = settings();
        settings.max_inference_length = 10_000;
        let service = service(settings, true).await;
        service.start();

        let centuries = json!({
            "ts": ["1800-01-01", "1900-01-01", "2000-01-01"],
            "load": [1.0, 2.0, 4.0]
        });
        let err = service.handle(body(centuries, Some(10_000)), None).await.unwrap_err();
        assert!(matches!(err, ServeError::InvalidInput(_)));

        let report = service.report();
        assert_eq!(report.telemetry.errors_by_kind.get("invalid_input"), Some(&1));
        assert_eq!(report.telemetry.errors_by_kind.get("unhandled_error"), None);
        assert_eq!(report.telemetry.active_workers, 0);
    }

    #[tokio::test]
    async fn test_scale_workers() {
        let service = service(settings(), true).await;
        assert_eq!(service.scale_workers(8).unwrap(), 2);
        assert_eq!(service.report().telemetry.workers_total, 8);
        assert!(service.scale_workers(0).is_err());
    }
}
