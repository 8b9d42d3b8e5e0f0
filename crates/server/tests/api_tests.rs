//! HTTP contract tests against the router

use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tidecast_common::config::default_latency_buckets;
use tidecast_common::{ServeConfig, Telemetry};
use tidecast_proto::{ClaimCheck, PromotionPointer};
use tidecast_server::{create_router, AppState};
use tidecast_worker::model::{ModelParams, ModelWeights, NaiveParams, ScalerParams};
use tidecast_worker::{
    InferenceRequest, InferenceService, MemoryArtifactStore, ModelArtifacts, ModelRegistry,
    RetryPolicy, ServiceSettings,
};
use tokio::sync::mpsc;
use tower::ServiceExt;

struct Harness {
    app: Router,
    service: InferenceService,
    store: Arc<MemoryArtifactStore>,
    promotions: mpsc::Receiver<PromotionPointer>,
    claims: Option<mpsc::Receiver<ClaimCheck>>,
}

fn pointer(model_id: &str, timestamp: &str) -> PromotionPointer {
    PromotionPointer {
        model_id: model_id.to_string(),
        model_kind: "naive".to_string(),
        artifact_uri: format!("runs:/{}/model", model_id),
        score: Some(0.2),
        config_fingerprint: "fp".to_string(),
        timestamp: timestamp.to_string(),
    }
}

fn artifacts() -> ModelArtifacts {
    ModelArtifacts {
        weights: ModelWeights {
            input_window: 2,
            output_window: 1,
            uses_time_features: false,
            params: ModelParams::Naive(NaiveParams { season_length: 1 }),
        },
        scaler: ScalerParams {
            feature_names: vec!["load".to_string()],
            mean: vec![0.0],
            scale: vec![1.0],
        },
    }
}

async fn harness(loaded: bool, started: bool, queue_capacity: usize, claims: bool) -> Harness {
    let mut config = ServeConfig::default();
    config.queue.retry_after_secs = 2;

    let store = Arc::new(MemoryArtifactStore::new());
    let first = pointer("m1", "2024-01-01T00:00:00Z");
    store.insert_model(first.artifact_uri.clone(), artifacts());

    let telemetry = Telemetry::new(default_latency_buckets()).unwrap();
    let registry = Arc::new(ModelRegistry::new(
        store.clone(),
        Some("fp".to_string()),
        RetryPolicy::immediate(2),
        telemetry.clone(),
    ));
    if loaded {
        registry.promote(&first).await.unwrap();
    }

    let settings = ServiceSettings {
        workers: 2,
        queue_capacity,
        request_timeout: None,
        simulated_delay: Duration::ZERO,
        default_inference_length: 1,
        max_inference_length: 50,
        serve_cached_prediction: true,
    };
    let service = InferenceService::new(settings, registry, telemetry);
    if started {
        service.start();
    }

    let (promote_tx, promote_rx) = mpsc::channel(1);
    let (claims_tx, claims_rx) = if claims {
        let (tx, rx) = mpsc::channel(4);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let state = AppState::new(service.clone(), promote_tx, claims_tx, &config);
    Harness {
        app: create_router(state),
        service,
        store,
        promotions: promote_rx,
        claims: claims_rx,
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value, HeaderMap) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json, headers)
}

fn series() -> Value {
    json!({
        "data": {
            "date": ["2024-01-01", "2024-01-02", "2024-01-03"],
            "load": [10.0, 11.0, 12.5]
        }
    })
}

#[tokio::test]
async fn test_readiness_tracks_model() {
    let h = harness(false, true, 8, false).await;

    let (status, body, _) = send(&h.app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model_ready"], false);

    let (status, body, _) = send(&h.app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);

    let (status, body, _) = send(&h.app, "POST", "/predict", Some(series())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "model_not_ready");

    h.service
        .registry()
        .promote(&pointer("m1", "2024-01-01T00:00:00Z"))
        .await
        .unwrap();
    let (status, body, _) = send(&h.app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model_id"], "m1");
    assert_eq!(body["model_kind"], "naive");
}

#[tokio::test]
async fn test_predict_inline_and_cached() {
    let h = harness(true, true, 8, false).await;

    let (status, body, _) = send(&h.app, "POST", "/predict?inference_length=3", Some(series())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "SUCCESS");
    assert_eq!(body["model_id"], "m1");
    assert_eq!(body["predictions"]["load"], json!([12.5, 12.5, 12.5]));
    assert_eq!(body["timestamps"][0], "2024-01-04T00:00:00Z");
    let first_id = body["req_id"].clone();

    let (status, body, _) = send(&h.app, "POST", "/predict", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "SUCCESS_CACHED");
    assert_eq!(body["cached"], true);
    assert_eq!(body["req_id"], first_id);

    let (_, metrics, _) = send(&h.app, "GET", "/metrics", None).await;
    assert_eq!(metrics["completed_count"], 1);
    assert_eq!(metrics["served_cached"], 1);
    assert_eq!(metrics["model_id"], "m1");
}

#[tokio::test]
async fn test_predict_validation_errors() {
    let h = harness(true, true, 8, false).await;

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/predict")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, body, _) = send(&h.app, "POST", "/predict?inference_length=0", Some(series())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_input");

    let degenerate = json!({
        "data": {"ts": ["2024-01-01", "2024-01-01", "2024-01-01"], "load": [1.0, 2.0, 3.0]}
    });
    let (status, body, _) = send(&h.app, "POST", "/predict", Some(degenerate)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "degenerate_timebase");

    let (_, metrics, _) = send(&h.app, "GET", "/metrics", None).await;
    assert_eq!(metrics["error_count"], 3);
    assert_eq!(metrics["active_workers"], 0);
}

#[tokio::test]
async fn test_malformed_query_counts_as_invalid_input() {
    let h = harness(true, true, 8, false).await;

    let (status, _, _) = send(&h.app, "POST", "/predict?inference_length=abc", Some(series())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, metrics, _) = send(&h.app, "GET", "/metrics", None).await;
    assert_eq!(metrics["error_count"], 1);
    assert_eq!(metrics["errors_by_kind"]["invalid_input"], 1);
    assert_eq!(metrics["completed_count"], 0);
}

#[tokio::test]
async fn test_queue_full_sets_retry_after() {
    // Dispatcher not started, so the single slot stays occupied
    let h = harness(true, false, 1, false).await;
    let frame = tidecast_worker::Frame::from_payload(
        &serde_json::from_value(series()["data"].clone()).unwrap(),
        None,
    )
    .unwrap();
    let _held = h.service.enqueue(InferenceRequest::inline(frame, 1)).unwrap();

    let (status, body, headers) = send(&h.app, "POST", "/predict", Some(series())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "queue_full");
    assert_eq!(headers[header::RETRY_AFTER], "2");
}

#[tokio::test]
async fn test_scale_workers() {
    let h = harness(true, true, 8, false).await;

    let (status, body, _) = send(&h.app, "POST", "/scale_workers", Some(json!({"workers": 6}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"previous": 2, "workers": 6}));

    let (status, _, _) = send(&h.app, "POST", "/scale_workers", Some(json!({"workers": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, metrics, _) = send(&h.app, "GET", "/metrics", None).await;
    assert_eq!(metrics["workers_total"], 6);
}

#[tokio::test]
async fn test_promote_queues_pointer() {
    let mut h = harness(true, true, 8, false).await;
    let next = serde_json::to_value(pointer("m2", "2024-02-01T00:00:00Z")).unwrap();

    let (status, body, _) = send(&h.app, "POST", "/promote", Some(next.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["model_id"], "m2");

    // Channel capacity is one and nothing drains it here
    let (status, _, _) = send(&h.app, "POST", "/promote", Some(next)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(h.promotions.recv().await.unwrap().model_id, "m2");
}

#[tokio::test]
async fn test_reload_latest() {
    let h = harness(false, true, 8, false).await;

    let (status, body, _) = send(&h.app, "POST", "/reload_latest", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "not_loaded");

    h.store.set_latest(pointer("m1", "2024-01-01T00:00:00Z"));
    let (status, body, _) = send(&h.app, "POST", "/reload_latest", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "loaded");
    assert_eq!(body["model_id"], "m1");
}

#[tokio::test]
async fn test_claims_endpoint() {
    let disabled = harness(true, true, 8, false).await;
    let claim = json!({"bucket": "datasets", "key": "daily.json", "inference_length": 2});
    let (status, _, _) = send(&disabled.app, "POST", "/claims", Some(claim.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut enabled = harness(true, true, 8, true).await;
    let (status, body, _) = send(&enabled.app, "POST", "/claims", Some(claim)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["key"], "daily.json");

    let received = enabled.claims.as_mut().unwrap().recv().await.unwrap();
    assert_eq!(received.bucket, "datasets");
    assert_eq!(received.inference_length, Some(2));
}

#[tokio::test]
async fn test_prometheus_exposition() {
    let h = harness(true, true, 8, false).await;
    send(&h.app, "POST", "/predict", Some(series())).await;

    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/prometheus").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let text = String::from_utf8(
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec(),
    )
    .unwrap();
    assert!(text.contains("inference_requests_total{outcome=\"success\"} 1"));
    assert!(text.contains("inference_model_ready 1"));
}
