use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use tidecast_proto::{HealthResponse, ReadyResponse};
use tidecast_worker::ServiceReport;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// `GET /healthz`: liveness only
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model_ready: state.service.is_ready(),
        queue_length: state.service.queue_len(),
        uptime_secs: state.uptime().as_secs(),
    })
}

/// `GET /ready`: 503 until a model is loaded
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let model = state.service.registry().current();
    let status = if model.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready: model.is_some(),
            model_id: model.as_ref().map(|m| m.model_id().to_string()),
            model_kind: model.as_ref().map(|m| m.kind().to_string()),
        }),
    )
}

/// `GET /metrics`: JSON snapshot
pub async fn metrics(State(state): State<AppState>) -> Json<ServiceReport> {
    Json(state.service.report())
}

/// `GET /prometheus`: text exposition
pub async fn prometheus(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let text = state.service.prometheus_text()?;
    Ok(([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], text))
}
