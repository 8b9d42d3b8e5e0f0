//! HTTP ingress

mod admin;
mod health;
mod predict;

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::rejection::JsonRejection,
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/predict", post(predict::predict))
        .route("/healthz", get(health::healthz))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .route("/prometheus", get(health::prometheus))
        .route("/scale_workers", post(admin::scale_workers))
        .route("/promote", post(admin::promote))
        .route("/reload_latest", post(admin::reload_latest))
        .route("/claims", post(admin::publish_claim))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Unwrap a JSON body, reporting malformed payloads as `invalid_input`
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}
