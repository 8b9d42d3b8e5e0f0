use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use serde::Deserialize;
use tidecast_common::ErrorKind;
use tidecast_proto::{PredictRequest, PredictResponse};

#[derive(Debug, Default, Deserialize)]
pub struct PredictQuery {
    pub inference_length: Option<usize>,
}

/// `POST /predict`
///
/// An empty body asks for a forecast from the cached dataset, or for the
/// last cached prediction when no length is given either.
pub async fn predict(
    State(state): State<AppState>,
    query: Result<Query<PredictQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Json<PredictResponse>, ApiError> {
    let Query(query) = query.map_err(|e| {
        state.service.telemetry().record_error(ErrorKind::InvalidInput, None);
        ApiError::bad_request(e.body_text())
    })?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        PredictRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            state
                .service
                .telemetry()
                .record_error(ErrorKind::InvalidInput, None);
            ApiError::bad_request(format!("Malformed request body: {}", e))
        })?
    };

    let response = state
        .service
        .handle(request, query.inference_length)
        .await
        .map_err(|e| ApiError::from(e).with_retry_after(state.retry_after_secs))?;
    Ok(Json(response))
}
