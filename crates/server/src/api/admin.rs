//! Operational endpoints: pool sizing, promotion and claim-check ingress

use super::json_body;
use crate::error::ApiError;
use crate::state::AppState;
use axum::{extract::rejection::JsonRejection, extract::State, http::StatusCode, Json};
use tidecast_proto::{
    ClaimAccepted, ClaimCheck, PromoteAccepted, PromotionPointer, ReloadResponse,
    ScaleWorkersRequest, ScaleWorkersResponse,
};
use tokio::sync::mpsc::error::TrySendError;
use tracing::info;

pub async fn scale_workers(
    State(state): State<AppState>,
    body: Result<Json<ScaleWorkersRequest>, JsonRejection>,
) -> Result<Json<ScaleWorkersResponse>, ApiError> {
    let request = json_body(body)?;
    let previous = state.service.scale_workers(request.workers)?;
    info!(previous, workers = request.workers, "Worker pool resized");
    Ok(Json(ScaleWorkersResponse {
        previous,
        workers: request.workers,
    }))
}

/// Queue a promotion pointer for the listener
pub async fn promote(
    State(state): State<AppState>,
    body: Result<Json<PromotionPointer>, JsonRejection>,
) -> Result<(StatusCode, Json<PromoteAccepted>), ApiError> {
    let pointer = json_body(body)?;
    let model_id = pointer.model_id.clone();

    state.promotions.try_send(pointer).map_err(|e| match e {
        TrySendError::Full(_) => ApiError::unavailable("Promotion channel is full"),
        TrySendError::Closed(_) => ApiError::unavailable("Promotion listener has stopped"),
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PromoteAccepted {
            status: "accepted".to_string(),
            model_id,
        }),
    ))
}

/// Promote the store's latest pointer now
pub async fn reload_latest(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let registry = state.service.registry();
    let loaded = registry.autoload().await?;
    let model = registry.current();

    Ok(Json(ReloadResponse {
        status: if loaded { "loaded" } else { "not_loaded" }.to_string(),
        model_id: model.as_ref().map(|m| m.model_id().to_string()),
        model_kind: model.as_ref().map(|m| m.kind().to_string()),
    }))
}

/// Hand a claim check to the consumer
pub async fn publish_claim(
    State(state): State<AppState>,
    body: Result<Json<ClaimCheck>, JsonRejection>,
) -> Result<(StatusCode, Json<ClaimAccepted>), ApiError> {
    let claims = state
        .claims
        .as_ref()
        .ok_or_else(|| ApiError::not_found("Claim-check publishing is disabled"))?;
    let claim = json_body(body)?;
    let (bucket, key) = (claim.bucket.clone(), claim.key.clone());

    claims.try_send(claim).map_err(|e| match e {
        TrySendError::Full(_) => ApiError::unavailable("Claim-check channel is full"),
        TrySendError::Closed(_) => ApiError::unavailable("Claim-check consumer has stopped"),
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ClaimAccepted {
            status: "accepted".to_string(),
            bucket,
            key,
        }),
    ))
}
