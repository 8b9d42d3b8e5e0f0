//! Kind-dispatched forecasting
//!
//! This module runs one forecast against a captured [`ModelHandle`]:
//! windowing and scaling through the feature pipeline, the model forward
//! pass for the handle's kind, then inverse scaling.

use crate::features::{from_tensor, time_features, to_tensor, Frame};
use crate::model::{
    AdditiveParams, ModelHandle, ModelKind, ModelParams, NaiveParams, RecurrentParams,
};
use crate::tensor::{linear, sigmoid_in_place, tanh_in_place, Tensor};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::time::Instant;
use tidecast_common::{Result, ServeError};
use tidecast_proto::{PredictResponse, STATUS_SUCCESS, STATUS_SUCCESS_CACHED};
use tracing::{debug, trace};
use uuid::Uuid;

/// Where a request's observations come from
#[derive(Debug, Clone)]
pub enum RequestInput {
    /// Observations carried by the request itself
    Inline(Frame),
    /// A private copy of the shared reference dataset, taken at execution
    Cached,
}

/// One admitted prediction request; never mutated after creation
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub input: RequestInput,
    pub inference_length: usize,
}

impl InferenceRequest {
    pub fn new(input: RequestInput, inference_length: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            input,
            inference_length,
        }
    }

    /// Request over inline observations
    pub fn inline(frame: Frame, inference_length: usize) -> Self {
        Self::new(RequestInput::Inline(frame), inference_length)
    }

    /// Request over the cached reference dataset
    pub fn cached(inference_length: usize) -> Self {
        Self::new(RequestInput::Cached, inference_length)
    }
}

/// Result of a served request
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub request_id: Uuid,
    pub model_id: String,
    pub model_kind: ModelKind,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: BTreeMap<String, Vec<f64>>,
}

impl Prediction {
    /// Wire form of this prediction
    pub fn to_response(&self, cached: bool) -> PredictResponse {
        PredictResponse {
            status: if cached { STATUS_SUCCESS_CACHED } else { STATUS_SUCCESS }.to_string(),
            model_id: self.model_id.clone(),
            model_kind: self.model_kind.to_string(),
            timestamps: self
                .timestamps
                .iter()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .collect(),
            predictions: self.values.clone(),
            req_id: self.request_id.to_string(),
            cached,
        }
    }
}

/// Output of one forecast
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub timestamps: Vec<DateTime<Utc>>,
    /// Forecast values per feature, in raw units
    pub values: BTreeMap<String, Vec<f64>>,
}

/// Serve one request against a captured handle
pub fn predict(
    handle: &ModelHandle,
    request_id: Uuid,
    frame: &Frame,
    horizon: usize,
) -> Result<Prediction> {
    let Forecast { timestamps, values } = forecast(handle, frame, horizon)?;
    Ok(Prediction {
        request_id,
        model_id: handle.model_id().to_string(),
        model_kind: handle.kind(),
        timestamps,
        values,
    })
}

/// Forecast `horizon` steps past the end of `frame`
///
/// Only reads `handle` and `frame`; callers pass a request-local frame.
pub fn forecast(handle: &ModelHandle, frame: &Frame, horizon: usize) -> Result<Forecast> {
    if horizon == 0 {
        return Err(ServeError::invalid_input("Inference length must be positive"));
    }

    let start = Instant::now();
    let timebase = frame.timebase()?;
    let window = to_tensor(
        frame,
        handle.scaler(),
        handle.input_window(),
        handle.uses_time_features(),
    )?;
    let timestamps = timebase.forecast_timestamps(horizon)?;
    let features = handle.scaler().len();

    let scaled = match handle.params() {
        ModelParams::RecurrentNet(params) => {
            rollout(params, handle.output_window(), &window, features, &timestamps)?
        }
        ModelParams::AdditiveBaseline(params) => additive(params, &timestamps),
        ModelParams::Naive(params) => seasonal_naive(params, &window, features, horizon),
    };

    let output = Tensor::from_rows(&scaled)
        .ok_or_else(|| ServeError::unhandled("Forecast rows have inconsistent widths"))?;
    let values = from_tensor(&output, handle.scaler())?;

    debug!(
        model_id = %handle.model_id(),
        kind = %handle.kind(),
        horizon,
        elapsed_us = start.elapsed().as_micros() as u64,
        "Forecast computed"
    );

    Ok(Forecast { timestamps, values })
}

/// One GRU step with packed (r, z, n) gates
fn gru_step(params: &RecurrentParams, x: &[f64], h: &[f64]) -> Result<Vec<f64>> {
    let hidden = params.hidden_size;
    let gi = linear(&params.weight_ih, &params.bias_ih, x)?;
    let gh = linear(&params.weight_hh, &params.bias_hh, h)?;

    let mut r: Vec<f64> = (0..hidden).map(|j| gi[j] + gh[j]).collect();
    let mut z: Vec<f64> = (0..hidden).map(|j| gi[hidden + j] + gh[hidden + j]).collect();
    sigmoid_in_place(&mut r);
    sigmoid_in_place(&mut z);

    let mut n: Vec<f64> = (0..hidden)
        .map(|j| gi[2 * hidden + j] + r[j] * gh[2 * hidden + j])
        .collect();
    tanh_in_place(&mut n);

    Ok((0..hidden)
        .map(|j| (1.0 - z[j]) * n[j] + z[j] * h[j])
        .collect())
}

/// Recursive rollout: each pass emits `output_window` steps, which are
/// appended to the input window until the horizon is covered
fn rollout(
    params: &RecurrentParams,
    output_window: usize,
    window: &Tensor<f64>,
    features: usize,
    timestamps: &[DateTime<Utc>],
) -> Result<Vec<Vec<f64>>> {
    let input_window = window.rows();
    let with_time = window.cols() > features;
    let mut rows: Vec<Vec<f64>> = window.iter_rows().map(<[f64]>::to_vec).collect();
    let mut out: Vec<Vec<f64>> = Vec::with_capacity(timestamps.len());

    while out.len() < timestamps.len() {
        let mut h = vec![0.0; params.hidden_size];
        for x in &rows[rows.len() - input_window..] {
            h = gru_step(params, x, &h)?;
        }
        let head = linear(&params.head_weight, &params.head_bias, &h)?;
        trace!(pass_start = out.len(), "GRU pass");

        for step in head.chunks(features).take(output_window) {
            if out.len() == timestamps.len() {
                break;
            }
            let mut next = step.to_vec();
            if with_time {
                next.extend_from_slice(&time_features(timestamps[out.len()]));
            }
            out.push(step.to_vec());
            rows.push(next);
        }
    }
    Ok(out)
}

fn additive(params: &AdditiveParams, timestamps: &[DateTime<Utc>]) -> Vec<Vec<f64>> {
    timestamps
        .iter()
        .map(|ts| {
            let t = (*ts - params.origin).num_milliseconds() as f64 / 86_400_000.0;
            params.components.iter().map(|c| c.evaluate(t)).collect()
        })
        .collect()
}

fn seasonal_naive(
    params: &NaiveParams,
    window: &Tensor<f64>,
    features: usize,
    horizon: usize,
) -> Vec<Vec<f64>> {
    let season = params.season_length;
    let base = window.rows() - season;
    (0..horizon)
        .map(|h| window.row(base + h % season)[..features].to_vec())
        .collect()
}
