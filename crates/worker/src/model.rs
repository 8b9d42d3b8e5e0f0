//! Model handles and artifacts
//!
//! A [`ModelHandle`] is the immutable snapshot the worker pool executes
//! against: weights, a sanitized feature scaler, window sizes and the model
//! kind. Handles are only ever built through [`ModelHandle::new`], which
//! validates every dimension and clamps zero-variance scaler features once,
//! at load time.

use crate::features::TIME_FEATURES;
use crate::tensor::Tensor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tidecast_common::{Result, ServeError};
use tidecast_proto::PromotionPointer;
use tracing::{debug, warn};

/// Explicit model family used for dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Recurrent network (GRU) with a linear head
    #[serde(alias = "gru", alias = "lstm")]
    RecurrentNet,
    /// Trend plus Fourier seasonality baseline
    #[serde(alias = "prophet")]
    AdditiveBaseline,
    /// Seasonal naive forecaster
    #[serde(alias = "statsforecast", alias = "other")]
    Naive,
}

impl ModelKind {
    /// Parse a kind name as found in promotion pointers
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "recurrent_net" | "gru" | "lstm" => Some(ModelKind::RecurrentNet),
            "additive_baseline" | "prophet" => Some(ModelKind::AdditiveBaseline),
            "naive" | "statsforecast" | "other" => Some(ModelKind::Naive),
            _ => None,
        }
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::RecurrentNet => "recurrent_net",
            ModelKind::AdditiveBaseline => "additive_baseline",
            ModelKind::Naive => "naive",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `weights.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Observed rows consumed per forecast
    pub input_window: usize,

    /// Steps produced per forward pass
    pub output_window: usize,

    /// Append cyclical time encodings to every input row
    #[serde(default)]
    pub uses_time_features: bool,

    /// Kind-specific parameters
    pub params: ModelParams,
}

/// Kind-specific parameters, tagged by kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelParams {
    #[serde(alias = "gru", alias = "lstm")]
    RecurrentNet(RecurrentParams),
    #[serde(alias = "prophet")]
    AdditiveBaseline(AdditiveParams),
    #[serde(alias = "statsforecast", alias = "other")]
    Naive(NaiveParams),
}

impl ModelParams {
    /// Kind these parameters belong to
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelParams::RecurrentNet(_) => ModelKind::RecurrentNet,
            ModelParams::AdditiveBaseline(_) => ModelKind::AdditiveBaseline,
            ModelParams::Naive(_) => ModelKind::Naive,
        }
    }
}

/// Single-layer GRU with packed gates (r, z, n) and a linear head
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrentParams {
    pub hidden_size: usize,
    /// Shape `[3 * hidden, inputs]`
    pub weight_ih: Tensor<f64>,
    /// Shape `[3 * hidden, hidden]`
    pub weight_hh: Tensor<f64>,
    pub bias_ih: Vec<f64>,
    pub bias_hh: Vec<f64>,
    /// Shape `[output_window * features, hidden]`
    pub head_weight: Tensor<f64>,
    pub head_bias: Vec<f64>,
}

/// Additive baseline: intercept, linear trend and seasonalities per feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditiveParams {
    /// Trend origin; time is measured in days since this instant
    pub origin: DateTime<Utc>,
    /// One component per scaler feature, in scaler order
    pub components: Vec<AdditiveComponent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditiveComponent {
    pub intercept: f64,
    /// Slope per day
    #[serde(default)]
    pub slope: f64,
    #[serde(default)]
    pub seasonalities: Vec<Seasonality>,
}

/// Fourier seasonality; `coefficients[k]` holds the (sin, cos) pair of order k+1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seasonality {
    pub period_days: f64,
    pub coefficients: Vec<(f64, f64)>,
}

impl AdditiveComponent {
    /// Evaluate in scaled space at `t` days since the origin
    pub fn evaluate(&self, t: f64) -> f64 {
        let seasonal: f64 = self
            .seasonalities
            .iter()
            .map(|s| {
                s.coefficients
                    .iter()
                    .enumerate()
                    .map(|(k, (a, b))| {
                        let angle = 2.0 * std::f64::consts::PI * (k as f64 + 1.0) * t / s.period_days;
                        a * angle.sin() + b * angle.cos()
                    })
                    .sum::<f64>()
            })
            .sum();
        self.intercept + self.slope * t + seasonal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaiveParams {
    #[serde(default = "default_season_length")]
    pub season_length: usize,
}

fn default_season_length() -> usize {
    1
}

/// Contents of `scaler.json`, as fitted by the training pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// Standard scaler with zero-variance features clamped
///
/// Fields are private so a `Scaler` can only exist in sanitized form.
#[derive(Debug, Clone, PartialEq)]
pub struct Scaler {
    feature_names: Vec<String>,
    mean: Vec<f64>,
    scale: Vec<f64>,
    constant: Vec<bool>,
}

impl Scaler {
    /// Validate and sanitize fitted scaler parameters
    ///
    /// Any feature whose scale is zero or not finite is clamped to 1 and
    /// marked constant; its inverse transform then returns the mean exactly.
    pub fn new(params: ScalerParams) -> Result<Self> {
        let ScalerParams {
            feature_names,
            mean,
            mut scale,
        } = params;

        if feature_names.is_empty() {
            return Err(ServeError::invalid_artifact("Scaler has no features"));
        }
        if mean.len() != feature_names.len() || scale.len() != feature_names.len() {
            return Err(ServeError::invalid_artifact(format!(
                "Scaler lengths disagree: {} names, {} means, {} scales",
                feature_names.len(),
                mean.len(),
                scale.len()
            )));
        }
        if let Some(i) = mean.iter().position(|m| !m.is_finite()) {
            return Err(ServeError::invalid_artifact(format!(
                "Scaler mean for '{}' is not finite",
                feature_names[i]
            )));
        }

        let mut constant = vec![false; scale.len()];
        for (i, s) in scale.iter_mut().enumerate() {
            if *s == 0.0 || !s.is_finite() {
                warn!(
                    feature = %feature_names[i],
                    scale = *s,
                    "Zero-variance scaler feature clamped to unit scale"
                );
                *s = 1.0;
                constant[i] = true;
            }
        }

        Ok(Self {
            feature_names,
            mean,
            scale,
            constant,
        })
    }

    /// Feature names in model order
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.feature_names.len()
    }

    /// Check if the scaler has no features
    pub fn is_empty(&self) -> bool {
        self.feature_names.is_empty()
    }

    /// Number of features clamped during sanitization
    pub fn sanitized_count(&self) -> usize {
        self.constant.iter().filter(|c| **c).count()
    }

    /// Whether feature `i` was fitted on a constant column
    pub fn is_constant(&self, i: usize) -> bool {
        self.constant[i]
    }

    /// Scale a raw value of feature `i`
    pub fn transform(&self, i: usize, value: f64) -> f64 {
        (value - self.mean[i]) / self.scale[i]
    }

    /// Map a scaled value of feature `i` back to raw units
    pub fn inverse(&self, i: usize, value: f64) -> f64 {
        if self.constant[i] {
            self.mean[i]
        } else {
            value * self.scale[i] + self.mean[i]
        }
    }
}

/// Artifacts fetched for one promotion
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub weights: ModelWeights,
    pub scaler: ScalerParams,
}

/// Immutable, fully validated model snapshot
#[derive(Debug)]
pub struct ModelHandle {
    model_id: String,
    kind: ModelKind,
    config_fingerprint: String,
    promoted_at: DateTime<Utc>,
    loaded_at: DateTime<Utc>,
    weights: ModelWeights,
    scaler: Scaler,
}

/// Parse the RFC 3339 timestamp of a promotion pointer
pub fn pointer_timestamp(pointer: &PromotionPointer) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&pointer.timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            ServeError::invalid_input(format!(
                "Promotion pointer for '{}' has invalid timestamp '{}': {}",
                pointer.model_id, pointer.timestamp, e
            ))
        })
}

impl ModelHandle {
    /// Build a handle from a promotion pointer and its fetched artifacts
    pub fn new(pointer: &PromotionPointer, artifacts: ModelArtifacts) -> Result<Self> {
        let kind = ModelKind::parse(&pointer.model_kind).ok_or_else(|| {
            ServeError::invalid_artifact(format!("Unknown model kind '{}'", pointer.model_kind))
        })?;
        let promoted_at = pointer_timestamp(pointer)?;

        let ModelArtifacts { weights, scaler } = artifacts;
        if weights.params.kind() != kind {
            return Err(ServeError::invalid_artifact(format!(
                "Pointer declares kind '{}' but weights are '{}'",
                kind,
                weights.params.kind()
            )));
        }

        let scaler = Scaler::new(scaler)?;
        validate_weights(&weights, scaler.len())?;

        debug!(
            model_id = %pointer.model_id,
            kind = %kind,
            input_window = weights.input_window,
            output_window = weights.output_window,
            "Model handle constructed"
        );

        Ok(Self {
            model_id: pointer.model_id.clone(),
            kind,
            config_fingerprint: pointer.config_fingerprint.clone(),
            promoted_at,
            loaded_at: Utc::now(),
            weights,
            scaler,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn config_fingerprint(&self) -> &str {
        &self.config_fingerprint
    }

    /// Timestamp carried by the promotion pointer
    pub fn promoted_at(&self) -> DateTime<Utc> {
        self.promoted_at
    }

    /// When this process constructed the handle
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn params(&self) -> &ModelParams {
        &self.weights.params
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    pub fn input_window(&self) -> usize {
        self.weights.input_window
    }

    pub fn output_window(&self) -> usize {
        self.weights.output_window
    }

    pub fn uses_time_features(&self) -> bool {
        self.weights.uses_time_features
    }

    /// Width of one model input row
    pub fn input_width(&self) -> usize {
        input_width(self.scaler.len(), self.weights.uses_time_features)
    }
}

fn input_width(features: usize, time_features: bool) -> usize {
    if time_features {
        features + TIME_FEATURES
    } else {
        features
    }
}

fn expect_shape(name: &str, tensor: &Tensor<f64>, rows: usize, cols: usize) -> Result<()> {
    if tensor.shape != [rows, cols] || tensor.len() != rows * cols {
        return Err(ServeError::invalid_artifact(format!(
            "{} has shape {:?} ({} values), expected [{}, {}]",
            name,
            tensor.shape,
            tensor.len(),
            rows,
            cols
        )));
    }
    Ok(())
}

fn expect_len(name: &str, values: &[f64], len: usize) -> Result<()> {
    if values.len() != len {
        return Err(ServeError::invalid_artifact(format!(
            "{} has {} values, expected {}",
            name,
            values.len(),
            len
        )));
    }
    Ok(())
}

fn validate_weights(weights: &ModelWeights, features: usize) -> Result<()> {
    if weights.input_window == 0 || weights.output_window == 0 {
        return Err(ServeError::invalid_artifact("Windows must be positive"));
    }

    match &weights.params {
        ModelParams::RecurrentNet(p) => {
            if p.hidden_size == 0 {
                return Err(ServeError::invalid_artifact("hidden_size must be positive"));
            }
            let gates = 3 * p.hidden_size;
            let inputs = input_width(features, weights.uses_time_features);
            expect_shape("weight_ih", &p.weight_ih, gates, inputs)?;
            expect_shape("weight_hh", &p.weight_hh, gates, p.hidden_size)?;
            expect_len("bias_ih", &p.bias_ih, gates)?;
            expect_len("bias_hh", &p.bias_hh, gates)?;
            let outputs = weights.output_window * features;
            expect_shape("head_weight", &p.head_weight, outputs, p.hidden_size)?;
            expect_len("head_bias", &p.head_bias, outputs)?;
        }
        ModelParams::AdditiveBaseline(p) => {
            if p.components.len() != features {
                return Err(ServeError::invalid_artifact(format!(
                    "Additive model has {} components for {} features",
                    p.components.len(),
                    features
                )));
            }
            let bad_period = p
                .components
                .iter()
                .flat_map(|c| c.seasonalities.iter())
                .any(|s| !(s.period_days.is_finite() && s.period_days > 0.0));
            if bad_period {
                return Err(ServeError::invalid_artifact(
                    "Seasonality periods must be positive",
                ));
            }
        }
        ModelParams::Naive(p) => {
            if p.season_length == 0 || p.season_length > weights.input_window {
                return Err(ServeError::invalid_artifact(format!(
                    "season_length {} must be within 1..={}",
                    p.season_length, weights.input_window
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn pointer(model_id: &str, kind: &str, timestamp: &str) -> PromotionPointer {
        PromotionPointer {
            model_id: model_id.to_string(),
            model_kind: kind.to_string(),
            artifact_uri: format!("runs:/{}/model", model_id),
            score: Some(0.9),
            config_fingerprint: "fp".to_string(),
            timestamp: timestamp.to_string(),
        }
    }

    pub fn scaler(names: &[&str], mean: &[f64], scale: &[f64]) -> ScalerParams {
        ScalerParams {
            feature_names: names.iter().map(|s| s.to_string()).collect(),
            mean: mean.to_vec(),
            scale: scale.to_vec(),
        }
    }

    pub fn naive(input_window: usize, season_length: usize) -> ModelWeights {
        ModelWeights {
            input_window,
            output_window: 1,
            uses_time_features: false,
            params: ModelParams::Naive(NaiveParams { season_length }),
        }
    }
}
