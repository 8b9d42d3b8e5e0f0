//! Configuration structures for Tidecast
//!
//! This module defines every tunable of the serving core. Configurations are
//! loaded from YAML files and can be overridden by `TIDECAST__`-prefixed
//! environment variables (`TIDECAST__WORKER__MAX_CONCURRENCY=32`).

use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound accepted by `POST /scale_workers`
pub const MAX_WORKERS: usize = 1024;

/// Top-level configuration for the inference service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Server binding address
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Worker pool configuration
    pub worker: WorkerConfig,

    /// Admission queue configuration
    pub queue: QueueConfig,

    /// Model registry configuration
    pub registry: RegistryConfig,

    /// Artifact store configuration
    pub artifacts: ArtifactConfig,

    /// Promotion channel configuration
    pub promotion: PromotionConfig,

    /// Claim-check input channel configuration
    pub claims: ClaimsConfig,

    /// Request defaults
    pub inference: InferenceConfig,

    /// Message broker configuration
    pub kafka: KafkaConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of execution slots (C)
    pub max_concurrency: usize,

    /// Deadline a caller waits for its result (none = wait indefinitely)
    pub request_timeout_ms: Option<u64>,

    /// Artificial delay held inside a slot, for load testing
    pub simulated_delay_ms: u64,
}

/// Admission queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending requests
    pub capacity: usize,

    /// Retry hint returned with 503 when the queue is full
    pub retry_after_secs: u64,
}

/// Model registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Preprocessing fingerprint promoted models must have been trained with
    pub expected_config_fingerprint: Option<String>,

    /// Load the latest promoted model before accepting traffic
    pub autoload_promoted: bool,

    /// Attempts per artifact fetch
    pub fetch_max_attempts: u32,

    /// Initial backoff between fetch attempts
    pub fetch_backoff_ms: u64,

    /// Backoff cap
    pub fetch_backoff_max_ms: u64,
}

/// Artifact store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Which store backs artifacts, datasets and the prediction log
    pub backend: StoreBackend,

    /// Root directory of the filesystem artifact store
    pub root: PathBuf,

    /// S3-compatible object store settings
    pub s3: S3StoreConfig,
}

/// Artifact store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Filesystem,
    /// Requires the `s3` feature
    S3,
}

/// S3-compatible object store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3StoreConfig {
    /// AWS region (falls back to the SDK's provider chain)
    pub region: Option<String>,

    /// Custom endpoint, e.g. a MinIO gateway
    pub endpoint_url: Option<String>,

    /// Address buckets as path segments instead of subdomains
    pub force_path_style: bool,

    /// Named AWS profile
    pub profile: Option<String>,
}

/// Promotion channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Buffered promotion events
    pub channel_capacity: usize,

    /// Poll the store's latest pointer at this interval (disabled if unset)
    pub poll_interval_secs: Option<u64>,
}

/// Claim-check input channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimsConfig {
    /// Run the claim-check consumer
    pub enabled: bool,

    /// Buffered claim-check messages
    pub channel_capacity: usize,

    /// Expose `POST /claims`
    pub enable_publish_api: bool,

    /// Where served claim predictions are logged
    pub prediction_log: PredictionLogConfig,
}

/// JSON-lines log of served claim predictions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionLogConfig {
    /// Append each served prediction to the store
    pub enabled: bool,

    /// Bucket holding the log objects
    pub bucket: String,

    /// Deployment identifier; objects are keyed `<identifier>/<YYYYMMDD>/results.jsonl`
    pub identifier: String,
}

/// Message broker configuration
///
/// Topics left unset are not consumed or produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Connect to the broker (requires the `kafka` feature)
    pub enabled: bool,

    /// Bootstrap servers, comma separated
    pub brokers: String,

    /// Consumer group id
    pub group_id: String,

    /// Promotion pointers to consume
    pub promotion_topic: Option<String>,

    /// Claim checks to consume
    pub claims_topic: Option<String>,

    /// Inference events to produce
    pub output_topic: Option<String>,

    /// Dead-letter reports to produce
    pub dlq_topic: Option<String>,

    /// Extra librdkafka client properties
    pub properties: BTreeMap<String, String>,
}

/// Request defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Forecast steps when the caller gives none
    pub default_inference_length: usize,

    /// Largest accepted forecast horizon
    pub max_inference_length: usize,

    /// Answer data-less, length-less requests with the last prediction
    pub serve_cached_prediction: bool,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Emit JSON log lines
    pub structured_logging: bool,

    /// Latency histogram buckets in seconds
    pub latency_buckets: Vec<f64>,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_concurrency() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    100
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("./artifacts")
}

fn default_max_inference_length() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Default latency buckets: 10ms to 30s, roughly log-spaced
pub fn default_latency_buckets() -> Vec<f64> {
    vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            registry: RegistryConfig::default(),
            artifacts: ArtifactConfig::default(),
            promotion: PromotionConfig::default(),
            claims: ClaimsConfig::default(),
            inference: InferenceConfig::default(),
            kafka: KafkaConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            request_timeout_ms: None,
            simulated_delay_ms: 0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            retry_after_secs: 1,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            expected_config_fingerprint: None,
            autoload_promoted: true,
            fetch_max_attempts: default_fetch_attempts(),
            fetch_backoff_ms: 200,
            fetch_backoff_max_ms: 5_000,
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            root: default_artifact_root(),
            s3: S3StoreConfig::default(),
        }
    }
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            poll_interval_secs: None,
        }
    }
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_capacity: 64,
            enable_publish_api: false,
            prediction_log: PredictionLogConfig::default(),
        }
    }
}

impl Default for PredictionLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: "inference-logs".to_string(),
            identifier: "default".to_string(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            brokers: "localhost:9092".to_string(),
            group_id: "tidecast".to_string(),
            promotion_topic: Some("model-selected".to_string()),
            claims_topic: Some("inference-data".to_string()),
            output_topic: Some("performance-eval".to_string()),
            dlq_topic: Some("DLQ-performance-eval".to_string()),
            properties: BTreeMap::new(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            default_inference_length: 1,
            max_inference_length: default_max_inference_length(),
            serve_cached_prediction: true,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
            latency_buckets: default_latency_buckets(),
        }
    }
}

impl ServeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServeError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: ServeConfig = serde_yaml::from_str(&content).map_err(|e| {
            ServeError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TIDECAST")
                .separator("__")
                .try_parsing(true),
        );

        let config: ServeConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ServeError::config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker.max_concurrency == 0 || self.worker.max_concurrency > MAX_WORKERS {
            return Err(ServeError::config(format!(
                "worker.max_concurrency must be within 1..={}",
                MAX_WORKERS
            )));
        }
        if self.queue.capacity == 0 {
            return Err(ServeError::config("queue.capacity must be positive"));
        }
        if self.registry.fetch_max_attempts == 0 {
            return Err(ServeError::config("registry.fetch_max_attempts must be positive"));
        }
        if self.inference.max_inference_length == 0 {
            return Err(ServeError::config("inference.max_inference_length must be positive"));
        }
        if self.inference.default_inference_length == 0
            || self.inference.default_inference_length > self.inference.max_inference_length
        {
            return Err(ServeError::config(
                "inference.default_inference_length must be within 1..=max_inference_length",
            ));
        }
        if self.promotion.channel_capacity == 0 || self.claims.channel_capacity == 0 {
            return Err(ServeError::config("channel capacities must be positive"));
        }
        let log = &self.claims.prediction_log;
        if log.enabled && (log.bucket.is_empty() || log.identifier.is_empty()) {
            return Err(ServeError::config(
                "claims.prediction_log needs a bucket and an identifier",
            ));
        }
        if self.kafka.enabled && self.kafka.brokers.trim().is_empty() {
            return Err(ServeError::config("kafka.brokers must be set when kafka is enabled"));
        }

        let buckets = &self.observability.latency_buckets;
        if buckets.is_empty() {
            return Err(ServeError::config("observability.latency_buckets must not be empty"));
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) || buckets.iter().any(|b| !b.is_finite()) {
            return Err(ServeError::config(
                "observability.latency_buckets must be finite and strictly increasing",
            ));
        }
        Ok(())
    }

    /// Socket address string the server binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Get the caller deadline as Duration
    pub fn request_timeout(&self) -> Option<Duration> {
        self.worker.request_timeout_ms.map(Duration::from_millis)
    }
}

impl RegistryConfig {
    /// Initial fetch backoff
    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }

    /// Fetch backoff cap
    pub fn fetch_backoff_max(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_max_ms)
    }
}
