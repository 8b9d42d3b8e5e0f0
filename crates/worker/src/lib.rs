//! Tidecast serving core
//!
//! Admission queue, bounded worker pool, hot-swappable model registry and
//! the feature pipeline for time-series forecast inference.

pub mod artifact;
pub mod claims;
pub mod dataset;
pub mod features;
pub mod inference;
pub mod model;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod retry;
#[cfg(feature = "s3")]
pub mod s3;
pub mod service;
pub mod tensor;

pub use artifact::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use claims::{ClaimConsumer, PredictionLog};
pub use features::Frame;
pub use inference::{InferenceRequest, Prediction, RequestInput};
pub use model::{ModelArtifacts, ModelHandle, ModelKind};
pub use pool::WorkerPool;
pub use queue::AdmissionQueue;
pub use registry::{ModelRegistry, PromotionOutcome};
pub use retry::RetryPolicy;
#[cfg(feature = "s3")]
pub use s3::S3ArtifactStore;
pub use service::{InferenceService, PendingPrediction, ServiceReport, ServiceSettings};
