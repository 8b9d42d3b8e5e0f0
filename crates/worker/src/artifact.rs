//! Artifact and dataset stores
//!
//! The registry fetches `{weights, scaler}` by URI and the claim-check
//! consumer fetches datasets by bucket and key and appends served
//! predictions to a JSON-lines log. [`FsArtifactStore`] maps object-store
//! style URIs onto a local directory tree; [`MemoryArtifactStore`] keeps
//! everything in memory and can inject transient failures. An S3 backed
//! store lives in [`crate::s3`] behind the `s3` feature.

use crate::model::{ModelArtifacts, ModelWeights, ScalerParams};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tidecast_common::{Result, ServeError};
use tidecast_proto::{DatasetObject, PredictionRecord, PromotionPointer};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// File holding the model weights inside a model directory
pub const WEIGHTS_FILE: &str = "weights.json";
/// File holding the fitted scaler inside a model directory
pub const SCALER_FILE: &str = "scaler.json";
/// Location of the latest promotion pointer, relative to the store root
pub const POINTER_PATH: &str = "promotion/current.json";
/// Bucket that `runs:/<run_id>/<path>` URIs resolve into
pub const RUNS_BUCKET: &str = "runs";

/// Bucket and key of an object addressed by an artifact URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    /// Parse `s3://bucket/prefix` or `runs:/<run_id>/<path>`
    pub fn parse(uri: &str) -> Result<Self> {
        let (bucket, key) = if let Some(rest) = uri.strip_prefix("s3://") {
            rest.split_once('/').unwrap_or((rest, ""))
        } else if let Some(rest) = uri.strip_prefix("runs:/") {
            (RUNS_BUCKET, rest.trim_start_matches('/'))
        } else {
            return Err(ServeError::invalid_input(format!(
                "Unsupported artifact URI '{}'",
                uri
            )));
        };

        if bucket.is_empty() {
            return Err(ServeError::invalid_input(format!(
                "Artifact URI '{}' names no bucket",
                uri
            )));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.trim_end_matches('/').to_string(),
        })
    }

    /// Location of the promotion pointer
    pub fn pointer() -> Self {
        let (bucket, key) = POINTER_PATH.split_once('/').unwrap_or(("", POINTER_PATH));
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Key of `file` inside this location's prefix
    pub fn child(&self, file: &str) -> String {
        if self.key.is_empty() {
            file.to_string()
        } else {
            format!("{}/{}", self.key, file)
        }
    }
}

/// Serialize a record as one newline-terminated JSON line
pub fn json_line(record: &PredictionRecord) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Read contract of the artifact store
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch the weights and scaler stored under `uri`
    async fn fetch_model(&self, uri: &str) -> Result<ModelArtifacts>;

    /// Latest promotion pointer, if any model has been promoted
    async fn latest_pointer(&self) -> Result<Option<PromotionPointer>>;

    /// Fetch a claim-check dataset object
    async fn fetch_dataset(&self, bucket: &str, key: &str) -> Result<DatasetObject>;

    /// Append one record to the JSON-lines prediction log at `bucket/key`
    ///
    /// Write failures are reported as upstream errors so callers can retry.
    async fn append_prediction(
        &self,
        bucket: &str,
        key: &str,
        record: &PredictionRecord,
    ) -> Result<()>;
}

/// Filesystem-backed store
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an artifact URI onto a directory
    ///
    /// `file:///abs/dir` is used as-is, `s3://bucket/prefix` maps to
    /// `<root>/bucket/prefix`, and `runs:/<run_id>/<path>` maps to
    /// `<root>/runs/<run_id>/<path>`.
    pub fn resolve(&self, uri: &str) -> Result<PathBuf> {
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }

        let location = ObjectLocation::parse(uri)?;
        self.within_root(&Path::new(&location.bucket).join(&location.key), uri)
    }

    fn within_root(&self, relative: &Path, what: &str) -> Result<PathBuf> {
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(ServeError::invalid_input(format!(
                "Artifact location '{}' must stay within the store",
                what
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ServeError::upstream(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ServeError::invalid_artifact(format!("Failed to parse {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn fetch_model(&self, uri: &str) -> Result<ModelArtifacts> {
        let dir = self.resolve(uri)?;
        debug!(uri, dir = %dir.display(), "Fetching model artifacts");

        let weights: ModelWeights = Self::read_json(&dir.join(WEIGHTS_FILE)).await?;
        let scaler: ScalerParams = Self::read_json(&dir.join(SCALER_FILE)).await?;
        Ok(ModelArtifacts { weights, scaler })
    }

    async fn latest_pointer(&self) -> Result<Option<PromotionPointer>> {
        let path = self.root.join(POINTER_PATH);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Self::read_json(&path).await.map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServeError::upstream(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn fetch_dataset(&self, bucket: &str, key: &str) -> Result<DatasetObject> {
        let path = self.within_root(&Path::new(bucket).join(key), &format!("{}/{}", bucket, key))?;
        debug!(bucket, key, "Fetching dataset");
        Self::read_json(&path).await
    }

    async fn append_prediction(
        &self,
        bucket: &str,
        key: &str,
        record: &PredictionRecord,
    ) -> Result<()> {
        let path = self.within_root(&Path::new(bucket).join(key), &format!("{}/{}", bucket, key))?;
        let line = json_line(record)?;
        let write_failed =
            |e: std::io::Error| ServeError::upstream(format!("Failed to write {}: {}", path.display(), e));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(write_failed)?;
        file.write_all(&line).await.map_err(write_failed)?;
        file.flush().await.map_err(write_failed)?;
        debug!(bucket, key, bytes = line.len(), "Prediction appended");
        Ok(())
    }
}

/// In-memory store with failure injection
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    models: Mutex<HashMap<String, ModelArtifacts>>,
    datasets: Mutex<HashMap<(String, String), DatasetObject>>,
    latest: Mutex<Option<PromotionPointer>>,
    logs: Mutex<HashMap<(String, String), Vec<PredictionRecord>>>,
    failures: AtomicU32,
    write_failures: AtomicU32,
    fetches: AtomicU32,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_model(&self, uri: impl Into<String>, artifacts: ModelArtifacts) {
        self.models.lock().insert(uri.into(), artifacts);
    }

    pub fn insert_dataset(&self, bucket: &str, key: &str, dataset: DatasetObject) {
        self.datasets
            .lock()
            .insert((bucket.to_string(), key.to_string()), dataset);
    }

    pub fn set_latest(&self, pointer: PromotionPointer) {
        *self.latest.lock() = Some(pointer);
    }

    /// Make the next `n` fetches fail with an upstream error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` prediction appends fail with an upstream error
    pub fn fail_next_writes(&self, n: u32) {
        self.write_failures.store(n, Ordering::SeqCst);
    }

    /// Records appended to the prediction log at `bucket/key`
    pub fn predictions(&self, bucket: &str, key: &str) -> Vec<PredictionRecord> {
        self.logs
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of fetch calls served so far, failed ones included
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, what: &str) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match pending {
            Ok(_) => Err(ServeError::upstream(format!("Injected failure fetching {}", what))),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn fetch_model(&self, uri: &str) -> Result<ModelArtifacts> {
        self.injected_failure(uri)?;
        self.models
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| ServeError::upstream(format!("No artifacts at '{}'", uri)))
    }

    async fn latest_pointer(&self) -> Result<Option<PromotionPointer>> {
        Ok(self.latest.lock().clone())
    }

    async fn fetch_dataset(&self, bucket: &str, key: &str) -> Result<DatasetObject> {
        self.injected_failure(key)?;
        self.datasets
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ServeError::upstream(format!("No dataset at {}/{}", bucket, key)))
    }

    async fn append_prediction(
        &self,
        bucket: &str,
        key: &str,
        record: &PredictionRecord,
    ) -> Result<()> {
        let pending = self
            .write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(ServeError::upstream(format!(
                "Injected failure writing {}/{}",
                bucket, key
            )));
        }
        self.logs
            .lock()
            .entry((bucket.to_string(), key.to_string()))
            .or_default()
            .push(record.clone());
        Ok(())
    }
}
