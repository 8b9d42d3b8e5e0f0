//! S3-compatible artifact store
//!
//! Maps the same URI scheme as the filesystem store onto buckets and keys.
//! The prediction log is appended by reading the current object and
//! uploading it again with the new line, since S3 has no append.

use crate::artifact::{
    json_line, ArtifactStore, ObjectLocation, SCALER_FILE, WEIGHTS_FILE,
};
use crate::model::{ModelArtifacts, ModelWeights, ScalerParams};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use serde::de::DeserializeOwned;
use tidecast_common::config::S3StoreConfig;
use tidecast_common::{Result, ServeError};
use tidecast_proto::{DatasetObject, PredictionRecord, PromotionPointer};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Artifact store backed by an S3-compatible object store
pub struct S3ArtifactStore {
    client: S3Client,
    // Serializes read-modify-write appends from this process
    append_lock: Mutex<()>,
}

impl S3ArtifactStore {
    /// Build a client from the SDK's default provider chain plus `config`
    pub async fn connect(config: &S3StoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(config.force_path_style);

        info!(
            endpoint = config.endpoint_url.as_deref().unwrap_or("default"),
            path_style = config.force_path_style,
            "S3 artifact store configured"
        );
        Self::with_client(S3Client::from_conf(builder.build()))
    }

    pub fn with_client(client: S3Client) -> Self {
        Self {
            client,
            append_lock: Mutex::new(()),
        }
    }

    /// Object body, or `None` when the key does not exist
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(ServeError::upstream(format!(
                    "Failed to get s3://{}/{}: {}",
                    bucket, key, e
                )));
            }
        };

        let body = output.body.collect().await.map_err(|e| {
            ServeError::upstream(format!("Failed to read s3://{}/{}: {}", bucket, key, e))
        })?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn get_json<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<T> {
        let bytes = self.get(bucket, key).await?.ok_or_else(|| {
            ServeError::upstream(format!("No object at s3://{}/{}", bucket, key))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ServeError::invalid_artifact(format!("Failed to parse s3://{}/{}: {}", bucket, key, e))
        })
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                ServeError::upstream(format!("Failed to put s3://{}/{}: {}", bucket, key, e))
            })?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn fetch_model(&self, uri: &str) -> Result<ModelArtifacts> {
        let location = ObjectLocation::parse(uri)?;
        debug!(uri, bucket = %location.bucket, prefix = %location.key, "Fetching model artifacts");

        let weights: ModelWeights = self
            .get_json(&location.bucket, &location.child(WEIGHTS_FILE))
            .await?;
        let scaler: ScalerParams = self
            .get_json(&location.bucket, &location.child(SCALER_FILE))
            .await?;
        Ok(ModelArtifacts { weights, scaler })
    }

    async fn latest_pointer(&self) -> Result<Option<PromotionPointer>> {
        let location = ObjectLocation::pointer();
        match self.get(&location.bucket, &location.key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                ServeError::invalid_artifact(format!("Failed to parse promotion pointer: {}", e))
            }),
            None => Ok(None),
        }
    }

    async fn fetch_dataset(&self, bucket: &str, key: &str) -> Result<DatasetObject> {
        debug!(bucket, key, "Fetching dataset");
        self.get_json(bucket, key).await
    }

    async fn append_prediction(
        &self,
        bucket: &str,
        key: &str,
        record: &PredictionRecord,
    ) -> Result<()> {
        let line = json_line(record)?;
        let _guard = self.append_lock.lock().await;

        let mut body = self.get(bucket, key).await?.unwrap_or_default();
        body.extend_from_slice(&line);
        self.put(bucket, key, body).await?;
        debug!(bucket, key, bytes = line.len(), "Prediction appended");
        Ok(())
    }
}
