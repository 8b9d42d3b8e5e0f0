//! Model registry
//!
//! Holds the single active [`ModelHandle`] behind an atomically swappable
//! reference. Workers call [`ModelRegistry::current`] once per request and
//! keep the returned `Arc` until they finish, so a promotion never changes
//! the model under a running request.
//!
//! Promotions are serialized. Each one validates the pointer, fetches
//! artifacts with bounded retries, builds the new handle completely and only
//! then swaps it in. A failed promotion leaves the previous model active.

use crate::artifact::ArtifactStore;
use crate::model::{pointer_timestamp, ModelHandle};
use crate::retry::RetryPolicy;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tidecast_common::{Result, Telemetry};
use tidecast_proto::PromotionPointer;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// Result of a promotion attempt that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// The new model is active
    Applied { previous: Option<String> },
    /// The pointer names the model already active
    Unchanged,
    /// The pointer is older than the active model
    Stale,
    /// The pointer was trained against a different configuration
    Ignored { fingerprint: String },
}

impl PromotionOutcome {
    /// Label for `promotions_total{result}`
    pub fn label(&self) -> &'static str {
        match self {
            PromotionOutcome::Applied { .. } => "applied",
            PromotionOutcome::Unchanged => "unchanged",
            PromotionOutcome::Stale => "stale",
            PromotionOutcome::Ignored { .. } => "ignored",
        }
    }
}

/// Owner of the active model handle
pub struct ModelRegistry {
    current: ArcSwapOption<ModelHandle>,
    expected_fingerprint: Option<String>,
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
    promote_lock: Mutex<()>,
    telemetry: Telemetry,
}

impl ModelRegistry {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        expected_fingerprint: Option<String>,
        retry: RetryPolicy,
        telemetry: Telemetry,
    ) -> Self {
        if expected_fingerprint.is_none() {
            warn!("No expected config fingerprint set; every promotion will be accepted");
        }
        telemetry.set_model_ready(false);
        Self {
            current: ArcSwapOption::empty(),
            expected_fingerprint,
            store,
            retry,
            promote_lock: Mutex::new(()),
            telemetry,
        }
    }

    /// The active handle, if any; never blocks
    pub fn current(&self) -> Option<Arc<ModelHandle>> {
        self.current.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Apply a promotion pointer
    ///
    /// Errors mean the promotion was abandoned; the previous model, if
    /// any, stays active.
    pub async fn promote(&self, pointer: &PromotionPointer) -> Result<PromotionOutcome> {
        let _serialized = self.promote_lock.lock().await;

        let result = self.try_promote(pointer).await;
        match &result {
            Ok(outcome) => {
                self.telemetry.record_promotion(outcome.label());
            }
            Err(e) => {
                self.telemetry.record_promotion("failed");
                error!(
                    model_id = %pointer.model_id,
                    uri = %pointer.artifact_uri,
                    error = %e,
                    "Promotion abandoned; keeping current model"
                );
            }
        }
        result
    }

    async fn try_promote(&self, pointer: &PromotionPointer) -> Result<PromotionOutcome> {
        if let Some(expected) = &self.expected_fingerprint {
            if &pointer.config_fingerprint != expected {
                warn!(
                    model_id = %pointer.model_id,
                    fingerprint = %pointer.config_fingerprint,
                    expected = %expected,
                    "Ignoring promotion with mismatched config fingerprint"
                );
                return Ok(PromotionOutcome::Ignored {
                    fingerprint: pointer.config_fingerprint.clone(),
                });
            }
        }

        let promoted_at = pointer_timestamp(pointer)?;
        if let Some(active) = self.current() {
            if active.model_id() == pointer.model_id {
                info!(model_id = %pointer.model_id, "Promoted model already active");
                return Ok(PromotionOutcome::Unchanged);
            }
            if promoted_at < active.promoted_at() {
                warn!(
                    model_id = %pointer.model_id,
                    active = %active.model_id(),
                    "Ignoring stale promotion"
                );
                return Ok(PromotionOutcome::Stale);
            }
        }

        info!(
            model_id = %pointer.model_id,
            kind = %pointer.model_kind,
            uri = %pointer.artifact_uri,
            score = ?pointer.score,
            "Loading promoted model"
        );

        let uri = pointer.artifact_uri.as_str();
        let artifacts = self
            .retry
            .run("model artifacts", || self.store.fetch_model(uri))
            .await?;
        let handle = ModelHandle::new(pointer, artifacts)?;

        let sanitized = handle.scaler().sanitized_count();
        if sanitized > 0 {
            self.telemetry.record_sanitized_features(sanitized);
        }

        let previous = self
            .current
            .swap(Some(Arc::new(handle)))
            .map(|old| old.model_id().to_string());
        self.telemetry.set_model_ready(true);

        info!(
            model_id = %pointer.model_id,
            previous = ?previous,
            sanitized_features = sanitized,
            "Model promoted"
        );
        Ok(PromotionOutcome::Applied { previous })
    }

    /// Promote the store's latest pointer, if there is one
    ///
    /// Returns whether a model is active afterwards.
    pub async fn autoload(&self) -> Result<bool> {
        let latest = self
            .retry
            .run("latest promotion pointer", || self.store.latest_pointer())
            .await?;

        match latest {
            Some(pointer) => {
                self.promote(&pointer).await?;
            }
            None => {
                warn!("No promoted model available; service stays not-ready");
            }
        }
        Ok(self.is_ready())
    }

    /// Consume promotion events until the channel closes
    pub async fn run_listener(self: Arc<Self>, mut events: mpsc::Receiver<PromotionPointer>) {
        info!("Promotion listener started");
        while let Some(pointer) = events.recv().await {
            if let Ok(outcome) = self.promote(&pointer).await {
                info!(model_id = %pointer.model_id, result = outcome.label(), "Promotion event handled");
            }
        }
        info!("Promotion channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::model::{test_support, ModelArtifacts};
    use tidecast_common::config::default_latency_buckets;
    use tidecast_common::ServeError;

    fn artifacts() -> ModelArtifacts {
        ModelArtifacts {
            weights: test_support::naive(2, 1),
            scaler: test_support::scaler(&["load", "flag"], &[0.0, 1.0], &[1.0, 0.0]),
        }
    }

    fn registry(fingerprint: Option<&str>) -> (Arc<ModelRegistry>, Arc<MemoryArtifactStore>, Telemetry) {
        let store = Arc::new(MemoryArtifactStore::new());
        let telemetry = Telemetry::new(default_latency_buckets()).unwrap();
        let registry = Arc::new(ModelRegistry::new(
            store.clone(),
            fingerprint.map(str::to_string),
            RetryPolicy::immediate(3),
            telemetry.clone(),
        ));
        (registry, store, telemetry)
    }

    #[tokio::test]
    async fn test_promote_swaps_handle() {
        let (registry, store, telemetry) = registry(Some("fp"));
        assert!(!registry.is_ready());

        let pointer = test_support::pointer("m1", "naive", "2024-01-01T00:00:00Z");
        store.insert_model(pointer.artifact_uri.clone(), artifacts());

        let outcome = registry.promote(&pointer).await.unwrap();
        assert_eq!(outcome, PromotionOutcome::Applied { previous: None });
        assert_eq!(registry.current().unwrap().model_id(), "m1");
        assert!(telemetry.snapshot().model_ready);

        let again = registry.promote(&pointer).await.unwrap();
        assert_eq!(again, PromotionOutcome::Unchanged);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_ignored() {
        let (registry, store, _) = registry(Some("other"));
        let pointer = test_support::pointer("m1", "naive", "2024-01-01T00:00:00Z");
        store.insert_model(pointer.artifact_uri.clone(), artifacts());

        let outcome = registry.promote(&pointer).await.unwrap();
        assert!(matches!(outcome, PromotionOutcome::Ignored { .. }));
        assert!(!registry.is_ready());
        assert_eq!(store.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_pointer_is_ignored() {
        let (registry, store, _) = registry(None);
        let newer = test_support::pointer("m2", "naive", "2024-02-01T00:00:00Z");
        let older = test_support::pointer("m1", "naive", "2024-01-01T00:00:00Z");
        store.insert_model(newer.artifact_uri.clone(), artifacts());
        store.insert_model(older.artifact_uri.clone(), artifacts());

        registry.promote(&newer).await.unwrap();
        let outcome = registry.promote(&older).await.unwrap();
        assert_eq!(outcome, PromotionOutcome::Stale);
        assert_eq!(registry.current().unwrap().model_id(), "m2");
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_model() {
        let (registry, store, telemetry) = registry(None);
        let first = test_support::pointer("m1", "naive", "2024-01-01T00:00:00Z");
        let second = test_support::pointer("m2", "naive", "2024-02-01T00:00:00Z");
        store.insert_model(first.artifact_uri.clone(), artifacts());
        store.insert_model(second.artifact_uri.clone(), artifacts());
        registry.promote(&first).await.unwrap();

        store.fail_next(3);
        let err = registry.promote(&second).await.unwrap_err();
        assert!(matches!(err, ServeError::UpstreamFetchFailure(_)));
        assert_eq!(registry.current().unwrap().model_id(), "m1");
        assert_eq!(telemetry.snapshot().promotions.get("failed"), Some(&1));

        store.fail_next(2);
        registry.promote(&second).await.unwrap();
        assert_eq!(registry.current().unwrap().model_id(), "m2");
    }

    #[tokio::test]
    async fn test_invalid_artifact_is_rejected() {
        let (registry, store, _) = registry(None);
        let pointer = test_support::pointer("m1", "gru", "2024-01-01T00:00:00Z");
        store.insert_model(pointer.artifact_uri.clone(), artifacts());

        let err = registry.promote(&pointer).await.unwrap_err();
        assert!(matches!(err, ServeError::InvalidArtifact(_)));
        assert!(!registry.is_ready());
    }

    #[tokio::test]
    async fn test_autoload_without_pointer_stays_not_ready() {
        let (registry, store, telemetry) = registry(None);
        assert!(!registry.autoload().await.unwrap());

        let pointer = test_support::pointer("m1", "naive", "2024-01-01T00:00:00Z");
        store.insert_model(pointer.artifact_uri.clone(), artifacts());
        store.set_latest(pointer);
        assert!(registry.autoload().await.unwrap());
        assert_eq!(telemetry.snapshot().promotions.get("applied"), Some(&1));
    }

    #[tokio::test]
    async fn test_listener_applies_events() {
        let (registry, store, _) = registry(None);
        let pointer = test_support::pointer("m1", "naive", "2024-01-01T00:00:00Z");
        store.insert_model(pointer.artifact_uri.clone(), artifacts());

        let (tx, rx) = mpsc::channel(4);
        let listener = tokio::spawn(registry.clone().run_listener(rx));
        tx.send(pointer).await.unwrap();
        drop(tx);
        listener.await.unwrap();

        assert!(registry.is_ready());
    }
}
