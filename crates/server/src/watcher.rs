//! Promotion pointer watcher
//!
//! Polls the artifact store's latest pointer and forwards pointers it has
//! not seen before to the promotion listener.

use std::sync::Arc;
use std::time::Duration;
use tidecast_common::Result;
use tidecast_proto::PromotionPointer;
use tidecast_worker::ArtifactStore;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct PointerWatcher {
    store: Arc<dyn ArtifactStore>,
    promotions: mpsc::Sender<PromotionPointer>,
    interval: Duration,
    last_seen: Option<PromotionPointer>,
}

impl PointerWatcher {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        promotions: mpsc::Sender<PromotionPointer>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            promotions,
            interval,
            last_seen: None,
        }
    }

    /// Check the store once; returns whether a pointer was forwarded
    pub async fn poll_once(&mut self) -> Result<bool> {
        let Some(pointer) = self.store.latest_pointer().await? else {
            return Ok(false);
        };
        if self.last_seen.as_ref() == Some(&pointer) {
            return Ok(false);
        }

        debug!(model_id = %pointer.model_id, "New promotion pointer observed");
        if self.promotions.send(pointer.clone()).await.is_err() {
            return Ok(false);
        }
        self.last_seen = Some(pointer);
        Ok(true)
    }

    /// Poll until the promotion channel closes
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Pointer watcher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.promotions.is_closed() {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "Failed to read latest promotion pointer");
            }
        }
        info!("Pointer watcher stopped");
    }
}
