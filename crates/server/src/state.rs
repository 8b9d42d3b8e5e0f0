//! Shared application state

use std::time::{Duration, Instant};
use tidecast_common::ServeConfig;
use tidecast_proto::{ClaimCheck, PromotionPointer};
use tidecast_worker::InferenceService;
use tokio::sync::mpsc;

/// State handed to every handler; cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub service: InferenceService,
    /// Feeds the promotion listener
    pub promotions: mpsc::Sender<PromotionPointer>,
    /// Feeds the claim-check consumer; `None` disables `POST /claims`
    pub claims: Option<mpsc::Sender<ClaimCheck>>,
    pub retry_after_secs: u64,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        service: InferenceService,
        promotions: mpsc::Sender<PromotionPointer>,
        claims: Option<mpsc::Sender<ClaimCheck>>,
        config: &ServeConfig,
    ) -> Self {
        Self {
            service,
            promotions,
            claims,
            retry_after_secs: config.queue.retry_after_secs,
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
