//! Shared caches
//!
//! The reference dataset and the last prediction are the only request data
//! shared between requests. Both are replaced wholesale through an atomic
//! swap and never edited in place; readers of the dataset get their own
//! deep copy.

use crate::features::Frame;
use crate::inference::Prediction;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::info;

/// Reference dataset used by requests that carry no data
#[derive(Debug, Default)]
pub struct DatasetCache {
    current: ArcSwapOption<Frame>,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached dataset
    pub fn replace(&self, frame: Frame) {
        info!(rows = frame.len(), "Reference dataset replaced");
        self.current.store(Some(Arc::new(frame)));
    }

    /// A private copy of the cached dataset
    pub fn snapshot(&self) -> Option<Frame> {
        self.current.load_full().map(|frame| Frame::clone(&frame))
    }

    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }
}

/// Last successful prediction
#[derive(Debug, Default)]
pub struct PredictionCache {
    last: ArcSwapOption<Prediction>,
}

impl PredictionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, prediction: Prediction) {
        self.last.store(Some(Arc::new(prediction)));
    }

    pub fn get(&self) -> Option<Arc<Prediction>> {
        self.last.load_full()
    }
}
