//! Message bus plumbing
//!
//! Broker payloads are decoded here before they reach the promotion and
//! claim-check channels. When no broker is configured, output events and
//! dead-letter reports are drained into the log instead.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tidecast_common::{Result, ServeError};
use tidecast_proto::ErrorEvent;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Largest accepted broker message
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Decode one JSON message
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(ServeError::invalid_input(format!(
            "Message of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_MESSAGE_BYTES
        )));
    }
    serde_json::from_slice(payload)
        .map_err(|e| ServeError::invalid_input(format!("Malformed message: {}", e)))
}

/// Log every event until all senders are gone; returns how many were seen
pub async fn log_events<T: Serialize>(mut events: mpsc::Receiver<T>, channel: &'static str) -> usize {
    let mut seen = 0;
    while let Some(event) = events.recv().await {
        seen += 1;
        match serde_json::to_string(&event) {
            Ok(json) => info!(channel, event = %json, "Event emitted"),
            Err(e) => warn!(channel, error = %e, "Dropping event that does not serialize"),
        }
    }
    seen
}

/// Log every dead-letter report until all senders are gone
pub async fn log_dead_letters(mut reports: mpsc::Receiver<ErrorEvent>) -> usize {
    let mut seen = 0;
    while let Some(report) = reports.recv().await {
        seen += 1;
        error!(
            operation = %report.operation,
            kind = %report.kind,
            error = %report.error,
            payload = %report.payload,
            "Dead letter"
        );
    }
    seen
}
