//! Tidecast common library
//!
//! This crate contains the configuration, error taxonomy and telemetry shared
//! by the serving core and the HTTP front end.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::ServeConfig;
pub use error::{ErrorKind, Result, ServeError};
pub use metrics::{Telemetry, TelemetrySnapshot};
