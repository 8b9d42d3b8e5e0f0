//! Tidecast HTTP server
//!
//! Axum ingress over the inference service, the promotion pointer
//! watcher, and the message bus bridges feeding the background consumers.

pub mod api;
pub mod bus;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod state;
pub mod watcher;

pub use api::create_router;
pub use error::ApiError;
pub use state::AppState;
pub use watcher::PointerWatcher;
