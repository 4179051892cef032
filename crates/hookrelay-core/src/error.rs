//! Error types for hookrelay-core.

use thiserror::Error;

/// Result type alias for hookrelay-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while reading an inbound event.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The document is not valid JSON, or has the wrong shape.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The `eventType` discriminator is absent or not a string.
    #[error("missing event type discriminator")]
    MissingEventType,
}
