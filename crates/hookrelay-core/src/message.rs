//! Outbound message published to the broker.

use crate::event::InboundEvent;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Reduced projection of a forwarded work item update.
///
/// Field names on the wire are PascalCase, as read by the device-side
/// consumers. Values missing from the source event are sent as `null`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundMessage {
    pub work_item_id: Option<i64>,
    #[serde(rename = "Type")]
    pub work_item_type: Option<String>,
    pub url: Option<String>,
    pub severity: Option<String>,
}

impl OutboundMessage {
    /// Project an inbound event.
    #[must_use]
    pub fn project(event: &InboundEvent) -> Self {
        Self {
            work_item_id: event.work_item_id(),
            work_item_type: event.work_item_type().map(str::to_string),
            url: event.revision_url().map(str::to_string),
            severity: event.severity().map(str::to_string),
        }
    }

    /// Serialize for transport.
    ///
    /// # Errors
    /// Returns `CoreError::Json` if serialization fails.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a payload produced by [`OutboundMessage::to_payload`].
    ///
    /// # Errors
    /// Returns `CoreError::Json` if the payload is not a valid message.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
