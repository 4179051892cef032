//! Inbound work item change notification model.
//!
//! Only the parts of the service hook payload that the pipeline looks at are
//! modelled. Everything except `eventType` is optional and unknown fields are
//! ignored, so partial or newer payloads still deserialize.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Well-known work item field reference names.
pub mod fields {
    /// Assignee identity, formatted as `name <email>`.
    pub const ASSIGNED_TO: &str = "System.AssignedTo";
    /// Work item type, e.g. `Bug` or `Task`.
    pub const WORK_ITEM_TYPE: &str = "System.WorkItemType";
    /// Severity, e.g. `2 - High`.
    pub const SEVERITY: &str = "Microsoft.Common.Severity";
}

/// JSON key of the event discriminator.
const EVENT_TYPE_KEY: &str = "eventType";

/// A work item change notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Event kind discriminator (e.g. "workitem.updated").
    pub event_type: String,

    /// Changed resource, absent for some event kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
}

/// The work item update carried by an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Work item identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<i64>,

    /// Field transitions keyed by field reference name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, FieldChange>,

    /// Full work item state after the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

/// Old and new value of a single field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// Work item snapshot after the update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// API URL of this revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Field values keyed by field reference name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, Value>,
}

impl InboundEvent {
    /// Read the `eventType` discriminator from a raw document.
    ///
    /// # Errors
    /// Returns `CoreError::MissingEventType` if the key is absent or not a string.
    pub fn discriminator(doc: &Value) -> Result<&str> {
        doc.get(EVENT_TYPE_KEY)
            .and_then(Value::as_str)
            .ok_or(CoreError::MissingEventType)
    }

    /// Build an event from an already parsed document.
    ///
    /// # Errors
    /// Returns `CoreError::MissingEventType` if the discriminator is absent,
    /// or `CoreError::Json` if the document has an incompatible shape.
    pub fn from_value(doc: Value) -> Result<Self> {
        Self::discriminator(&doc)?;
        Ok(serde_json::from_value(doc)?)
    }

    /// Parse an event from JSON text.
    ///
    /// # Errors
    /// Returns `CoreError::Json` on malformed input, or
    /// `CoreError::MissingEventType` if the discriminator is absent.
    pub fn from_json(input: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(input)?;
        Self::from_value(doc)
    }

    /// Work item identifier, if present.
    #[must_use]
    pub fn work_item_id(&self) -> Option<i64> {
        self.resource.as_ref().and_then(|r| r.work_item_id)
    }

    /// Transition of the named field, if the update touched it.
    #[must_use]
    pub fn field_change(&self, name: &str) -> Option<&FieldChange> {
        self.resource.as_ref().and_then(|r| r.fields.get(name))
    }

    /// New assignee set by this update, if any.
    #[must_use]
    pub fn new_assignee(&self) -> Option<&str> {
        self.field_change(fields::ASSIGNED_TO)
            .and_then(|change| change.new_value.as_ref())
            .and_then(Value::as_str)
    }

    /// Revision snapshot, if present.
    #[must_use]
    pub fn revision(&self) -> Option<&Revision> {
        self.resource.as_ref().and_then(|r| r.revision.as_ref())
    }

    /// String value of a revision field.
    #[must_use]
    pub fn revision_field(&self, name: &str) -> Option<&str> {
        self.revision()
            .and_then(|rev| rev.fields.get(name))
            .and_then(Value::as_str)
    }

    /// Work item type from the revision snapshot.
    #[must_use]
    pub fn work_item_type(&self) -> Option<&str> {
        self.revision_field(fields::WORK_ITEM_TYPE)
    }

    /// Severity from the revision snapshot.
    #[must_use]
    pub fn severity(&self) -> Option<&str> {
        self.revision_field(fields::SEVERITY)
    }

    /// Revision URL.
    #[must_use]
    pub fn revision_url(&self) -> Option<&str> {
        self.revision().and_then(|rev| rev.url.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "eventType": "workitem.updated",
            "publisherId": "tfs",
            "resource": {
                "workItemId": 42,
                "rev": 7,
                "fields": {
                    "System.AssignedTo": {
                        "oldValue": "someone <someone@example.com>",
                        "newValue": "adam.dixon <adam.dixon@cnhind.com>"
                    },
                    "System.Rev": { "oldValue": 6, "newValue": 7 }
                },
                "revision": {
                    "fields": {
                        "System.WorkItemType": "Bug",
                        "Microsoft.Common.Severity": "2 - High"
                    },
                    "url": "https://x/42"
                }
            }
        })
    }

    #[test]
    fn test_parse_full_event() {
        let event = InboundEvent::from_value(sample()).unwrap();

        assert_eq!(event.event_type, "workitem.updated");
        assert_eq!(event.work_item_id(), Some(42));
        assert_eq!(event.new_assignee(), Some("adam.dixon <adam.dixon@cnhind.com>"));
        assert_eq!(event.work_item_type(), Some("Bug"));
        assert_eq!(event.severity(), Some("2 - High"));
        assert_eq!(event.revision_url(), Some("https://x/42"));
    }

    #[test]
    fn test_missing_resource_is_not_an_error() {
        let event = InboundEvent::from_json(r#"{"eventType":"workitem.created"}"#).unwrap();

        assert!(event.resource.is_none());
        assert_eq!(event.work_item_id(), None);
        assert_eq!(event.new_assignee(), None);
        assert_eq!(event.revision_url(), None);
    }

    #[test]
    fn test_missing_discriminator() {
        let result = InboundEvent::from_json(r#"{"resource":{}}"#);
        assert!(matches!(result, Err(CoreError::MissingEventType)));

        let result = InboundEvent::from_json(r#"{"eventType":17}"#);
        assert!(matches!(result, Err(CoreError::MissingEventType)));
    }

    #[test]
    fn test_malformed_json() {
        let result = InboundEvent::from_json(r#"{"eventType":"#);
        assert!(matches!(result, Err(CoreError::Json(_))));
    }

    #[test]
    fn test_non_string_assignee_reads_as_absent() {
        let event = InboundEvent::from_value(json!({
            "eventType": "workitem.updated",
            "resource": { "fields": { "System.AssignedTo": { "newValue": 5 } } }
        }))
        .unwrap();

        assert!(event.field_change(fields::ASSIGNED_TO).is_some());
        assert_eq!(event.new_assignee(), None);
    }
}
