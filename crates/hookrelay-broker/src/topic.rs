//! Publish topic validation.

use crate::error::PublishError;

/// Longest topic MQTT can encode (two-byte length prefix).
const MAX_TOPIC_LEN: usize = 65_535;

/// Check that a topic can be published to.
///
/// Brokers drop the whole session when they receive an invalid publish
/// topic, so bad topics are rejected before anything is written.
///
/// # Errors
/// Returns `PublishError::InvalidTopic` for empty topics, wildcards, NUL
/// characters, or topics longer than 65535 bytes.
pub fn validate_topic(topic: &str) -> Result<(), PublishError> {
    if topic.is_empty() {
        return Err(PublishError::InvalidTopic("topic is empty".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(PublishError::InvalidTopic(format!(
            "topic is {} bytes, limit is {MAX_TOPIC_LEN}",
            topic.len()
        )));
    }
    if topic.contains(['+', '#']) {
        return Err(PublishError::InvalidTopic(format!(
            "'{topic}' contains a wildcard"
        )));
    }
    if topic.contains('\0') {
        return Err(PublishError::InvalidTopic(
            "topic contains a NUL character".to_string(),
        ));
    }
    Ok(())
}
