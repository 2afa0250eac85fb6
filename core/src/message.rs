//! Message envelope and dead-letter wrapper types.
//!
//! Every event that crosses the bus travels inside a [`Message`] envelope:
//! a type tag, a JSON payload, an optional schema version and optional
//! metadata (correlation ID, producing service). The envelope is serialized
//! as JSON on the wire so any consumer, in any language, can read it.
//!
//! Messages that exhaust a consumer's retry budget are wrapped in a
//! [`DlqMessage`] and republished to the topic's dead-letter topic
//! (`<topic>.dlq`). The wrapper carries enough failure metadata to
//! reprocess or triage the message later. Successful consumption of a DLQ
//! record *is* its resolution; there is no separate resolved flag.
//!
//! # Typed payloads
//!
//! The bus itself is payload-agnostic: it only needs `type`, `data` and
//! `timestamp`. Producers and consumers should nevertheless validate the
//! payload variant at the boundary by implementing [`EventPayload`] for a
//! serde-derived type per event kind:
//!
//! ```
//! use eventguard_core::message::{EventPayload, Message};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct UserCreated {
//!     id: String,
//!     email: String,
//! }
//!
//! impl EventPayload for UserCreated {
//!     const EVENT_TYPE: &'static str = "USER_CREATED";
//! }
//!
//! # fn example() -> Result<(), eventguard_core::message::MessageError> {
//! let msg = UserCreated { id: "u1".into(), email: "a@b.com".into() }.into_message()?;
//! let back = UserCreated::from_message(&msg)?;
//! assert_eq!(back.id, "u1");
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Errors from envelope construction and payload extraction.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Failed to serialize a payload into the envelope.
    #[error("Failed to serialize payload: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize the envelope payload into the expected type.
    #[error("Failed to deserialize payload: {0}")]
    DeserializationFailed(String),

    /// The envelope's type tag does not match the expected event type.
    #[error("Message type mismatch: expected '{expected}', got '{actual}'")]
    TypeMismatch {
        /// The event type the consumer asked for.
        expected: String,
        /// The type tag actually present on the envelope.
        actual: String,
    },
}

/// Optional envelope metadata attached by producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageMetadata {
    /// Correlation ID for tracing a message across services.
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Name of the service that produced the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The event envelope published to and consumed from the bus.
///
/// Published atomically as part of a batch to one topic. Consumers receive
/// one message at a time; ordering is preserved per partition only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Type tag identifying the event kind (e.g. `"USER_CREATED"`).
    #[serde(rename = "type")]
    pub message_type: String,

    /// The event payload. Opaque to the bus layer.
    pub data: serde_json::Value,

    /// Optional payload schema version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// When the producer created the message.
    pub timestamp: DateTime<Utc>,

    /// Optional correlation/source metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Create a new message with the current timestamp.
    #[must_use]
    pub fn new(message_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            version: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Set the payload schema version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Attach correlation/source metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach a correlation ID, creating metadata if absent.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(MessageMetadata::default)
            .correlation_id = Some(correlation_id.into());
        self
    }

    /// Serialize the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::SerializationFailed`] if JSON encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::SerializationFailed(e.to_string()))
    }

    /// Parse an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::DeserializationFailed`] if the bytes are not
    /// a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::DeserializationFailed(e.to_string()))
    }
}

/// A strongly-typed event payload that can be placed in a [`Message`].
///
/// Implementations pin the `type` tag to a constant so consumers can
/// validate the variant at the boundary instead of poking at untyped JSON.
pub trait EventPayload: Serialize + DeserializeOwned {
    /// The stable type tag carried in the envelope's `type` field.
    const EVENT_TYPE: &'static str;

    /// Wrap this payload in a [`Message`] envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::SerializationFailed`] if the payload cannot
    /// be encoded as JSON.
    fn into_message(self) -> Result<Message, MessageError>
    where
        Self: Sized,
    {
        let data = serde_json::to_value(&self)
            .map_err(|e| MessageError::SerializationFailed(e.to_string()))?;
        Ok(Message::new(Self::EVENT_TYPE, data))
    }

    /// Extract this payload from a [`Message`], validating the type tag.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::TypeMismatch`] if the envelope carries a
    /// different event type, or [`MessageError::DeserializationFailed`] if
    /// the payload does not match this type's shape.
    fn from_message(message: &Message) -> Result<Self, MessageError> {
        if message.message_type != Self::EVENT_TYPE {
            return Err(MessageError::TypeMismatch {
                expected: Self::EVENT_TYPE.to_string(),
                actual: message.message_type.clone(),
            });
        }
        serde_json::from_value(message.data.clone())
            .map_err(|e| MessageError::DeserializationFailed(e.to_string()))
    }
}

/// Envelope type tag used for dead-letter records.
pub const DLQ_MESSAGE_TYPE: &str = "DLQ_MESSAGE";

/// Envelope type tag used for permanently failed records.
pub const PERMANENT_FAILURE_TYPE: &str = "PERMANENT_FAILURE";

/// Derive the dead-letter topic for a base topic.
#[must_use]
pub fn dlq_topic(base_topic: &str) -> String {
    format!("{base_topic}.dlq")
}

/// Derive the permanent-failure topic for a base topic.
#[must_use]
pub fn failed_topic(base_topic: &str) -> String {
    format!("{base_topic}.failed")
}

/// A quarantined message on a `<topic>.dlq` topic.
///
/// `retry_count` starts at the number of local retries the producing
/// consumer already spent, and the reprocessor increments it on each further
/// failed attempt. The record is removed implicitly by successful
/// consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqMessage {
    /// The topic the message was originally consumed from.
    #[serde(rename = "originalTopic")]
    pub original_topic: String,

    /// The message that failed processing, unmodified.
    #[serde(rename = "originalMessage")]
    pub original_message: Message,

    /// Processing attempts already spent on this message.
    #[serde(rename = "retryCount")]
    pub retry_count: u32,

    /// Message of the last failure.
    #[serde(rename = "lastError")]
    pub last_error: String,

    /// When the final local attempt failed.
    #[serde(rename = "failedAt")]
    pub failed_at: DateTime<Utc>,
}

impl DlqMessage {
    /// Build a dead-letter record for a message that exhausted its retries.
    #[must_use]
    pub fn new(
        original_topic: impl Into<String>,
        original_message: Message,
        retry_count: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self {
            original_topic: original_topic.into(),
            original_message,
            retry_count,
            last_error: last_error.into(),
            failed_at: Utc::now(),
        }
    }

    /// Wrap this record in a bus envelope for publishing to the DLQ topic.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::SerializationFailed`] if the record cannot be
    /// encoded as JSON.
    pub fn to_message(&self) -> Result<Message, MessageError> {
        let data = serde_json::to_value(self)
            .map_err(|e| MessageError::SerializationFailed(e.to_string()))?;
        Ok(Message::new(DLQ_MESSAGE_TYPE, data))
    }

    /// Extract a dead-letter record from a bus envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::TypeMismatch`] if the envelope is not a DLQ
    /// record, or [`MessageError::DeserializationFailed`] on shape mismatch.
    pub fn from_message(message: &Message) -> Result<Self, MessageError> {
        if message.message_type != DLQ_MESSAGE_TYPE {
            return Err(MessageError::TypeMismatch {
                expected: DLQ_MESSAGE_TYPE.to_string(),
                actual: message.message_type.clone(),
            });
        }
        serde_json::from_value(message.data.clone())
            .map_err(|e| MessageError::DeserializationFailed(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct UserCreated {
        id: String,
        email: String,
    }

    impl EventPayload for UserCreated {
        const EVENT_TYPE: &'static str = "USER_CREATED";
    }

    #[test]
    fn envelope_round_trips_through_wire_form() {
        let msg = Message::new("USER_CREATED", json!({"id": "u1"}))
            .with_version("1")
            .with_correlation_id("corr-42");

        let bytes = msg.to_bytes().unwrap();
        let parsed = Message::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, msg);
        assert_eq!(
            parsed.metadata.unwrap().correlation_id.as_deref(),
            Some("corr-42")
        );
    }

    #[test]
    fn wire_form_uses_original_field_names() {
        let msg = Message::new("USER_CREATED", json!({}));
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "USER_CREATED");
        assert!(value.get("version").is_none());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn typed_payload_round_trips() {
        let payload = UserCreated {
            id: "u1".to_string(),
            email: "a@b.com".to_string(),
        };
        let msg = payload.into_message().unwrap();
        assert_eq!(msg.message_type, "USER_CREATED");

        let back = UserCreated::from_message(&msg).unwrap();
        assert_eq!(back.email, "a@b.com");
    }

    #[test]
    fn typed_payload_rejects_wrong_type_tag() {
        let msg = Message::new("ORDER_PLACED", json!({"id": "u1", "email": "a@b.com"}));
        let result = UserCreated::from_message(&msg);
        assert!(matches!(result, Err(MessageError::TypeMismatch { .. })));
    }

    #[test]
    fn dlq_record_round_trips_through_envelope() {
        let original = Message::new("USER_CREATED", json!({"id": "u1"}));
        let record = DlqMessage::new("user-events", original, 3, "boom");

        let envelope = record.to_message().unwrap();
        assert_eq!(envelope.message_type, DLQ_MESSAGE_TYPE);

        let back = DlqMessage::from_message(&envelope).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn dlq_record_rejects_plain_message() {
        let msg = Message::new("USER_CREATED", json!({}));
        assert!(matches!(
            DlqMessage::from_message(&msg),
            Err(MessageError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn derived_topic_names() {
        assert_eq!(dlq_topic("user-events"), "user-events.dlq");
        assert_eq!(failed_topic("user-events"), "user-events.failed");
    }
}
