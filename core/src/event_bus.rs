//! Event bus abstraction for cross-service messaging.
//!
//! This module provides the [`EventBus`] trait: atomic batch publishing to
//! topics and handler registration per consumer group. Implementations are
//! clients of a log-based topic broker, not the broker itself.
//!
//! # Delivery semantics
//!
//! - **At-least-once**: a message may be redelivered after a crash between
//!   processing and offset commit. Handlers must be idempotent or rely on
//!   the DLQ/retry wrapper for exactly this reason.
//! - **Per-partition ordering**: handler invocations for a topic partition
//!   are strictly sequential; different partitions, topics and services run
//!   fully in parallel.
//! - **Commit after success**: implementations commit a message's offset
//!   only after the handler returns `Ok`. An error from the handler must not
//!   advance the offset — unless the handler is DLQ-wrapped, in which case
//!   quarantine already happened and the wrapper returns `Ok`.
//!
//! # Topic naming convention
//!
//! Topics follow the pattern `{domain}-events` (`user-events`,
//! `content-events`); derived dead-letter topics append `.dlq`.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventguard_core::event_bus::{EventBus, handler_fn};
//! use eventguard_core::message::Message;
//!
//! async fn example(bus: &dyn EventBus) -> anyhow::Result<()> {
//!     let msg = Message::new("USER_CREATED", serde_json::json!({"id": "u1"}));
//!     bus.send("user-events", &[msg]).await?;
//!
//!     bus.consume(
//!         "notification-service",
//!         "user-events",
//!         handler_fn(|message| async move {
//!             tracing::info!(message_type = %message.message_type, "received");
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

use crate::message::Message;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a batch to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe a consumer group to a topic.
    #[error("Subscription failed for topic '{topic}' (group '{group_id}'): {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe.
        topic: String,
        /// The consumer group.
        group_id: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to deserialize a message envelope.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Failed to serialize a message envelope.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Network or transport error.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Boxed future returned by message handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A business handler registered against a topic/group pair.
///
/// Handlers receive one [`Message`] at a time and return success or failure
/// only; they never touch broker offsets directly.
pub type MessageHandler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Trait for event bus client implementations.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`; a single bus handle is shared by
/// every producer and consumer in the process.
///
/// # Dyn compatibility
///
/// Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
/// the bus can be held as `Arc<dyn EventBus>` by middleware such as the DLQ
/// wrapper.
pub trait EventBus: Send + Sync {
    /// Publish a batch of messages atomically to one topic.
    ///
    /// There is no built-in retry: callers decide. Publish failures are
    /// surfaced, never silently dropped.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the batch could not be
    /// delivered, or [`EventBusError::SerializationFailed`] if a message
    /// could not be encoded.
    fn send(
        &self,
        topic: &str,
        messages: &[Message],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe a consumer group to a topic and register a handler.
    ///
    /// The bus invokes `handler` for each delivered message, one at a time
    /// per partition, and commits the offset only after the handler returns
    /// `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription
    /// could not be established.
    fn consume(
        &self,
        group_id: &str,
        topic: &str,
        handler: MessageHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_fn_wraps_closures() {
        let handler = handler_fn(|_message| async move { Ok(()) });
        // The wrapped handler is cloneable and shareable.
        let _clone: MessageHandler = Arc::clone(&handler);
    }

    #[tokio::test]
    async fn handler_fn_propagates_failure() {
        let handler = handler_fn(|_message| async move { anyhow::bail!("boom") });
        let msg = Message::new("TEST", serde_json::json!({}));
        let result = handler(msg).await;
        assert!(result.is_err());
    }
}
