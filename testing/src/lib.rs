//! # Eventguard Testing
//!
//! Testing utilities for the Eventguard messaging resilience layer.
//!
//! The centerpiece is [`InMemoryEventBus`], a synchronous in-process
//! implementation of the [`EventBus`] trait: published messages are stored
//! per topic and dispatched inline to registered handlers, so DLQ and
//! consumer behavior can be asserted without a broker.
//!
//! ## Example
//!
//! ```ignore
//! use eventguard_testing::InMemoryEventBus;
//! use eventguard_core::{handler_fn, Message};
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn dispatches_to_registered_handlers() {
//!     let bus = Arc::new(InMemoryEventBus::new());
//!     bus.consume("group", "user-events", handler_fn(|_m| async { Ok(()) }))
//!         .await
//!         .unwrap();
//!     bus.send("user-events", &[Message::new("USER_CREATED", serde_json::json!({}))])
//!         .await
//!         .unwrap();
//!     assert_eq!(bus.published("user-events").await.len(), 1);
//! }
//! ```
//!
//! [`EventBus`]: eventguard_core::EventBus

#![forbid(unsafe_code)]

use eventguard_core::event_bus::{EventBus, EventBusError, MessageHandler};
use eventguard_core::message::Message;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory event bus for tests.
///
/// # Semantics
///
/// - `send` appends the batch to the topic's log, then dispatches each
///   message to every handler registered for that topic, sequentially and
///   inline (mirroring the one-in-flight-handler-per-partition guarantee).
/// - A handler error is logged and swallowed, like a broker that simply
///   does not advance the offset; the message stays in the topic log either
///   way, so tests assert on [`published`](Self::published).
/// - Handlers registered via `consume` do not replay messages published
///   before registration.
///
/// No lock is held while a handler runs, so handlers may publish back into
/// the bus (the DLQ path does exactly this).
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, Vec<Message>>>,
    handlers: Mutex<HashMap<String, Vec<(String, MessageHandler)>>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages published to a topic, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<Message> {
        self.topics
            .lock()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of every topic that has received at least one message.
    pub async fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop all stored messages (handler registrations are kept).
    pub async fn clear(&self) {
        self.topics.lock().await.clear();
    }
}

impl EventBus for InMemoryEventBus {
    fn send(
        &self,
        topic: &str,
        messages: &[Message],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let messages = messages.to_vec();

        Box::pin(async move {
            self.topics
                .lock()
                .await
                .entry(topic.clone())
                .or_default()
                .extend(messages.iter().cloned());

            // Snapshot handlers so none of the locks are held across the
            // handler await; handlers may publish back into this bus.
            let handlers: Vec<(String, MessageHandler)> = self
                .handlers
                .lock()
                .await
                .get(&topic)
                .map(|registered| {
                    registered
                        .iter()
                        .map(|(group, handler)| (group.clone(), Arc::clone(handler)))
                        .collect()
                })
                .unwrap_or_default();

            for message in messages {
                for (group, handler) in &handlers {
                    if let Err(err) = handler(message.clone()).await {
                        tracing::warn!(
                            topic = %topic,
                            group = %group,
                            message_type = %message.message_type,
                            error = %format!("{err:#}"),
                            "Test handler failed, offset not advanced"
                        );
                    }
                }
            }
            Ok(())
        })
    }

    fn consume(
        &self,
        group_id: &str,
        topic: &str,
        handler: MessageHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let group_id = group_id.to_string();
        let topic = topic.to_string();

        Box::pin(async move {
            self.handlers
                .lock()
                .await
                .entry(topic)
                .or_default()
                .push((group_id, handler));
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use eventguard_core::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn send_stores_messages_in_publish_order() {
        let bus = InMemoryEventBus::new();
        bus.send(
            "user-events",
            &[
                Message::new("USER_CREATED", json!({"id": "u1"})),
                Message::new("USER_UPDATED", json!({"id": "u1"})),
            ],
        )
        .await
        .unwrap();

        let stored = bus.published("user-events").await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].message_type, "USER_CREATED");
        assert_eq!(stored[1].message_type, "USER_UPDATED");
    }

    #[tokio::test]
    async fn send_dispatches_to_registered_handlers() {
        let bus = InMemoryEventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        bus.consume(
            "group",
            "user-events",
            handler_fn(move |_message| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.send("user-events", &[Message::new("USER_CREATED", json!({}))])
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_does_not_fail_the_send() {
        let bus = InMemoryEventBus::new();
        bus.consume(
            "group",
            "user-events",
            handler_fn(|_message| async { anyhow::bail!("boom") }),
        )
        .await
        .unwrap();

        let result = bus
            .send("user-events", &[Message::new("USER_CREATED", json!({}))])
            .await;

        assert!(result.is_ok());
        assert_eq!(bus.published("user-events").await.len(), 1);
    }

    #[tokio::test]
    async fn handlers_may_publish_back_into_the_bus() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bus_clone = Arc::clone(&bus);

        bus.consume(
            "group",
            "user-events",
            handler_fn(move |message| {
                let bus = Arc::clone(&bus_clone);
                async move {
                    bus.send("audit-events", &[message]).await?;
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.send("user-events", &[Message::new("USER_CREATED", json!({}))])
            .await
            .unwrap();

        assert_eq!(bus.published("audit-events").await.len(), 1);
        assert_eq!(bus.topics().await, vec!["audit-events", "user-events"]);
    }
}
