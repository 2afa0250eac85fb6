//! Redpanda event bus client for eventguard.
//!
//! This crate implements the [`EventBus`] trait from `eventguard-core` over
//! rdkafka. Redpanda speaks the standard Kafka protocol, so the same client
//! works against Apache Kafka, AWS MSK or any other Kafka-compatible broker.
//!
//! # Delivery semantics
//!
//! **At-least-once** with manual offset commits:
//! - An offset is committed only AFTER the registered handler returns `Ok`.
//! - A handler error leaves the offset uncommitted; the message is
//!   redelivered after a rebalance or restart. Handlers that must never
//!   block their partition wrap themselves with the DLQ middleware from
//!   `eventguard-runtime`, which quarantines the message and returns `Ok`.
//! - Within a partition, handler invocations are strictly sequential.
//! - Subscribers must be idempotent (correlation IDs detect duplicates).
//!
//! # Degraded mode
//!
//! An unreachable broker fails the individual `send` or `consume` call, not
//! the process: the producer is created up front from configuration alone,
//! and connectivity problems surface per operation as
//! [`EventBusError::PublishFailed`] or redelivery.
//!
//! # Example
//!
//! ```no_run
//! use eventguard_core::event_bus::{EventBus, handler_fn};
//! use eventguard_core::message::Message;
//! use eventguard_redpanda::RedpandaBusClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBusClient::new("localhost:9092")?;
//!
//! let msg = Message::new("USER_CREATED", serde_json::json!({"id": "u1"}));
//! bus.send("user-events", &[msg]).await?;
//!
//! bus.consume(
//!     "notification-service",
//!     "user-events",
//!     handler_fn(|message| async move {
//!         println!("received {}", message.message_type);
//!         Ok(())
//!     }),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use eventguard_core::event_bus::{EventBus, EventBusError, MessageHandler};
use eventguard_core::message::Message;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Redpanda-backed event bus client.
///
/// A single instance is shared by every producer and consumer in the
/// process. Publishing uses one async producer with batching; each
/// `consume` call creates its own consumer joined to the given group.
///
/// # Example
///
/// ```no_run
/// use eventguard_redpanda::RedpandaBusClient;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaBusClient::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBusClient {
    /// Kafka producer for publishing messages.
    producer: FutureProducer,
    /// Broker addresses (consumers are created per subscription).
    brokers: String,
    /// Producer send timeout.
    timeout: Duration,
    /// Auto offset reset policy for new consumer groups.
    auto_offset_reset: String,
}

impl RedpandaBusClient {
    /// Create a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created from the configuration.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for custom configuration.
    #[must_use]
    pub fn builder() -> RedpandaBusClientBuilder {
        RedpandaBusClientBuilder::default()
    }

    /// The configured broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for a [`RedpandaBusClient`].
#[derive(Default)]
pub struct RedpandaBusClientBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBusClientBuilder {
    /// Set the broker addresses (comma-separated, e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"1"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`,
    /// `"zstd"`.
    ///
    /// Default: `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set where new consumer groups start reading when no committed offset
    /// exists: `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: `"latest"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaBusClient`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaBusClient, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            compression = self.compression.as_deref().unwrap_or("none"),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest"),
            "Redpanda bus client created"
        );

        Ok(RedpandaBusClient {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
        })
    }
}

impl EventBus for RedpandaBusClient {
    fn send(
        &self,
        topic: &str,
        messages: &[Message],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let messages = messages.to_vec();
        let timeout = self.timeout;

        Box::pin(async move {
            for message in &messages {
                let payload = message
                    .to_bytes()
                    .map_err(|e| EventBusError::SerializationFailed(e.to_string()))?;

                // Keyed by message type so messages of one kind land on one
                // partition and keep their order.
                let record = FutureRecord::to(&topic)
                    .payload(&payload)
                    .key(message.message_type.as_bytes());

                match self.producer.send(record, Timeout::After(timeout)).await {
                    Ok((partition, offset)) => {
                        tracing::debug!(
                            topic = %topic,
                            partition = partition,
                            offset = offset,
                            message_type = %message.message_type,
                            "Message published"
                        );
                        metrics::counter!("event_bus.published", "topic" => topic.clone())
                            .increment(1);
                    }
                    Err((kafka_error, _)) => {
                        tracing::error!(
                            topic = %topic,
                            message_type = %message.message_type,
                            error = %kafka_error,
                            "Failed to publish message"
                        );
                        metrics::counter!("event_bus.publish_failed", "topic" => topic.clone())
                            .increment(1);
                        return Err(EventBusError::PublishFailed {
                            topic,
                            reason: kafka_error.to_string(),
                        });
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
        let brokers = self.brokers.clone();
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            // Manual commit for at-least-once delivery.
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topic: topic.clone(),
                    group_id: group_id.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topic: topic.clone(),
                    group_id: group_id.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topic = %topic,
                group_id = %group_id,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to topic"
            );

            // The spawned task owns the consumer; the stream yields one
            // record at a time, so handler invocations are sequential.
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(record_result) = stream.next().await {
                    let record = match record_result {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::warn!(
                                topic = %topic,
                                group_id = %group_id,
                                error = %e,
                                "Error receiving from broker"
                            );
                            continue;
                        }
                    };

                    let message = record.payload().and_then(|payload| {
                        match Message::from_bytes(payload) {
                            Ok(message) => Some(message),
                            Err(e) => {
                                tracing::warn!(
                                    topic = %topic,
                                    partition = record.partition(),
                                    offset = record.offset(),
                                    error = %e,
                                    "Malformed message payload"
                                );
                                None
                            }
                        }
                    });

                    let Some(message) = message else {
                        // Commit malformed and empty records so they cannot
                        // poison the partition.
                        metrics::counter!("event_bus.malformed", "topic" => topic.clone())
                            .increment(1);
                        commit(&consumer, &record);
                        continue;
                    };

                    tracing::trace!(
                        topic = %topic,
                        partition = record.partition(),
                        offset = record.offset(),
                        message_type = %message.message_type,
                        "Message received"
                    );

                    match handler(message).await {
                        Ok(()) => {
                            metrics::counter!("event_bus.consumed", "topic" => topic.clone())
                                .increment(1);
                            // Commit only after handler success; a crash
                            // before this point redelivers the message.
                            commit(&consumer, &record);
                        }
                        Err(e) => {
                            // Offset stays uncommitted; the message will be
                            // redelivered. DLQ-wrapped handlers never reach
                            // this branch.
                            tracing::error!(
                                topic = %topic,
                                group_id = %group_id,
                                partition = record.partition(),
                                offset = record.offset(),
                                error = %e,
                                "Handler failed, offset not committed"
                            );
                            metrics::counter!("event_bus.handler_failed", "topic" => topic.clone())
                                .increment(1);
                        }
                    }
                }

                tracing::debug!(topic = %topic, group_id = %group_id, "Consumer task exiting");
            });

            Ok(())
        })
    }
}

fn commit(consumer: &StreamConsumer, record: &rdkafka::message::BorrowedMessage<'_>) {
    if let Err(e) = consumer.commit_message(record, CommitMode::Async) {
        tracing::warn!(
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_client_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBusClient>();
        assert_sync::<RedpandaBusClient>();
    }

    #[test]
    fn builder_requires_brokers() {
        let result = RedpandaBusClient::builder().build();
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }

    #[test]
    fn builder_default_works() {
        let _builder = RedpandaBusClient::builder();
    }
}
