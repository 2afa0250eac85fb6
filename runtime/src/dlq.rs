//! Dead-letter queue middleware and reprocessing.
//!
//! [`with_dlq`] decorates a consumer handler: on failure it retries
//! in-process up to a bound, then republishes the message to the derived
//! `<topic>.dlq` topic with failure metadata and returns success so the
//! consumer offset advances. A blocked partition is worse than a
//! quarantined message: it starves every message behind it.
//!
//! [`DlqProcessor`] drains a `.dlq` topic through the original business
//! handler with the remaining retry budget, for manual or scheduled
//! reprocessing. Records that still fail go to `<topic>.failed` and are
//! reported, never automatically re-queued — that would reopen an unbounded
//! quarantine loop.
//!
//! # Retry ceiling
//!
//! `max_retries` is a single ceiling shared by both layers: the middleware
//! spends up to `max_retries` local attempts and records that count in the
//! [`DlqMessage`]; the reprocessor only gets the remainder
//! (`max_retries - retry_count`, never fewer than one attempt).
//!
//! # Example
//!
//! ```rust,ignore
//! use eventguard_runtime::dlq::{DlqConfig, with_dlq};
//! use eventguard_core::handler_fn;
//!
//! let wrapped = with_dlq(
//!     bus.clone(),
//!     "user-events",
//!     handler_fn(handle_user_event),
//!     DlqConfig::default(),
//! );
//! bus.consume("user-service", "user-events", wrapped).await?;
//! ```

use eventguard_core::event_bus::{EventBus, EventBusError, MessageHandler};
use eventguard_core::message::{
    DlqMessage, Message, PERMANENT_FAILURE_TYPE, dlq_topic, failed_topic,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::retry::RetryPolicy;

/// Backoff cap between reprocessing attempts.
const REPROCESS_MAX_DELAY: Duration = Duration::from_secs(60);

/// Dead-letter queue configuration.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Total processing attempts allowed per message, shared between the
    /// consumer-side middleware and the reprocessor.
    pub max_retries: u32,
    /// Delay between in-process attempts.
    pub retry_delay: Duration,
    /// When false, handlers run unprotected and failures are not
    /// quarantined.
    pub enabled: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(5000),
            enabled: true,
        }
    }
}

impl DlqConfig {
    /// Set the attempt budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between attempts.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Enable or disable quarantine.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Read configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `EVENTGUARD_DLQ_MAX_RETRIES`,
    /// `EVENTGUARD_DLQ_RETRY_DELAY_MS`, `EVENTGUARD_DLQ_ENABLED`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("EVENTGUARD_DLQ_MAX_RETRIES") {
            if let Ok(parsed) = value.parse() {
                config.max_retries = parsed;
            }
        }
        if let Ok(value) = std::env::var("EVENTGUARD_DLQ_RETRY_DELAY_MS") {
            if let Ok(parsed) = value.parse() {
                config.retry_delay = Duration::from_millis(parsed);
            }
        }
        if let Ok(value) = std::env::var("EVENTGUARD_DLQ_ENABLED") {
            config.enabled = value != "false" && value != "0";
        }
        config
    }
}

/// Wrap a consumer handler with bounded retries and DLQ quarantine.
///
/// The wrapped handler attempts the inner handler up to
/// `config.max_retries` times (minimum one), sleeping `config.retry_delay`
/// between attempts while the original message stays unacknowledged. If
/// every attempt fails, a [`DlqMessage`] carrying the attempt count and the
/// last error is published to `<base_topic>.dlq` and the wrapper returns
/// `Ok`, so the partition is never blocked by a poison message.
///
/// A failure to publish the quarantine record is logged and swallowed;
/// taking the consumer down would lose more than one message.
///
/// With `enabled = false` the handler is returned unwrapped and failures
/// propagate to the bus (no quarantine, message redelivered per broker
/// semantics).
#[must_use]
pub fn with_dlq(
    bus: Arc<dyn EventBus>,
    base_topic: impl Into<String>,
    handler: MessageHandler,
    config: DlqConfig,
) -> MessageHandler {
    let base_topic: Arc<str> = Arc::from(base_topic.into());

    if !config.enabled {
        tracing::warn!(
            topic = %base_topic,
            "DLQ wrapping disabled, failed messages will not be quarantined"
        );
        return handler;
    }

    let max_attempts = config.max_retries.max(1);
    let retry_delay = config.retry_delay;

    Arc::new(move |message: Message| {
        let bus = Arc::clone(&bus);
        let handler = Arc::clone(&handler);
        let base_topic = Arc::clone(&base_topic);

        Box::pin(async move {
            let mut last_error = String::new();

            for attempt in 1..=max_attempts {
                match handler(message.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        last_error = format!("{err:#}");
                        tracing::warn!(
                            topic = %base_topic,
                            message_type = %message.message_type,
                            attempt,
                            max_attempts,
                            error = %last_error,
                            "Handler failed"
                        );
                        if attempt < max_attempts {
                            sleep(retry_delay).await;
                        }
                    }
                }
            }

            quarantine(&*bus, &base_topic, message, max_attempts, last_error).await;
            // The message is quarantined; report success so the offset
            // advances and the partition keeps moving.
            Ok(())
        })
    })
}

/// Publish a dead-letter record for a message that exhausted its retries.
async fn quarantine(
    bus: &dyn EventBus,
    base_topic: &str,
    message: Message,
    retry_count: u32,
    last_error: String,
) {
    let message_type = message.message_type.clone();
    let record = DlqMessage::new(base_topic, message, retry_count, last_error);
    let topic = dlq_topic(base_topic);

    let envelope = match record.to_message() {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::error!(
                topic = %topic,
                message_type = %message_type,
                error = %err,
                "Failed to encode DLQ record, message lost"
            );
            return;
        }
    };

    match bus.send(&topic, std::slice::from_ref(&envelope)).await {
        Ok(()) => {
            tracing::info!(
                topic = %topic,
                original_topic = %base_topic,
                message_type = %message_type,
                retry_count = record.retry_count,
                error = %record.last_error,
                "Message quarantined to DLQ"
            );
            metrics::counter!("dlq.quarantined", "topic" => base_topic.to_string()).increment(1);
        }
        Err(err) => {
            tracing::error!(
                topic = %topic,
                message_type = %message_type,
                error = %err,
                "Failed to publish DLQ record"
            );
            metrics::counter!("dlq.publish_failed", "topic" => base_topic.to_string()).increment(1);
        }
    }
}

/// Drains `.dlq` topics through the original business handler.
pub struct DlqProcessor {
    bus: Arc<dyn EventBus>,
    config: DlqConfig,
}

impl DlqProcessor {
    /// Create a processor over the given bus.
    #[must_use]
    pub const fn new(bus: Arc<dyn EventBus>, config: DlqConfig) -> Self {
        Self { bus, config }
    }

    /// Re-invoke the original handler for one quarantined record.
    ///
    /// The attempt budget is the configured `max_retries` minus the
    /// attempts already recorded on the record, but never fewer than one.
    /// Attempts back off exponentially from `retry_delay`, capped at 60s.
    ///
    /// Returns `true` on success (consumption is resolution) and `false`
    /// if the record still fails after the budget. On `false` the record is
    /// forwarded to `<topic>.failed`; re-publishing to the DLQ is left to
    /// the caller so the quarantine loop stays bounded.
    pub async fn process_dlq_message(&self, record: &DlqMessage, handler: &MessageHandler) -> bool {
        let budget = self
            .config
            .max_retries
            .saturating_sub(record.retry_count)
            .max(1);
        let backoff = RetryPolicy::default()
            .with_initial_delay(self.config.retry_delay)
            .with_max_delay(REPROCESS_MAX_DELAY);

        let mut last_error = record.last_error.clone();
        for attempt in 0..budget {
            if attempt > 0 {
                sleep(backoff.delay_for_attempt(attempt - 1)).await;
            }
            match handler(record.original_message.clone()).await {
                Ok(()) => {
                    tracing::info!(
                        topic = %record.original_topic,
                        message_type = %record.original_message.message_type,
                        prior_retries = record.retry_count,
                        attempt = attempt + 1,
                        "DLQ message reprocessed successfully"
                    );
                    metrics::counter!("dlq.reprocessed", "topic" => record.original_topic.clone())
                        .increment(1);
                    return true;
                }
                Err(err) => {
                    last_error = format!("{err:#}");
                    tracing::warn!(
                        topic = %record.original_topic,
                        message_type = %record.original_message.message_type,
                        attempt = attempt + 1,
                        budget,
                        error = %last_error,
                        "DLQ reprocessing attempt failed"
                    );
                }
            }
        }

        tracing::error!(
            topic = %record.original_topic,
            message_type = %record.original_message.message_type,
            total_retries = record.retry_count + budget,
            "DLQ message still failing after reprocessing budget"
        );
        metrics::counter!("dlq.exhausted", "topic" => record.original_topic.clone()).increment(1);
        self.send_to_failed_topic(record, budget, last_error).await;
        false
    }

    /// Subscribe to `<base_topic>.dlq` and reprocess each record through
    /// `handler`.
    ///
    /// Records that still fail are reported (log, counter, `.failed` topic)
    /// and committed; they are never retried automatically.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the `.dlq`
    /// subscription cannot be established.
    pub async fn run(
        &self,
        group_id: &str,
        base_topic: &str,
        handler: MessageHandler,
    ) -> Result<(), EventBusError> {
        let processor = Self::new(Arc::clone(&self.bus), self.config.clone());
        let topic = dlq_topic(base_topic);

        let dispatch: MessageHandler = Arc::new(move |envelope: Message| {
            let processor = Self::new(Arc::clone(&processor.bus), processor.config.clone());
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let record = match DlqMessage::from_message(&envelope) {
                    Ok(record) => record,
                    Err(err) => {
                        // Not a DLQ record; commit it rather than loop on it.
                        tracing::error!(error = %err, "Malformed DLQ record, skipping");
                        return Ok(());
                    }
                };
                if !processor.process_dlq_message(&record, &handler).await {
                    tracing::error!(
                        topic = %record.original_topic,
                        message_type = %record.original_message.message_type,
                        "DLQ record left unresolved, see failed topic"
                    );
                }
                Ok(())
            })
        });

        self.bus.consume(group_id, &topic, dispatch).await
    }

    async fn send_to_failed_topic(&self, record: &DlqMessage, spent: u32, last_error: String) {
        let mut exhausted = record.clone();
        exhausted.retry_count += spent;
        exhausted.last_error = last_error;
        exhausted.failed_at = chrono::Utc::now();

        let topic = failed_topic(&record.original_topic);
        let data = match serde_json::to_value(&exhausted) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(topic = %topic, error = %err, "Failed to encode permanent failure record");
                return;
            }
        };
        let envelope = Message::new(PERMANENT_FAILURE_TYPE, data);

        if let Err(err) = self.bus.send(&topic, std::slice::from_ref(&envelope)).await {
            tracing::error!(
                topic = %topic,
                error = %err,
                "Failed to publish permanent failure record"
            );
        } else {
            tracing::warn!(
                topic = %topic,
                original_topic = %record.original_topic,
                retry_count = exhausted.retry_count,
                "Message sent to permanent failure topic"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use eventguard_core::handler_fn;
    use eventguard_testing::InMemoryEventBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(max_retries: u32) -> DlqConfig {
        DlqConfig::default()
            .with_max_retries(max_retries)
            .with_retry_delay(Duration::from_millis(5))
    }

    fn always_failing(calls: Arc<AtomicUsize>) -> MessageHandler {
        handler_fn(move |_message| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("boom")
            }
        })
    }

    /// Bus whose publishes always fail, as when the broker is unreachable.
    #[derive(Default)]
    struct FailingBus {
        sends: AtomicUsize,
    }

    impl EventBus for FailingBus {
        fn send(
            &self,
            topic: &str,
            _messages: &[Message],
        ) -> std::pin::Pin<
            Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>,
        > {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let topic = topic.to_string();
            Box::pin(async move {
                Err(EventBusError::PublishFailed {
                    topic,
                    reason: "broker unreachable".to_string(),
                })
            })
        }

        fn consume(
            &self,
            _group_id: &str,
            _topic: &str,
            _handler: MessageHandler,
        ) -> std::pin::Pin<
            Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>,
        > {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn exhausted_retries_publish_one_dlq_record() {
        let bus = Arc::new(InMemoryEventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = with_dlq(
            bus.clone(),
            "user-events",
            always_failing(Arc::clone(&calls)),
            fast_config(3),
        );

        let message = Message::new("USER_CREATED", json!({"id": "u1"}));
        let result = wrapped(message.clone()).await;

        // The wrapped handler reports success so the offset advances.
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let quarantined = bus.published("user-events.dlq").await;
        assert_eq!(quarantined.len(), 1);
        let record = DlqMessage::from_message(&quarantined[0]).unwrap();
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.original_topic, "user-events");
        assert_eq!(record.original_message, message);
        assert!(record.last_error.contains("boom"));
    }

    #[tokio::test]
    async fn failed_dlq_publish_is_swallowed() {
        let bus = Arc::new(FailingBus::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = with_dlq(
            bus.clone(),
            "user-events",
            always_failing(Arc::clone(&calls)),
            fast_config(2),
        );

        let result = wrapped(Message::new("USER_CREATED", json!({}))).await;

        // The quarantine publish failed, but the wrapper still reports
        // success so the consumer is not taken down with it.
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_on_second_attempt_skips_the_dlq() {
        let bus = Arc::new(InMemoryEventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let handler = handler_fn(move |_message| {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient")
                }
                Ok(())
            }
        });
        let wrapped = with_dlq(bus.clone(), "user-events", handler, fast_config(3));

        let result = wrapped(Message::new("USER_CREATED", json!({}))).await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(bus.published("user-events.dlq").await.is_empty());
    }

    #[tokio::test]
    async fn disabled_wrapper_propagates_failures() {
        let bus = Arc::new(InMemoryEventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = with_dlq(
            bus.clone(),
            "user-events",
            always_failing(Arc::clone(&calls)),
            fast_config(3).with_enabled(false),
        );

        let result = wrapped(Message::new("USER_CREATED", json!({}))).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(bus.published("user-events.dlq").await.is_empty());
    }

    #[tokio::test]
    async fn zero_max_retries_still_attempts_once() {
        let bus = Arc::new(InMemoryEventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = with_dlq(
            bus.clone(),
            "user-events",
            always_failing(Arc::clone(&calls)),
            fast_config(0),
        );

        wrapped(Message::new("USER_CREATED", json!({}))).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published("user-events.dlq").await.len(), 1);
    }

    #[tokio::test]
    async fn reprocessing_succeeds_within_remaining_budget() {
        let bus = Arc::new(InMemoryEventBus::new());
        let processor = DlqProcessor::new(bus.clone(), fast_config(5));

        let record = DlqMessage::new(
            "user-events",
            Message::new("USER_CREATED", json!({"id": "u1"})),
            3,
            "boom",
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let handler = handler_fn(move |_message| {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("still broken")
                }
                Ok(())
            }
        });

        let resolved = processor.process_dlq_message(&record, &handler).await;

        assert!(resolved);
        // Budget was 5 - 3 = 2; success came on the second attempt.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(bus.published("user-events.failed").await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_record_gets_at_least_one_attempt() {
        let bus = Arc::new(InMemoryEventBus::new());
        let processor = DlqProcessor::new(bus.clone(), fast_config(3));

        // retry_count already at the ceiling.
        let record = DlqMessage::new(
            "user-events",
            Message::new("USER_CREATED", json!({})),
            3,
            "boom",
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let resolved = processor
            .process_dlq_message(&record, &always_failing(Arc::clone(&calls)))
            .await;

        assert!(!resolved);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The exhausted record lands on the permanent failure topic.
        let failed = bus.published("user-events.failed").await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message_type, PERMANENT_FAILURE_TYPE);
        let forwarded: DlqMessage = serde_json::from_value(failed[0].data.clone()).unwrap();
        assert_eq!(forwarded.retry_count, 4);
    }

    #[tokio::test]
    async fn run_drains_the_dlq_topic_through_the_handler() {
        let bus = Arc::new(InMemoryEventBus::new());
        let processor = DlqProcessor::new(bus.clone(), fast_config(5));

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let handler = handler_fn(move |_message| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        processor
            .run("dlq-reprocessor", "user-events", handler)
            .await
            .unwrap();

        let record = DlqMessage::new(
            "user-events",
            Message::new("USER_CREATED", json!({"id": "u1"})),
            2,
            "boom",
        );
        bus.send("user-events.dlq", &[record.to_message().unwrap()])
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
