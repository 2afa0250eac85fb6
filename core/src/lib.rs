//! # Eventguard Core
//!
//! Broker-agnostic types and traits for the Eventguard messaging resilience
//! layer: the message envelope, the event bus abstraction, the closed error
//! taxonomy with its rule-based classifier, and the process-scoped error
//! aggregator.
//!
//! Concrete broker and HTTP implementations live in the companion crates
//! (`eventguard-redpanda`, `eventguard-http`); resilience middleware (retry,
//! circuit breaker, dead-letter queue) lives in `eventguard-runtime`.
//!
//! ## Design principles
//!
//! - **Bounded, observable failure**: every failure path ends in a
//!   classified error, a counter, or a durable quarantine record — never a
//!   silent drop.
//! - **Injected, not ambient**: the aggregator and breaker registry are
//!   constructed once at startup and passed by handle; no global mutable
//!   singletons.
//! - **Payload-agnostic bus**: the bus needs only `type`, `data` and
//!   `timestamp`; producers and consumers validate typed payload variants at
//!   the boundary.

#![forbid(unsafe_code)]

/// Process-scoped rolling error counters
pub mod aggregator;

/// Error taxonomy and classification
pub mod error;

/// Event bus trait and handler types
pub mod event_bus;

/// Message envelope and DLQ wrapper types
pub mod message;

pub use aggregator::{AggregatorStats, ErrorAggregator, TopError};
pub use error::{CategorizedError, ErrorCategory, FailureSignals, categorize, track_error};
pub use event_bus::{EventBus, EventBusError, HandlerFuture, MessageHandler, handler_fn};
pub use message::{DlqMessage, EventPayload, Message, MessageError, MessageMetadata};
