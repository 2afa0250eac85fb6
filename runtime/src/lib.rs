//! # Eventguard Runtime
//!
//! Resilience middleware for the Eventguard messaging layer.
//!
//! ## Core components
//!
//! - **Circuit breaker**: per-dependency Closed/Open/HalfOpen state machine
//!   guarding outbound calls, plus an injected registry
//! - **Retry**: exponential backoff driven by the error taxonomy's
//!   retryability flags
//! - **DLQ**: consumer-handler middleware that converts an unbounded
//!   redelivery loop on a poison message into bounded attempts plus durable
//!   quarantine, and the reprocessor that drains quarantine topics
//!
//! The only concurrently-mutated shared state here is the breaker registry's
//! per-dependency state (and the core crate's error aggregator); both are
//! synchronized internally and never hold a lock across an I/O wait.

#![forbid(unsafe_code)]

/// Circuit breaker for guarding downstream dependencies
pub mod circuit_breaker;

/// Dead-letter queue middleware and reprocessing
pub mod dlq;

/// Retry with exponential backoff
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerStats, State,
};
pub use dlq::{DlqConfig, DlqProcessor, with_dlq};
pub use retry::{RetryPolicy, retry_categorized, retry_with_backoff};
