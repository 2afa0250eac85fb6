//! Resilient HTTP clients for service-to-service calls.
//!
//! This crate layers the eventguard resilience stack over outbound HTTP:
//! every request through a [`ServiceClient`] is guarded by a named circuit
//! breaker, classified on failure, recorded in the error aggregator,
//! retried while the failure is transient, and finally answered by a
//! configured fallback when the downstream stays unhealthy.
//!
//! The actual wire I/O sits behind the [`HttpTransport`] trait so the
//! resilience behavior is testable without a network.

#![forbid(unsafe_code)]

pub mod client;
pub mod registry;
pub mod transport;

pub use client::{ServiceClient, ServiceClientConfig, ServiceResponse};
pub use registry::{RegistryError, ServiceRegistry};
pub use transport::{
    HttpTransport, Method, ReqwestTransport, TransportError, TransportRequest, TransportResponse,
};
