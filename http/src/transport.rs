//! HTTP transport seam for the service client.
//!
//! The [`HttpTransport`] trait isolates the wire from the resilience logic:
//! production uses [`ReqwestTransport`], tests substitute a scripted mock
//! and run without a network.

use eventguard_core::FailureSignals;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub use reqwest::Method;

/// Errors raised by the transport before an HTTP status is available.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The request exceeded its time budget and was aborted.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The transport could not connect (refused, unreachable, DNS failure).
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Any other request failure (bad body, protocol error).
    #[error("Request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Map the transport failure onto classification signals.
    #[must_use]
    pub fn signals(&self) -> FailureSignals {
        match self {
            Self::Timeout(message) => FailureSignals::new(message.clone()).timed_out(),
            Self::Connect(message) => FailureSignals::new(message.clone()).connection_refused(),
            Self::Request(message) => FailureSignals::new(message.clone()),
        }
    }
}

/// One outbound request as seen by the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,
    /// Fully resolved URL.
    pub url: String,
    /// Optional JSON request body.
    pub body: Option<serde_json::Value>,
    /// Per-request time budget.
    pub timeout: Duration,
}

/// The raw response handed back to the resilience layer.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body parsed as JSON (`null` when the body is empty or not
    /// JSON).
    pub body: serde_json::Value,
}

/// Pluggable HTTP transport.
pub trait HttpTransport: Send + Sync {
    /// Execute one request.
    fn execute(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + '_>>;
}

/// Production transport over a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport over a fresh connection pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method, &request.url)
                .timeout(request.timeout);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(classify_reqwest)?;
            let status = response.status().as_u16();
            // Non-JSON and empty bodies degrade to null rather than failing
            // the call; the status decides the outcome.
            let body = response
                .json::<serde_json::Value>()
                .await
                .unwrap_or(serde_json::Value::Null);

            Ok(TransportResponse { status, body })
        })
    }
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventguard_core::{ErrorCategory, categorize};

    #[test]
    fn timeout_signals_classify_as_timeout() {
        let err = TransportError::Timeout("deadline elapsed".to_string());
        assert_eq!(categorize(&err.signals()), ErrorCategory::Timeout);
    }

    #[test]
    fn connect_signals_classify_as_service_unavailable() {
        let err = TransportError::Connect("connection refused".to_string());
        assert_eq!(categorize(&err.signals()), ErrorCategory::ServiceUnavailable);
    }

    #[test]
    fn plain_request_errors_classify_as_unknown() {
        let err = TransportError::Request("malformed chunk".to_string());
        assert_eq!(categorize(&err.signals()), ErrorCategory::Unknown);
    }
}
