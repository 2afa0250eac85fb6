//! Resilient client for sibling-service HTTP calls.
//!
//! [`ServiceClient`] wraps one named downstream service with the full
//! outbound resilience stack: the per-dependency circuit breaker is
//! consulted before every attempt, failures are classified and recorded in
//! the error aggregator, retryable failures are retried with exponential
//! backoff, and a configured static fallback answers when the downstream is
//! known-bad. Every attempt — success or failure — updates breaker stats
//! and error aggregation; that is how operators see a dependency degrading
//! before its circuit fully opens.

use eventguard_core::{CategorizedError, ErrorAggregator, ErrorCategory, FailureSignals};
use eventguard_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::transport::{
    HttpTransport, Method, ReqwestTransport, TransportRequest, TransportResponse,
};

/// Cap for the retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The `{success, data, message}` envelope convention used by sibling
/// services. Bodies are otherwise opaque to this layer; the envelope only
/// matters on the fallback and error paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    /// Whether the downstream reported success.
    pub success: bool,
    /// The payload, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Human-readable message, typically set on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Per-target configuration for a [`ServiceClient`].
#[derive(Debug, Clone)]
pub struct ServiceClientConfig {
    /// Base URL of the downstream service.
    pub base_url: String,
    /// Retries after the initial attempt, spent only on retryable failures.
    pub max_retries: u32,
    /// Initial backoff; doubles each retry, capped at 30s.
    pub retry_backoff: Duration,
    /// Per-request time budget.
    pub timeout: Duration,
    /// Static response returned when the circuit is open or retries are
    /// exhausted.
    pub fallback: Option<Value>,
}

impl ServiceClientConfig {
    /// Create a configuration with the default retry/timeout policy.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            timeout: Duration::from_secs(5),
            fallback: None,
        }
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial retry backoff.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the static fallback response.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Build a configuration from the environment for a named service.
    ///
    /// Reads `{NAME}_SERVICE_URL` (dashes mapped to underscores, uppercased;
    /// e.g. `auth` → `AUTH_SERVICE_URL`). Returns `None` when the variable
    /// is unset.
    #[must_use]
    pub fn from_env(service_name: &str) -> Option<Self> {
        let var = format!(
            "{}_SERVICE_URL",
            service_name.replace('-', "_").to_uppercase()
        );
        std::env::var(var).ok().map(Self::new)
    }
}

/// HTTP client for one named downstream service.
///
/// Cheap to clone; clones share the breaker, aggregator and connection
/// pool.
#[derive(Clone)]
pub struct ServiceClient {
    name: Arc<str>,
    config: Arc<ServiceClientConfig>,
    transport: Arc<dyn HttpTransport>,
    breaker: CircuitBreaker,
    aggregator: Arc<ErrorAggregator>,
}

impl ServiceClient {
    /// Create a client over the production transport.
    ///
    /// The breaker should come from the process-wide
    /// [`CircuitBreakerRegistry`](eventguard_runtime::CircuitBreakerRegistry)
    /// so every caller of the same dependency shares its state.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        config: ServiceClientConfig,
        breaker: CircuitBreaker,
        aggregator: Arc<ErrorAggregator>,
    ) -> Self {
        Self::with_transport(name, config, breaker, aggregator, Arc::new(ReqwestTransport::new()))
    }

    /// Create a client over a custom transport. Used by tests.
    #[must_use]
    pub fn with_transport(
        name: impl Into<String>,
        config: ServiceClientConfig,
        breaker: CircuitBreaker,
        aggregator: Arc<ErrorAggregator>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            transport,
            breaker,
            aggregator,
        }
    }

    /// The downstream service's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot the guarding breaker for monitoring.
    pub async fn stats(&self) -> CircuitBreakerStats {
        self.breaker.stats().await
    }

    /// Issue a request with the full resilience stack.
    ///
    /// # Errors
    ///
    /// Returns the final [`CategorizedError`] when the call fails without a
    /// configured fallback: immediately for non-retryable categories and
    /// breaker rejections, after the retry budget for retryable ones.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, CategorizedError> {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let mut attempt = 0;
        loop {
            tracing::debug!(
                service = %self.name,
                method = %method,
                url = %url,
                attempt,
                "Outbound request"
            );

            let outcome = self
                .breaker
                .call(|| self.attempt_once(method.clone(), &url, body.as_ref()))
                .await;

            let error = match outcome {
                Ok(value) => {
                    tracing::debug!(service = %self.name, url = %url, "Outbound request succeeded");
                    return Ok(value);
                }
                Err(CircuitBreakerError::Open { ref name }) => {
                    // No network attempt happened; fail or fall back now.
                    let rejection = CategorizedError::new(
                        ErrorCategory::ServiceUnavailable,
                        format!("circuit breaker open for '{name}'"),
                    )
                    .with_context("service", Value::String(self.name.to_string()));
                    self.aggregator.record(&rejection);
                    return self.fallback_or(rejection);
                }
                Err(CircuitBreakerError::Inner(error)) => error,
            };

            self.aggregator.record(&error);

            if error.is_retryable() && attempt < self.config.max_retries {
                let delay = backoff_delay(self.config.retry_backoff, attempt);
                tracing::warn!(
                    service = %self.name,
                    url = %url,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    category = %error.category,
                    error = %error,
                    "Retrying outbound request"
                );
                sleep(delay).await;
                attempt += 1;
                continue;
            }

            return self.fallback_or(error);
        }
    }

    /// `GET path`.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn get(&self, path: &str) -> Result<Value, CategorizedError> {
        self.call(Method::GET, path, None).await
    }

    /// `POST path` with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn post(&self, path: &str, body: Value) -> Result<Value, CategorizedError> {
        self.call(Method::POST, path, Some(body)).await
    }

    /// `PUT path` with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn put(&self, path: &str, body: Value) -> Result<Value, CategorizedError> {
        self.call(Method::PUT, path, Some(body)).await
    }

    /// `DELETE path`.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn delete(&self, path: &str) -> Result<Value, CategorizedError> {
        self.call(Method::DELETE, path, None).await
    }

    /// One transport attempt, with the outcome classified.
    async fn attempt_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, CategorizedError> {
        let request = TransportRequest {
            method,
            url: url.to_string(),
            body: body.cloned(),
            timeout: self.config.timeout,
        };

        match self.transport.execute(request).await {
            Ok(TransportResponse { status, body }) if status < 400 => Ok(body),
            Ok(TransportResponse { status, body }) => {
                let message = serde_json::from_value::<ServiceResponse>(body)
                    .ok()
                    .and_then(|envelope| envelope.message)
                    .unwrap_or_else(|| format!("{} returned status {status}", self.name));
                Err(CategorizedError::classify(
                    FailureSignals::new(message).with_status(status),
                )
                .with_context("service", Value::String(self.name.to_string()))
                .with_context("url", Value::String(url.to_string())))
            }
            Err(transport_error) => Err(CategorizedError::classify(transport_error.signals())
                .with_detail(format!("{transport_error:?}"))
                .with_context("service", Value::String(self.name.to_string()))
                .with_context("url", Value::String(url.to_string()))),
        }
    }

    fn fallback_or(&self, error: CategorizedError) -> Result<Value, CategorizedError> {
        if let Some(fallback) = &self.config.fallback {
            tracing::warn!(
                service = %self.name,
                category = %error.category,
                error = %error,
                "Fallback response triggered"
            );
            Ok(fallback.clone())
        } else {
            Err(error)
        }
    }
}

fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    initial
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}
