//! Error taxonomy and rule-based classification.
//!
//! Raw failures from HTTP calls, broker operations and business handlers are
//! mapped onto a closed [`ErrorCategory`] taxonomy and wrapped in a
//! [`CategorizedError`]. The category alone decides retry and alerting
//! policy: transient categories are retried locally, request errors are
//! surfaced immediately, fatal categories are expected to page an operator.
//!
//! Classification itself can never fail: [`categorize`] always returns a
//! value, with [`ErrorCategory::Unknown`] as the guaranteed fallback.
//!
//! # Example
//!
//! ```
//! use eventguard_core::error::{categorize, ErrorCategory, FailureSignals};
//!
//! let signals = FailureSignals::new("service unavailable").with_status(503);
//! assert_eq!(categorize(&signals), ErrorCategory::ServiceUnavailable);
//! assert!(ErrorCategory::ServiceUnavailable.is_retryable());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::aggregator::ErrorAggregator;

/// Closed taxonomy of failure categories.
///
/// Each category carries fixed, immutable policy attributes: whether the
/// failure is worth retrying, whether it is fatal (operator attention
/// expected rather than automatic recovery), and a user-safe message
/// template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// The request was malformed or failed input validation.
    Validation,
    /// The caller is not authenticated.
    Authentication,
    /// The caller is authenticated but not permitted.
    Authorization,
    /// The requested resource does not exist.
    NotFound,
    /// The request conflicts with existing state.
    Conflict,
    /// The caller exceeded a rate limit.
    RateLimited,
    /// The downstream dependency is unavailable or refusing connections.
    ServiceUnavailable,
    /// The operation exceeded its time budget.
    Timeout,
    /// The downstream failed internally (5xx).
    Internal,
    /// Nothing matched; the guaranteed fallback bucket.
    Unknown,
}

impl ErrorCategory {
    /// Whether failures in this category are worth retrying.
    ///
    /// Only transient categories qualify; retrying a bad request wastes the
    /// retry budget and delays the caller.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServiceUnavailable | Self::Timeout
        )
    }

    /// Whether failures in this category should trigger operator alerting
    /// rather than automatic recovery.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Internal)
    }

    /// Whether this category represents a caller mistake.
    #[must_use]
    pub const fn is_user_error(self) -> bool {
        matches!(
            self,
            Self::Validation
                | Self::Authentication
                | Self::Authorization
                | Self::NotFound
                | Self::Conflict
        )
    }

    /// User-safe message template for this category.
    ///
    /// Never leaks internal detail; original messages and stack traces stay
    /// in internal logs.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::Validation => "The request was invalid. Please check your input.",
            Self::Authentication => "Authentication failed. Please log in again.",
            Self::Authorization => "You do not have permission to perform this action.",
            Self::NotFound => "The requested resource was not found.",
            Self::Conflict => "This action conflicts with existing data.",
            Self::RateLimited => "Too many requests. Please wait a moment and try again.",
            Self::ServiceUnavailable => {
                "Service temporarily unavailable. Please try again later."
            }
            Self::Timeout => "The request took too long. Please try again.",
            Self::Internal => "An internal error occurred. Please contact support.",
            Self::Unknown => "An unexpected error occurred. Please try again.",
        }
    }

    /// Stable wire/log representation of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Authentication => "AUTHENTICATION",
            Self::Authorization => "AUTHORIZATION",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable properties of a raw failure, fed into [`categorize`].
///
/// Callers fill in whatever they can see: an HTTP status code, timeout or
/// connection-refused signals from the transport, the error type name from
/// a validation library, and the error message itself.
#[derive(Debug, Clone, Default)]
pub struct FailureSignals {
    /// HTTP status code, if the failure came from an HTTP response.
    pub status: Option<u16>,
    /// The operation was aborted by a timeout.
    pub timed_out: bool,
    /// The transport could not connect (refused, unreachable, DNS failure).
    pub connection_refused: bool,
    /// The error's type name, if known (e.g. `"ValidationError"`).
    pub error_kind: Option<String>,
    /// The raw error message.
    pub message: String,
}

impl FailureSignals {
    /// Start from a raw error message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Attach an HTTP status code.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Mark the failure as a timeout.
    #[must_use]
    pub const fn timed_out(mut self) -> Self {
        self.timed_out = true;
        self
    }

    /// Mark the failure as a connection failure.
    #[must_use]
    pub const fn connection_refused(mut self) -> Self {
        self.connection_refused = true;
        self
    }

    /// Attach the error's type name.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self
    }
}

/// Map failure signals onto the closed taxonomy. First match wins.
///
/// Rule order: specific HTTP status codes, connection refusal, timeout,
/// remaining 5xx, validation-library signatures, then [`ErrorCategory::Unknown`].
#[must_use]
pub fn categorize(signals: &FailureSignals) -> ErrorCategory {
    if let Some(status) = signals.status {
        match status {
            400 => return ErrorCategory::Validation,
            401 => return ErrorCategory::Authentication,
            403 => return ErrorCategory::Authorization,
            404 => return ErrorCategory::NotFound,
            409 => return ErrorCategory::Conflict,
            429 => return ErrorCategory::RateLimited,
            503 => return ErrorCategory::ServiceUnavailable,
            _ => {}
        }
    }

    if signals.connection_refused {
        return ErrorCategory::ServiceUnavailable;
    }

    if signals.timed_out {
        return ErrorCategory::Timeout;
    }

    if let Some(status) = signals.status {
        if status >= 500 {
            return ErrorCategory::Internal;
        }
    }

    if let Some(kind) = signals.error_kind.as_deref() {
        if matches!(kind, "ValidationError" | "SchemaError" | "ParseError") {
            return ErrorCategory::Validation;
        }
    }

    ErrorCategory::Unknown
}

/// A raw failure wrapped with its classification.
///
/// Created once at classification time and never mutated afterward. Owned
/// by the call site that classified it; it may be logged, aggregated or
/// returned, but is not shared across concurrent operations.
#[derive(Debug, Clone)]
pub struct CategorizedError {
    /// The failure's category in the closed taxonomy.
    pub category: ErrorCategory,
    /// The raw, internal-only error message.
    pub message: String,
    /// HTTP status code, when the failure came from an HTTP response.
    pub status_code: Option<u16>,
    /// Free-form key/value context supplied by the caller.
    pub context: HashMap<String, serde_json::Value>,
    /// Debug rendering of the original error chain, for internal logs only.
    pub detail: Option<String>,
}

impl CategorizedError {
    /// Construct directly from a category and message.
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status_code: None,
            context: HashMap::new(),
            detail: None,
        }
    }

    /// Classify raw failure signals. Never fails.
    #[must_use]
    pub fn classify(signals: FailureSignals) -> Self {
        let category = categorize(&signals);
        Self {
            category,
            message: signals.message,
            status_code: signals.status,
            context: HashMap::new(),
            detail: None,
        }
    }

    /// Attach a context key/value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Attach the debug rendering of the original error.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Whether this failure is worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    /// Whether this failure should trigger operator alerting.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.category.is_fatal()
    }

    /// Whether this failure represents a caller mistake.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        self.category.is_user_error()
    }

    /// The user-safe message for this failure.
    ///
    /// Internal detail is never exposed here; the only exception is
    /// validation, where the raw message is the actionable feedback.
    #[must_use]
    pub fn user_message(&self) -> &str {
        if self.category == ErrorCategory::Validation && !self.message.is_empty() {
            &self.message
        } else {
            self.category.user_message()
        }
    }

    /// Aggregation signature: category plus a bounded message prefix.
    #[must_use]
    pub fn signature(&self) -> String {
        let prefix: String = self.message.chars().take(80).collect();
        format!("{}:{}", self.category, prefix)
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

impl std::error::Error for CategorizedError {}

/// Classify a failure, attach caller context, log it by severity and record
/// it in the aggregator.
///
/// The one-stop entry point call sites use when they want observability as a
/// side effect of classification.
pub fn track_error(
    aggregator: &ErrorAggregator,
    signals: FailureSignals,
    context: HashMap<String, serde_json::Value>,
) -> CategorizedError {
    let mut error = CategorizedError::classify(signals);
    error.context.extend(context);

    if error.is_fatal() {
        tracing::error!(
            category = %error.category,
            message = %error.message,
            detail = error.detail.as_deref().unwrap_or(""),
            context = ?error.context,
            "Fatal error occurred"
        );
    } else if error.is_retryable() {
        tracing::warn!(
            category = %error.category,
            message = %error.message,
            context = ?error.context,
            "Retryable error occurred"
        );
    } else if error.is_user_error() {
        tracing::info!(
            category = %error.category,
            message = %error.message,
            context = ?error.context,
            "User error occurred"
        );
    } else {
        tracing::error!(
            category = %error.category,
            message = %error.message,
            context = ?error.context,
            "Error occurred"
        );
    }

    aggregator.record(&error);
    error
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_503_is_retryable_service_unavailable() {
        let error = CategorizedError::classify(FailureSignals::new("boom").with_status(503));
        assert_eq!(error.category, ErrorCategory::ServiceUnavailable);
        assert!(error.is_retryable());
    }

    #[test]
    fn status_404_is_non_retryable_not_found() {
        let error = CategorizedError::classify(FailureSignals::new("gone").with_status(404));
        assert_eq!(error.category, ErrorCategory::NotFound);
        assert!(!error.is_retryable());
    }

    #[test]
    fn status_code_mapping_table() {
        let cases = [
            (400, ErrorCategory::Validation),
            (401, ErrorCategory::Authentication),
            (403, ErrorCategory::Authorization),
            (404, ErrorCategory::NotFound),
            (409, ErrorCategory::Conflict),
            (429, ErrorCategory::RateLimited),
            (503, ErrorCategory::ServiceUnavailable),
            (500, ErrorCategory::Internal),
            (502, ErrorCategory::Internal),
        ];
        for (status, expected) in cases {
            let signals = FailureSignals::new("x").with_status(status);
            assert_eq!(categorize(&signals), expected, "status {status}");
        }
    }

    #[test]
    fn connection_refused_beats_generic_5xx() {
        let signals = FailureSignals::new("refused")
            .with_status(500)
            .connection_refused();
        // 500 is not a specific match, so the connection signal decides.
        assert_eq!(categorize(&signals), ErrorCategory::ServiceUnavailable);
    }

    #[test]
    fn timeout_signal_maps_to_timeout() {
        let signals = FailureSignals::new("deadline elapsed").timed_out();
        assert_eq!(categorize(&signals), ErrorCategory::Timeout);
    }

    #[test]
    fn validation_library_signature_maps_to_validation() {
        let signals = FailureSignals::new("email is required").with_kind("ValidationError");
        assert_eq!(categorize(&signals), ErrorCategory::Validation);
    }

    #[test]
    fn unmatched_failure_falls_back_to_unknown() {
        let signals = FailureSignals::new("something odd");
        assert_eq!(categorize(&signals), ErrorCategory::Unknown);
    }

    #[test]
    fn user_message_does_not_leak_internal_detail() {
        let error = CategorizedError::classify(
            FailureSignals::new("connection pool exhausted at 10.0.0.3:5432").with_status(503),
        );
        assert!(!error.user_message().contains("10.0.0.3"));
    }

    #[test]
    fn validation_user_message_keeps_the_raw_message() {
        let error = CategorizedError::classify(
            FailureSignals::new("email is required").with_kind("ValidationError"),
        );
        assert_eq!(error.user_message(), "email is required");
    }

    #[test]
    fn signature_is_bounded() {
        let long = "x".repeat(500);
        let error = CategorizedError::new(ErrorCategory::Internal, long);
        assert!(error.signature().len() <= "INTERNAL:".len() + 80);
    }

    proptest::proptest! {
        // Classification is total and internally consistent: every input
        // lands in the taxonomy and no category is both retryable and a
        // caller mistake.
        #[test]
        fn categorize_is_total_and_consistent(
            status in proptest::option::of(0u16..1000),
            timed_out: bool,
            connection_refused: bool,
            message in ".{0,120}",
        ) {
            let mut signals = FailureSignals::new(message);
            signals.status = status;
            signals.timed_out = timed_out;
            signals.connection_refused = connection_refused;

            let category = categorize(&signals);
            proptest::prop_assert!(!(category.is_retryable() && category.is_user_error()));
            proptest::prop_assert!(!category.user_message().is_empty());
        }
    }

    #[test]
    fn track_error_records_into_aggregator() {
        let aggregator = ErrorAggregator::new();
        let mut context = HashMap::new();
        context.insert("operation".to_string(), json!("create_user"));

        let error = track_error(
            &aggregator,
            FailureSignals::new("down").with_status(503),
            context,
        );

        assert_eq!(error.category, ErrorCategory::ServiceUnavailable);
        assert_eq!(error.context["operation"], json!("create_user"));
        assert_eq!(aggregator.stats().total_errors, 1);
    }
}
