//! Process-scoped rolling error counters for monitoring.
//!
//! The [`ErrorAggregator`] counts classified errors by category and by
//! signature (category plus bounded message prefix), keeping a fixed top-N
//! of the most frequent signatures. It is constructed once at startup and
//! handed by reference to every call site; tests construct a fresh instance
//! per case instead of resetting shared global state.
//!
//! All mutations go through a single internal mutex. The lock protects only
//! the counter update and is never held across I/O.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{CategorizedError, ErrorCategory};

/// Default bound for the most-frequent-signature list.
const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Default)]
struct AggregatorInner {
    total_errors: u64,
    by_category: HashMap<ErrorCategory, u64>,
    by_signature: HashMap<String, SignatureEntry>,
}

#[derive(Debug, Clone)]
struct SignatureEntry {
    count: u64,
    category: ErrorCategory,
    last_occurrence: DateTime<Utc>,
}

/// One entry of the top-errors list in [`AggregatorStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopError {
    /// The error signature (category plus bounded message prefix).
    pub signature: String,
    /// The signature's category.
    pub category: ErrorCategory,
    /// How many times this signature was recorded since the last reset.
    pub count: u64,
    /// When this signature was last recorded.
    pub last_occurrence: DateTime<Utc>,
}

/// Snapshot of the aggregator's counters.
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    /// Total errors recorded since the last reset.
    pub total_errors: u64,
    /// Error counts per category.
    pub by_category: HashMap<ErrorCategory, u64>,
    /// The most frequent signatures, descending by count, bounded.
    pub top_errors: Vec<TopError>,
}

/// Rolling counters of categorized errors, safe for concurrent recording
/// from many handlers and call sites.
#[derive(Debug)]
pub struct ErrorAggregator {
    inner: Mutex<AggregatorInner>,
    top_n: usize,
}

impl Default for ErrorAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorAggregator {
    /// Create an aggregator with the default top-10 signature bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_top_n(DEFAULT_TOP_N)
    }

    /// Create an aggregator with a custom signature bound.
    #[must_use]
    pub fn with_top_n(top_n: usize) -> Self {
        Self {
            inner: Mutex::new(AggregatorInner::default()),
            top_n,
        }
    }

    /// Record one categorized error.
    ///
    /// Counts saturate rather than wrap.
    pub fn record(&self, error: &CategorizedError) {
        let signature = error.signature();
        let now = Utc::now();

        let mut inner = self.lock();
        inner.total_errors = inner.total_errors.saturating_add(1);
        let category_count = inner.by_category.entry(error.category).or_insert(0);
        *category_count = category_count.saturating_add(1);

        let entry = inner
            .by_signature
            .entry(signature)
            .or_insert(SignatureEntry {
                count: 0,
                category: error.category,
                last_occurrence: now,
            });
        entry.count = entry.count.saturating_add(1);
        entry.last_occurrence = now;
    }

    /// Snapshot the current counters.
    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        let inner = self.lock();
        let mut top: Vec<TopError> = inner
            .by_signature
            .iter()
            .map(|(signature, entry)| TopError {
                signature: signature.clone(),
                category: entry.category,
                count: entry.count,
                last_occurrence: entry.last_occurrence,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then(a.signature.cmp(&b.signature)));
        top.truncate(self.top_n);

        AggregatorStats {
            total_errors: inner.total_errors,
            by_category: inner.by_category.clone(),
            top_errors: top,
        }
    }

    /// Zero all counters. Intended for scheduled resets.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = AggregatorInner::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorInner> {
        // A poisoned lock only means a panic elsewhere mid-update; stale
        // counters are still usable for monitoring.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::{CategorizedError, ErrorCategory, FailureSignals};
    use std::sync::Arc;

    fn classified(status: u16, message: &str) -> CategorizedError {
        CategorizedError::classify(FailureSignals::new(message).with_status(status))
    }

    #[test]
    fn record_counts_by_category_and_signature() {
        let aggregator = ErrorAggregator::new();
        aggregator.record(&classified(503, "down"));
        aggregator.record(&classified(503, "down"));
        aggregator.record(&classified(404, "missing"));

        let stats = aggregator.stats();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.by_category[&ErrorCategory::ServiceUnavailable], 2);
        assert_eq!(stats.by_category[&ErrorCategory::NotFound], 1);
        assert_eq!(stats.top_errors[0].count, 2);
        assert_eq!(stats.top_errors[0].category, ErrorCategory::ServiceUnavailable);
    }

    #[test]
    fn top_errors_is_bounded() {
        let aggregator = ErrorAggregator::with_top_n(3);
        for i in 0..10 {
            aggregator.record(&classified(500, &format!("failure mode {i}")));
        }

        let stats = aggregator.stats();
        assert_eq!(stats.total_errors, 10);
        assert_eq!(stats.top_errors.len(), 3);
    }

    #[test]
    fn top_errors_sorted_descending_by_count() {
        let aggregator = ErrorAggregator::new();
        aggregator.record(&classified(404, "rare"));
        for _ in 0..5 {
            aggregator.record(&classified(503, "frequent"));
        }

        let stats = aggregator.stats();
        assert!(stats.top_errors[0].signature.contains("frequent"));
        assert_eq!(stats.top_errors[0].count, 5);
        assert_eq!(stats.top_errors[1].count, 1);
    }

    #[test]
    fn reset_zeroes_everything_and_counting_restarts() {
        let aggregator = ErrorAggregator::new();
        aggregator.record(&classified(503, "down"));
        aggregator.reset();

        let stats = aggregator.stats();
        assert_eq!(stats.total_errors, 0);
        assert!(stats.by_category.is_empty());
        assert!(stats.top_errors.is_empty());

        aggregator.record(&classified(404, "missing"));
        assert_eq!(aggregator.stats().total_errors, 1);
    }

    #[tokio::test]
    async fn concurrent_recording_loses_nothing() {
        let aggregator = Arc::new(ErrorAggregator::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let aggregator = Arc::clone(&aggregator);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    aggregator.record(&classified(503, "down"));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(aggregator.stats().total_errors, 800);
    }
}
