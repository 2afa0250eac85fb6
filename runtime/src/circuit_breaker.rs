//! Circuit breaker for guarding calls to downstream dependencies.
//!
//! A breaker exists per named dependency and monitors call outcomes. When
//! consecutive failures reach a threshold the circuit opens and calls fail
//! immediately without a network attempt, bounding failed-call volume and
//! giving the downstream time to recover without a retry storm.
//!
//! # States
//!
//! - **Closed** (initial): calls pass through; consecutive failures are
//!   counted and reset on success.
//! - **Open**: calls are rejected with a [`ServiceUnavailable`] classified
//!   error until the cool-down elapses.
//! - **HalfOpen**: exactly one trial call is allowed through at a time.
//!   Success closes the circuit; failure reopens it and restarts the
//!   cool-down.
//!
//! # Example
//!
//! ```rust
//! use eventguard_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::default()
//!     .with_failure_threshold(5)
//!     .with_cooldown(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new("auth-service", config);
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(value) => println!("Success: {value}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```
//!
//! [`ServiceUnavailable`]: eventguard_core::ErrorCategory::ServiceUnavailable

use chrono::{DateTime, Utc};
use eventguard_core::{CategorizedError, ErrorCategory};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// How long the circuit stays open before allowing a trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the consecutive-failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open-state cool-down.
    #[must_use]
    pub const fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Read configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `EVENTGUARD_CB_FAILURE_THRESHOLD`,
    /// `EVENTGUARD_CB_COOLDOWN_MS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(threshold) = read_env("EVENTGUARD_CB_FAILURE_THRESHOLD") {
            config.failure_threshold = threshold;
        }
        if let Some(ms) = read_env("EVENTGUARD_CB_COOLDOWN_MS") {
            config.cooldown = Duration::from_millis(ms);
        }
        config
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, calls pass through normally.
    Closed,
    /// Circuit is open, calls are rejected immediately.
    Open,
    /// Circuit is half-open, one trial call is probing recovery.
    HalfOpen,
}

impl State {
    /// Stable log/monitoring representation of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Errors from calls wrapped in a circuit breaker.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the call was rejected without a network attempt.
    #[error("Circuit breaker is open for '{name}'")]
    Open {
        /// The guarded dependency.
        name: String,
    },
    /// The wrapped operation itself failed.
    #[error("Operation failed: {0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Convert a rejection into its classified form.
    ///
    /// Returns `None` for [`CircuitBreakerError::Inner`]; the inner error
    /// carries its own classification.
    #[must_use]
    pub fn as_rejection(&self) -> Option<CategorizedError> {
        match self {
            Self::Open { name } => Some(CategorizedError::new(
                ErrorCategory::ServiceUnavailable,
                format!("circuit breaker open for '{name}'"),
            )),
            Self::Inner(_) => None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
}

/// Marks a half-open probe as in flight for its lifetime.
///
/// Clearing the flag on drop keeps `call` cancellation-safe: an abandoned
/// probe future (e.g. under `tokio::time::timeout`) releases the slot
/// instead of wedging the breaker into rejecting every call.
struct ProbeGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Outcome of admitting a call through the breaker.
enum Admission {
    /// Closed-state call; no slot to hold.
    Pass,
    /// Half-open trial holding the single probe slot.
    Probe(ProbeGuard),
}

/// Monitoring snapshot of a breaker, intended for periodic scrape/log.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// The guarded dependency's name.
    pub name: String,
    /// Current state.
    pub state: State,
    /// Consecutive failures observed in the current streak.
    pub consecutive_failures: usize,
    /// When the dependency last failed.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// When the dependency last succeeded.
    pub last_success_time: Option<DateTime<Utc>>,
    /// Total calls attempted through this breaker.
    pub total_calls: u64,
    /// Total calls rejected while open.
    pub total_rejections: u64,
}

/// Per-dependency circuit breaker.
///
/// Created lazily on first use of a named dependency (see
/// [`CircuitBreakerRegistry`]) and lives for the process lifetime. State is
/// mutated only by the breaker's own call-wrapping logic; the internal lock
/// protects the state transition, never the guarded network call.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<RwLock<BreakerState>>,
    probe_in_flight: Arc<AtomicBool>,
    total_calls: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a breaker for a named dependency.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            state: Arc::new(RwLock::new(BreakerState {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_time: None,
                last_success_time: None,
            })),
            probe_in_flight: Arc::new(AtomicBool::new(false)),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The guarded dependency's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state.
    pub async fn state(&self) -> State {
        self.state.read().await.state
    }

    /// Call an operation through the circuit breaker.
    ///
    /// The state lock is dropped before the operation runs; only the
    /// transition is synchronized.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Open`] if the circuit rejects the call,
    /// or [`CircuitBreakerError::Inner`] if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.try_acquire().await else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                dependency = %self.name,
                "Circuit breaker is OPEN, rejecting call"
            );
            return Err(CircuitBreakerError::Open {
                name: self.name.to_string(),
            });
        };
        // Held across the operation so a dropped probe releases its slot.
        let _probe_guard = match admission {
            Admission::Pass => None,
            Admission::Probe(guard) => Some(guard),
        };

        match operation().await {
            Ok(result) => {
                self.on_success().await;
                Ok(result)
            }
            Err(err) => {
                self.on_failure().await;
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Decide whether a call may proceed, transitioning Open to HalfOpen
    /// when the cool-down has elapsed. In HalfOpen, at most one probe is
    /// in flight at a time.
    ///
    /// Returns `None` for a rejected call. An admitted probe holds the
    /// in-flight slot until its [`ProbeGuard`] drops.
    async fn try_acquire(&self) -> Option<Admission> {
        let mut state = self.state.write().await;
        match state.state {
            State::Closed => Some(Admission::Pass),
            State::HalfOpen => {
                if self.probe_in_flight.swap(true, Ordering::SeqCst) {
                    None
                } else {
                    Some(Admission::Probe(ProbeGuard {
                        flag: Arc::clone(&self.probe_in_flight),
                    }))
                }
            }
            State::Open => {
                let cooled_down = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if cooled_down {
                    tracing::info!(
                        dependency = %self.name,
                        "Circuit breaker transitioning OPEN -> HALF_OPEN"
                    );
                    state.state = State::HalfOpen;
                    self.probe_in_flight.store(true, Ordering::SeqCst);
                    Some(Admission::Probe(ProbeGuard {
                        flag: Arc::clone(&self.probe_in_flight),
                    }))
                } else {
                    None
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;
        state.last_success_time = Some(Utc::now());
        match state.state {
            State::Closed => {
                state.consecutive_failures = 0;
            }
            State::HalfOpen => {
                tracing::info!(
                    dependency = %self.name,
                    "Circuit breaker transitioning HALF_OPEN -> CLOSED"
                );
                metrics::counter!("circuit_breaker.closed", "dependency" => self.name.to_string())
                    .increment(1);
                state.state = State::Closed;
                state.consecutive_failures = 0;
                state.opened_at = None;
            }
            State::Open => {
                // A call admitted just before the circuit opened; the streak
                // ends but the circuit stays open until cool-down.
                state.consecutive_failures = 0;
            }
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        state.last_failure_time = Some(Utc::now());
        match state.state {
            State::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        dependency = %self.name,
                        failures = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    metrics::counter!("circuit_breaker.opened", "dependency" => self.name.to_string())
                        .increment(1);
                    state.state = State::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                tracing::warn!(
                    dependency = %self.name,
                    "Circuit breaker transitioning HALF_OPEN -> OPEN (trial failed)"
                );
                metrics::counter!("circuit_breaker.opened", "dependency" => self.name.to_string())
                    .increment(1);
                state.state = State::Open;
                state.consecutive_failures += 1;
                state.opened_at = Some(Instant::now());
            }
            State::Open => {
                state.consecutive_failures += 1;
            }
        }
    }

    /// Snapshot the breaker for monitoring.
    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;
        CircuitBreakerStats {
            name: self.name.to_string(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Manually reset the breaker to closed. Intended for tests and
    /// operator intervention.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        tracing::info!(dependency = %self.name, "Circuit breaker manually reset to CLOSED");
        state.state = State::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }
}

/// Registry of per-dependency circuit breakers.
///
/// Constructed once at startup and passed by handle to every call site;
/// breakers are created lazily on first use of a dependency name, all with
/// the registry's default configuration.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given default configuration.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get (or lazily create) the breaker for a dependency name.
    pub async fn breaker(&self, name: &str) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.default_config.clone()))
            .clone()
    }

    /// Snapshot every registered breaker for monitoring.
    pub async fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self.breakers.read().await;
        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
