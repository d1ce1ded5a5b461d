//! Adaptive circuit breaker
//!
//! The circuit breaker stops calling a failing dependency until it appears to have
//! recovered. It has three states:
//! - Closed: Normal operation, calls pass through
//! - Open: Dependency is unhealthy, calls are rejected without running
//! - HalfOpen: Trial calls are let through to test recovery
//!
//! On top of the classic state machine the failure threshold adapts to recent
//! reliability: once the rolling history holds a full window of outcomes, a success
//! rate above the high-water mark raises the threshold by one step and a rate below
//! the low-water mark lowers it, always within the configured band.

use super::error::CallError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls are rejected immediately
    Open,
    /// Circuit is half-open, trial calls test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures (net of decay) before the circuit opens; adapted at runtime
    pub failure_threshold: usize,
    /// Successes while half-open needed to close the circuit
    pub success_threshold: usize,
    /// Time since the last failure before an open circuit admits a trial call
    pub recovery_timeout: Duration,
    /// Whether the failure threshold adapts to recent reliability
    pub adaptive: bool,
    /// Lower bound for the adaptive threshold
    pub threshold_min: usize,
    /// Upper bound for the adaptive threshold
    pub threshold_max: usize,
    /// Number of most recent outcomes the success rate is computed over
    pub adaptation_window: usize,
    /// Success rate above which the threshold is raised
    pub high_water_mark: f64,
    /// Success rate below which the threshold is lowered
    pub low_water_mark: f64,
    /// Amount the threshold moves per adjustment
    pub threshold_step: usize,
    /// Capacity of the rolling outcome history
    pub history_capacity: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            adaptive: true,
            threshold_min: 3,
            threshold_max: 15,
            adaptation_window: 20,
            high_water_mark: 0.95,
            low_water_mark: 0.80,
            threshold_step: 1,
            history_capacity: 100,
        }
    }
}

impl CircuitBreakerConfig {
    /// Widen the adaptive band so it always contains the starting threshold
    fn normalized(mut self) -> Self {
        self.failure_threshold = self.failure_threshold.max(1);
        self.success_threshold = self.success_threshold.max(1);
        self.threshold_min = self.threshold_min.clamp(1, self.failure_threshold);
        self.threshold_max = self.threshold_max.max(self.failure_threshold);
        self.history_capacity = self.history_capacity.max(1);
        self
    }
}

/// One recorded call outcome
#[derive(Debug, Clone, Copy)]
pub struct OutcomeRecord {
    pub success: bool,
    pub latency: Duration,
    pub at: Instant,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    failure_threshold: usize,
    last_failure: Option<Instant>,
    history: VecDeque<OutcomeRecord>,
    times_opened: u64,
    rejected_calls: u64,
}

impl CircuitBreakerState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            failure_threshold: config.failure_threshold,
            last_failure: None,
            history: VecDeque::with_capacity(config.history_capacity),
            times_opened: 0,
            rejected_calls: 0,
        }
    }

    fn push_outcome(&mut self, capacity: usize, record: OutcomeRecord) {
        if self.history.len() == capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    fn success_rate(&self, window: usize) -> Option<f64> {
        let len = self.history.len().min(window);
        if len == 0 {
            return None;
        }
        let successes = self
            .history
            .iter()
            .rev()
            .take(len)
            .filter(|o| o.success)
            .count();
        Some(successes as f64 / len as f64)
    }
}

/// Snapshot of a breaker for reporting
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub failure_threshold: usize,
    /// Success rate over the most recent adaptation window (0.0 with no history)
    pub recent_success_rate: f64,
    /// Outcomes currently held in the rolling history
    pub total_operations: usize,
    pub average_latency_ms: f64,
    pub times_opened: u64,
    pub rejected_calls: u64,
    pub secs_since_last_failure: Option<f64>,
}

/// Adaptive circuit breaker for protecting a downstream dependency
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{CallError, CircuitBreaker, CircuitBreakerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new("inference", CircuitBreakerConfig::default());
///
///     let result: Result<u32, CallError<std::io::Error>> = breaker
///         .execute(|| async { Ok(42) })
///         .await;
///
///     match result {
///         Ok(v) => println!("got {}", v),
///         Err(CallError::Open { name }) => println!("{} is cooling down", name),
///         Err(CallError::Downstream(e)) => println!("downstream failed: {}", e),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let config = config.normalized();
        let state = CircuitBreakerState::new(&config);
        let name: String = name.into();
        debug!(breaker = %name, threshold = config.failure_threshold, "circuit breaker created");
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Current (possibly adapted) failure threshold
    pub async fn failure_threshold(&self) -> usize {
        self.state.lock().await.failure_threshold
    }

    /// Get current failure count
    pub async fn failure_count(&self) -> usize {
        self.state.lock().await.failure_count
    }

    /// Get current half-open success count
    pub async fn success_count(&self) -> usize {
        self.state.lock().await.success_count
    }

    /// Copy of the rolling outcome history, oldest first
    pub async fn history(&self) -> Vec<OutcomeRecord> {
        self.state.lock().await.history.iter().copied().collect()
    }

    /// Reset the circuit breaker to closed state
    ///
    /// The adapted threshold and the outcome history are kept.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Run `op` under breaker protection.
    ///
    /// Returns `CallError::Open` without running `op` when the circuit is open and the
    /// recovery timeout has not elapsed. Otherwise the operation's own error is recorded
    /// and handed back untouched as `CallError::Downstream`. The breaker lock is never
    /// held while `op` runs.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit::<E>().await?;

        let started = Instant::now();
        match op().await {
            Ok(value) => {
                self.record_success(started.elapsed()).await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(started.elapsed()).await;
                Err(CallError::Downstream(e))
            }
        }
    }

    /// Gate a call, moving Open -> HalfOpen once the recovery timeout has passed
    async fn admit<E>(&self) -> Result<(), CallError<E>> {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let recovered = state
                    .last_failure
                    .map_or(true, |t| t.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    info!(breaker = %self.name, "circuit breaker entering HALF_OPEN");
                    Ok(())
                } else {
                    state.rejected_calls += 1;
                    Err(CallError::Open {
                        name: self.name.to_string(),
                    })
                }
            }
        }
    }

    /// Record a successful call
    pub async fn record_success(&self, latency: Duration) {
        let mut state = self.state.lock().await;
        state.push_outcome(
            self.config.history_capacity,
            OutcomeRecord {
                success: true,
                latency,
                at: Instant::now(),
            },
        );

        match state.state {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    info!(breaker = %self.name, "circuit breaker CLOSED (recovered)");
                }
            }
            // A call admitted before the circuit opened; history only
            CircuitState::Open => {}
        }

        self.adapt_threshold(&mut state);
    }

    /// Record a failed call
    pub async fn record_failure(&self, latency: Duration) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.failure_count += 1;
        state.last_failure = Some(now);
        state.push_outcome(
            self.config.history_capacity,
            OutcomeRecord {
                success: false,
                latency,
                at: now,
            },
        );

        self.adapt_threshold(&mut state);

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= state.failure_threshold {
                    self.trip(&mut state);
                    warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        threshold = state.failure_threshold,
                        "circuit breaker OPEN (too many failures)"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.trip(&mut state);
                warn!(breaker = %self.name, "circuit breaker OPEN (recovery trial failed)");
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, state: &mut CircuitBreakerState) {
        state.state = CircuitState::Open;
        state.success_count = 0;
        state.times_opened += 1;
    }

    fn adapt_threshold(&self, state: &mut CircuitBreakerState) {
        if !self.config.adaptive || state.history.len() < self.config.adaptation_window {
            return;
        }
        let Some(rate) = state.success_rate(self.config.adaptation_window) else {
            return;
        };

        let current = state.failure_threshold;
        let adjusted = if rate > self.config.high_water_mark {
            (current + self.config.threshold_step).min(self.config.threshold_max)
        } else if rate < self.config.low_water_mark {
            current
                .saturating_sub(self.config.threshold_step)
                .max(self.config.threshold_min)
        } else {
            current
        };

        if adjusted != current {
            state.failure_threshold = adjusted;
            debug!(
                breaker = %self.name,
                success_rate = rate,
                from = current,
                to = adjusted,
                "adapted failure threshold"
            );
        }
    }

    /// Snapshot statistics
    pub async fn stats(&self) -> BreakerStats {
        let state = self.state.lock().await;
        let total = state.history.len();
        let average_latency_ms = if total == 0 {
            0.0
        } else {
            state
                .history
                .iter()
                .map(|o| o.latency.as_secs_f64() * 1000.0)
                .sum::<f64>()
                / total as f64
        };

        BreakerStats {
            name: self.name.to_string(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            failure_threshold: state.failure_threshold,
            recent_success_rate: state
                .success_rate(self.config.adaptation_window)
                .unwrap_or(0.0),
            total_operations: total,
            average_latency_ms,
            times_opened: state.times_opened,
            rejected_calls: state.rejected_calls,
            secs_since_last_failure: state.last_failure.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed(threshold: usize, recovery: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            success_threshold: 2,
            recovery_timeout: recovery,
            adaptive: false,
            ..Default::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> CallError<String> {
        breaker
            .execute(|| async { Err::<(), _>("downstream error".to_string()) })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker
            .execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_to_open() {
        let breaker = CircuitBreaker::new("llm", fixed(3, Duration::from_secs(60)));

        for _ in 0..3 {
            let err = fail(&breaker).await;
            assert!(!err.is_open());
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Fourth call is rejected without running the operation
        let invoked = AtomicUsize::new(0);
        let result: Result<(), CallError<String>> = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CallError::Open { ref name }) if name == "llm"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().await.rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_downstream_error_returned_unchanged() {
        let breaker = CircuitBreaker::new_default("io");

        let err = breaker
            .execute(|| async {
                Err::<(), _>(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "peer reset",
                ))
            })
            .await
            .unwrap_err();

        let inner = err.into_downstream().unwrap();
        assert_eq!(inner.kind(), std::io::ErrorKind::ConnectionReset);
        assert_eq!(inner.to_string(), "peer reset");
        assert_eq!(breaker.failure_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_to_half_open_after_recovery_timeout() {
        let breaker = CircuitBreaker::new("llm", fixed(2, Duration::from_secs(30)));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(fail(&breaker).await.is_open());

        tokio::time::advance(Duration::from_secs(21)).await;
        let invoked = AtomicUsize::new(0);
        let result: Result<(), CallError<String>> = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert_eq!(breaker.success_count().await, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_to_closed() {
        let breaker = CircuitBreaker::new("llm", fixed(2, Duration::from_millis(50)));

        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        succeed(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        succeed(&breaker).await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("llm", fixed(2, Duration::from_millis(30)));

        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        succeed(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let err = fail(&breaker).await;
        assert!(!err.is_open(), "the trial call itself ran");
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(fail(&breaker).await.is_open());
        assert_eq!(breaker.stats().await.times_opened, 2);
    }

    #[tokio::test]
    async fn test_success_decays_failure_count() {
        let breaker = CircuitBreaker::new("llm", fixed(3, Duration::from_secs(60)));

        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.failure_count().await, 1);

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_adaptive_threshold_rises_with_reliability() {
        let breaker = CircuitBreaker::new_default("stable");

        for _ in 0..19 {
            succeed(&breaker).await;
        }
        assert_eq!(breaker.failure_threshold().await, 5, "window not yet full");

        succeed(&breaker).await;
        assert_eq!(breaker.failure_threshold().await, 6);

        for _ in 0..20 {
            succeed(&breaker).await;
        }
        assert_eq!(breaker.failure_threshold().await, 15, "capped at the maximum");
    }

    #[tokio::test]
    async fn test_adaptive_threshold_falls_with_failures() {
        let breaker = CircuitBreaker::new_default("flaky");

        // Alternate failure/success so the decaying count never trips the breaker
        for _ in 0..10 {
            fail(&breaker).await;
            succeed(&breaker).await;
        }
        assert_eq!(breaker.failure_threshold().await, 4);

        for _ in 0..5 {
            fail(&breaker).await;
            succeed(&breaker).await;
        }
        assert_eq!(breaker.failure_threshold().await, 3, "floored at the minimum");
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = CircuitBreakerConfig {
            history_capacity: 8,
            adaptive: false,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new("bounded", config);

        for _ in 0..20 {
            succeed(&breaker).await;
        }
        let history = breaker.history().await;
        assert_eq!(history.len(), 8);
        assert!(history.iter().all(|o| o.success));
    }

    #[tokio::test]
    async fn test_band_contains_starting_threshold() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new("tight", config);
        assert_eq!(breaker.config().threshold_min, 1);

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = CircuitBreaker::new("llm", fixed(1, Duration::from_secs(60)));
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        breaker.reset().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }
}
