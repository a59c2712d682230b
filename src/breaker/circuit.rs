//! Per-operation circuit breaker.
//!
//! ```text
//!            failure_threshold consecutive failures
//!   Closed ──────────────────────────────────────────▶ Open
//!     ▲                                                │
//!     │ probe succeeds              recovery_timeout   │
//!     │                             elapsed            ▼
//!     └───────────────────────────────────────────  HalfOpen
//!                      probe fails: back to Open, timer restarts
//! ```
//!
//! While HalfOpen exactly one caller (the probe) is admitted; everyone else
//! is rejected until the probe reports back.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::fetch::FetchError;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed.
    Normal,
    /// The single HalfOpen probe. Its outcome decides the next state.
    Probe,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStatus {
    pub operation: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time since the most recent failure, if any.
    pub since_last_failure: Option<Duration>,
}

/// Circuit table keyed by operation name (`"<source>:<operation>"`).
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: DashMap<String, Circuit>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            circuits: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Admission check made before any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::CircuitOpen`] while the circuit is Open, or while
    /// HalfOpen with the probe already in flight.
    pub fn try_acquire(&self, operation: &str) -> Result<Admission, FetchError> {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(operation.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.recovery_timeout {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    info!(operation, "circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    debug!(operation, "circuit open, rejecting call");
                    Err(FetchError::circuit_open(
                        operation,
                        self.config.recovery_timeout - elapsed,
                    ))
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Err(FetchError::circuit_open(operation, Duration::ZERO))
                } else {
                    circuit.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Records a successful call. Closes a HalfOpen circuit.
    pub fn record_success(&self, operation: &str) {
        let Some(mut circuit) = self.circuits.get_mut(operation) else {
            return;
        };
        match circuit.state {
            CircuitState::HalfOpen => {
                info!(operation, "probe succeeded, circuit closed");
                *circuit = Circuit::new();
            }
            CircuitState::Closed => circuit.consecutive_failures = 0,
            // A call admitted before the circuit opened; the open timer stands.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call. Opens the circuit at the threshold, or
    /// re-opens it when the probe failed.
    pub fn record_failure(&self, operation: &str) {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(operation.to_string())
            .or_insert_with(Circuit::new);
        circuit.last_failure = Some(now);
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        operation,
                        failures = circuit.consecutive_failures,
                        recovery_secs = self.config.recovery_timeout.as_secs(),
                        "circuit opened"
                    );
                    circuit.open(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(operation, "probe failed, circuit re-opened");
                circuit.open(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Frees the probe slot of a probe that ended without an outcome
    /// (dropped future, neutral error), leaving the circuit HalfOpen.
    pub fn release_probe(&self, operation: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(operation)
            && circuit.state == CircuitState::HalfOpen
        {
            circuit.probe_in_flight = false;
        }
    }

    /// Current state; unknown operations are Closed.
    #[must_use]
    pub fn state(&self, operation: &str) -> CircuitState {
        self.circuits
            .get(operation)
            .map_or(CircuitState::Closed, |circuit| circuit.state)
    }

    /// All known circuits, sorted by operation name.
    #[must_use]
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let now = Instant::now();
        let mut statuses: Vec<CircuitStatus> = self
            .circuits
            .iter()
            .map(|entry| CircuitStatus {
                operation: entry.key().clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                since_last_failure: entry
                    .last_failure
                    .map(|at| now.saturating_duration_since(at)),
            })
            .collect();
        statuses.sort_by(|a, b| a.operation.cmp(&b.operation));
        statuses
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const OP: &str = "x:chapter";

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_unknown_operation_is_closed() {
        let breaker = breaker(3);
        assert_eq!(breaker.state(OP), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(OP).unwrap(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3);
        breaker.record_failure(OP);
        breaker.record_failure(OP);
        assert_eq!(breaker.state(OP), CircuitState::Closed);
        breaker.record_failure(OP);
        assert_eq!(breaker.state(OP), CircuitState::Open);
        assert!(breaker.try_acquire(OP).unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = breaker(3);
        breaker.record_failure(OP);
        breaker.record_failure(OP);
        breaker.record_success(OP);
        breaker.record_failure(OP);
        breaker.record_failure(OP);
        assert_eq!(breaker.state(OP), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let breaker = breaker(1);
        breaker.record_failure(OP);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(breaker.try_acquire(OP).unwrap(), Admission::Probe);
        assert_eq!(breaker.state(OP), CircuitState::HalfOpen);
        assert!(breaker.try_acquire(OP).is_err());
        assert!(breaker.try_acquire(OP).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes_circuit() {
        let breaker = breaker(1);
        breaker.record_failure(OP);
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.try_acquire(OP).unwrap();
        breaker.record_success(OP);
        assert_eq!(breaker.state(OP), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(OP).unwrap(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_and_restarts_timer() {
        let breaker = breaker(1);
        breaker.record_failure(OP);
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.try_acquire(OP).unwrap();
        breaker.record_failure(OP);
        assert_eq!(breaker.state(OP), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire(OP).is_err());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.try_acquire(OP).unwrap(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_can_be_retaken() {
        let breaker = breaker(1);
        breaker.record_failure(OP);
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.try_acquire(OP).unwrap();
        breaker.release_probe(OP);
        assert_eq!(breaker.try_acquire(OP).unwrap(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuits_are_independent_per_operation() {
        let breaker = breaker(1);
        breaker.record_failure("x:toc");
        assert_eq!(breaker.state("x:toc"), CircuitState::Open);
        assert_eq!(breaker.try_acquire("y:toc").unwrap(), Admission::Normal);
        assert_eq!(breaker.statuses().len(), 2);
    }

    #[test]
    fn test_rejection_reports_remaining_cooldown() {
        let breaker = breaker(1);
        breaker.record_failure(OP);
        match breaker.try_acquire(OP).unwrap_err() {
            FetchError::CircuitOpen { retry_in, .. } => {
                assert!(retry_in <= Duration::from_secs(30));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
