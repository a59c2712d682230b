//! Failure isolation for unreliable sources.
//!
//! [`Guard`] wraps every network-bound operation: it asks the
//! [`CircuitBreaker`] for admission before any I/O, bounds the call by a
//! timeout computed by [`AdaptiveTimeout`], and records the outcome in both.

mod circuit;
mod timeout;

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub use circuit::{
    Admission, BreakerConfig, CircuitBreaker, CircuitState, CircuitStatus,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT,
};
pub use timeout::{AdaptiveTimeout, TimeoutConfig};

use crate::fetch::FetchError;

/// Circuit breaker and adaptive timeout, applied together.
#[derive(Debug, Default)]
pub struct Guard {
    breaker: CircuitBreaker,
    timeouts: AdaptiveTimeout,
}

/// Frees a HalfOpen probe slot if the guarded future is dropped mid-call.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    operation: &'a str,
    armed: bool,
}

impl ProbeSlot<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe(self.operation);
        }
    }
}

impl Guard {
    #[must_use]
    pub fn new(breaker: BreakerConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker),
            timeouts: AdaptiveTimeout::new(timeouts),
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn timeouts(&self) -> &AdaptiveTimeout {
        &self.timeouts
    }

    /// Runs `call` under the breaker for `operation`.
    ///
    /// The whole call, retries included, must finish within the adaptive
    /// timeout, which `call` also receives for its own requests; `fallback`
    /// seeds that timeout until the operation has latency history. A call
    /// still running at the deadline is dropped and reported as
    /// [`FetchError::Timeout`]. Transport failures,
    /// timeouts and 5xx/408/429 responses count as failures; other 4xx count
    /// as successes (the source answered).
    ///
    /// # Errors
    ///
    /// [`FetchError::CircuitOpen`] without invoking `call` when the circuit
    /// rejects the call; otherwise whatever `call` returns.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        fallback: Duration,
        call: F,
    ) -> Result<T, FetchError>
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let admission = self.breaker.try_acquire(operation)?;
        let mut slot = ProbeSlot {
            breaker: &self.breaker,
            operation,
            armed: admission == Admission::Probe,
        };

        let timeout = self.timeouts.timeout_for(operation, fallback);
        debug!(
            operation,
            timeout_ms = timeout.as_millis(),
            probe = admission == Admission::Probe,
            "guarded call"
        );
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, call(timeout)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(operation, timeout_ms = timeout.as_millis(), "guarded call exceeded its deadline");
                Err(FetchError::timeout(operation, timeout))
            }
        };

        match &result {
            Ok(_) => {
                self.timeouts.record_success(operation, started.elapsed());
                self.breaker.record_success(operation);
                slot.disarm();
            }
            Err(error) if error.counts_against_source() => {
                if error.is_timeout() {
                    self.timeouts.record_timeout(operation);
                }
                self.breaker.record_failure(operation);
                slot.disarm();
            }
            Err(FetchError::HttpStatus { .. }) => {
                self.breaker.record_success(operation);
                slot.disarm();
            }
            // Neutral outcomes leave the probe slot to the drop guard.
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const OP: &str = "x:chapter";

    fn guard(threshold: u32) -> Guard {
        Guard::new(
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(10),
            },
            TimeoutConfig {
                window: 5,
                min: Duration::from_millis(100),
                max: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_call() {
        let guard = guard(2);
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        for _ in 0..2 {
            let result: Result<(), _> = guard
                .run(OP, Duration::from_secs(1), |t| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::timeout("u", t))
                })
                .await;
            assert!(result.is_err());
        }

        let result: Result<(), _> = guard
            .run(OP, Duration::from_secs(1), |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_does_not_trip_breaker() {
        let guard = guard(1);
        let result: Result<(), _> = guard
            .run(OP, Duration::from_secs(1), |_| async {
                Err(FetchError::http_status("u", 404))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(guard.breaker().state(OP), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_receives_fallback_then_adaptive_timeout() {
        let guard = guard(3);
        let seen = guard
            .run(OP, Duration::from_secs(7), |t| async move { Ok(t) })
            .await
            .unwrap();
        assert_eq!(seen, Duration::from_secs(7));

        guard.timeouts().record_success(OP, Duration::from_millis(400));
        let seen = guard
            .run(OP, Duration::from_secs(7), |t| async move { Ok(t) })
            .await
            .unwrap();
        assert_eq!(seen, Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_is_cut_off_at_deadline() {
        let guard = guard(3);
        for _ in 0..3 {
            let started = Instant::now();
            let result: Result<(), _> = guard
                .run(OP, Duration::from_secs(5), |_| async {
                    // A client walking several profiles with backoff.
                    tokio::time::sleep(Duration::from_secs(540)).await;
                    Ok(())
                })
                .await;
            let error = result.unwrap_err();
            assert!(error.is_timeout(), "expected timeout, got {error:?}");
            assert!(started.elapsed() < Duration::from_secs(31));
        }
        assert_eq!(guard.breaker().state(OP), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let guard = guard(1);
        let _: Result<(), _> = guard
            .run(OP, Duration::from_secs(1), |_| async {
                Err(FetchError::http_status("u", 503))
            })
            .await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let pending = guard.run(OP, Duration::from_secs(1), |_| async {
            std::future::pending::<Result<(), FetchError>>().await
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        assert_eq!(guard.breaker().state(OP), CircuitState::HalfOpen);
        let result: Result<(), _> = guard.run(OP, Duration::from_secs(1), |_| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(guard.breaker().state(OP), CircuitState::Closed);
    }
}
