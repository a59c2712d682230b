//! Latency-derived timeouts.
//!
//! For each operation the last `window` successful call durations are kept.
//! The next timeout is the 90th percentile of that window multiplied by an
//! adaptive factor, clamped to `[min, max]`. The factor grows with every
//! consecutive timeout and snaps back on success, so a source that has just
//! become slow gets more slack instead of failing forever.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

const DEFAULT_WINDOW: usize = 20;
const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(60);
const BASE_FACTOR: f64 = 2.0;
const FACTOR_STEP: f64 = 0.5;
const MAX_FACTOR: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Number of recent successes considered.
    pub window: usize,
    pub min: Duration,
    pub max: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            min: DEFAULT_MIN_TIMEOUT,
            max: DEFAULT_MAX_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    consecutive_timeouts: u32,
}

impl LatencyWindow {
    fn factor(&self) -> f64 {
        (BASE_FACTOR + FACTOR_STEP * f64::from(self.consecutive_timeouts)).min(MAX_FACTOR)
    }

    /// Nearest-rank 90th percentile.
    fn p90(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() * 9).div_ceil(10).max(1);
        sorted.get(rank - 1).copied()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::from_millis((duration.as_millis() as f64 * factor).round() as u64)
}

/// Per-operation adaptive timeout calculator.
#[derive(Debug, Default)]
pub struct AdaptiveTimeout {
    config: TimeoutConfig,
    windows: DashMap<String, LatencyWindow>,
}

impl AdaptiveTimeout {
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        let max = config.max.max(config.min);
        Self {
            config: TimeoutConfig {
                window: config.window.max(1),
                min: config.min,
                max,
            },
            windows: DashMap::new(),
        }
    }

    /// Timeout for the next call of `operation`; `fallback` is used (clamped)
    /// until a success has been recorded.
    #[must_use]
    pub fn timeout_for(&self, operation: &str, fallback: Duration) -> Duration {
        let computed = self
            .windows
            .get(operation)
            .and_then(|window| window.p90().map(|p90| scale(p90, window.factor())));
        computed
            .unwrap_or(fallback)
            .clamp(self.config.min, self.config.max)
    }

    /// Adds a successful call's duration and resets the timeout streak.
    pub fn record_success(&self, operation: &str, elapsed: Duration) {
        let mut window = self.windows.entry(operation.to_string()).or_default();
        if window.samples.len() == self.config.window {
            window.samples.pop_front();
        }
        window.samples.push_back(elapsed);
        window.consecutive_timeouts = 0;
    }

    /// Notes a call that ran out of time.
    pub fn record_timeout(&self, operation: &str) {
        let mut window = self.windows.entry(operation.to_string()).or_default();
        window.consecutive_timeouts = window.consecutive_timeouts.saturating_add(1);
        debug!(
            operation,
            consecutive_timeouts = window.consecutive_timeouts,
            factor = window.factor(),
            "timeout recorded"
        );
    }

    /// Number of samples currently held for an operation.
    #[must_use]
    pub fn samples(&self, operation: &str) -> usize {
        self.windows
            .get(operation)
            .map_or(0, |window| window.samples.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OP: &str = "x:chapter";

    fn timeouts() -> AdaptiveTimeout {
        AdaptiveTimeout::new(TimeoutConfig {
            window: 10,
            min: Duration::from_millis(500),
            max: Duration::from_secs(20),
        })
    }

    #[test]
    fn test_fallback_used_without_history() {
        let t = timeouts();
        assert_eq!(t.timeout_for(OP, Duration::from_secs(8)), Duration::from_secs(8));
    }

    #[test]
    fn test_fallback_is_clamped() {
        let t = timeouts();
        assert_eq!(t.timeout_for(OP, Duration::from_secs(90)), Duration::from_secs(20));
        assert_eq!(t.timeout_for(OP, Duration::from_millis(1)), Duration::from_millis(500));
    }

    #[test]
    fn test_p90_times_base_factor() {
        let t = timeouts();
        for ms in [100, 200, 300, 400, 500, 600, 700, 800, 900, 1000] {
            t.record_success(OP, Duration::from_millis(ms));
        }
        // p90 of 100..=1000 is 900ms, times 2.0
        assert_eq!(t.timeout_for(OP, Duration::from_secs(30)), Duration::from_millis(1800));
    }

    #[test]
    fn test_timeouts_grow_factor_until_cap() {
        let t = timeouts();
        t.record_success(OP, Duration::from_secs(1));
        t.record_timeout(OP);
        assert_eq!(t.timeout_for(OP, Duration::ZERO), Duration::from_millis(2500));
        for _ in 0..10 {
            t.record_timeout(OP);
        }
        assert_eq!(t.timeout_for(OP, Duration::ZERO), Duration::from_secs(4));
        t.record_success(OP, Duration::from_secs(1));
        assert_eq!(t.timeout_for(OP, Duration::ZERO), Duration::from_secs(2));
    }

    #[test]
    fn test_window_keeps_only_recent_samples() {
        let t = timeouts();
        for _ in 0..10 {
            t.record_success(OP, Duration::from_secs(9));
        }
        for _ in 0..10 {
            t.record_success(OP, Duration::from_millis(300));
        }
        assert_eq!(t.samples(OP), 10);
        assert_eq!(t.timeout_for(OP, Duration::ZERO), Duration::from_millis(600));
    }
}
