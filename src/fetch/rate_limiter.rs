//! Per-origin politeness delay.
//!
//! Requests to the same origin are spaced at least `min_delay` apart; requests
//! to different origins never wait on each other. A server's Retry-After is
//! recorded as a "not before" instant for its origin.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::fetch::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(200));
//! limiter.acquire("https://a.example/book/1/").await; // immediate
//! limiter.acquire("https://a.example/book/1/2.html").await; // waits ~200ms
//! limiter.acquire("https://b.example/").await; // immediate
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warn once an origin has accumulated this much waiting.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Upper bound honored for Retry-After.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-origin rate limiter, shared behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    origins: DashMap<String, OriginSlot>,
}

#[derive(Debug, Default)]
struct OriginSlot {
    /// Start time reserved by the most recent caller.
    next_free: Mutex<Option<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl OriginSlot {
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self.cumulative_delay_ms.fetch_add(delay_ms, Ordering::SeqCst) + delay_ms;
        Duration::from_millis(total)
    }
}

impl RateLimiter {
    /// Creates a limiter; a zero delay disables spacing.
    #[must_use]
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            origins: DashMap::new(),
        }
    }

    /// A limiter that never waits (Retry-After is still honored).
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    #[must_use]
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Waits until a request to `url`'s origin may be sent.
    ///
    /// Each caller reserves the next free slot under a short lock, then sleeps
    /// without holding it, so concurrent callers to one origin queue up in
    /// `min_delay` steps.
    #[instrument(level = "debug", skip(self), fields(origin))]
    pub async fn acquire(&self, url: &str) {
        let origin = extract_origin(url);
        tracing::Span::current().record("origin", origin.as_str());

        let now = Instant::now();
        let (start_at, cumulative) = {
            let slot = self.origins.entry(origin.clone()).or_default();
            let mut next_free = slot.next_free.lock().unwrap_or_else(PoisonError::into_inner);
            let start_at = next_free.map_or(now, |reserved| reserved.max(now));
            *next_free = Some(start_at + self.min_delay);
            let wait = start_at.saturating_duration_since(now);
            let cumulative = (!wait.is_zero()).then(|| slot.add_cumulative_delay(wait));
            (start_at, cumulative)
        };

        if let Some(cumulative) = cumulative {
            debug!(
                origin = %origin,
                delay_ms = start_at.saturating_duration_since(now).as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying politeness delay"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    origin = %origin,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting for origin"
                );
            }
            tokio::time::sleep_until(start_at).await;
        }
    }

    /// Pushes the origin's next free slot out by a server-mandated delay.
    #[instrument(level = "debug", skip(self), fields(origin))]
    pub fn record_rate_limit(&self, url: &str, delay: Duration) {
        let origin = extract_origin(url);
        tracing::Span::current().record("origin", origin.as_str());

        let delay = delay.min(MAX_RETRY_AFTER);
        let not_before = Instant::now() + delay;
        let slot = self.origins.entry(origin.clone()).or_default();
        let mut next_free = slot.next_free.lock().unwrap_or_else(PoisonError::into_inner);
        *next_free = Some(next_free.map_or(not_before, |reserved| reserved.max(not_before)));
        debug!(origin = %origin, delay_ms = delay.as_millis(), "recorded server rate limit");
    }
}

/// Extracts `scheme://host[:port]` from a URL, lowercased.
///
/// Malformed URLs share the `"unknown"` bucket so they are still limited.
///
/// ```
/// use harvester_core::fetch::extract_origin;
///
/// assert_eq!(extract_origin("https://Example.com/a/b"), "https://example.com");
/// assert_eq!(extract_origin("http://localhost:8080/x"), "http://localhost:8080");
/// assert_eq!(extract_origin("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_origin(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .filter(|parsed| parsed.host_str().is_some())
        .map(|parsed| parsed.origin().ascii_serialization().to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After value (delta seconds or HTTP-date), capped at one hour.
///
/// ```
/// use std::time::Duration;
/// use harvester_core::fetch::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let when = httpdate::parse_http_date(header_value).ok()?;
    let delay = when
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Some(delay.min(MAX_RETRY_AFTER))
}
