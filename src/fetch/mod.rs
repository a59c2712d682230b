//! Resilient HTTP fetching.
//!
//! - [`FetchClient`] - profile fallback, bounded retries, per-origin pools
//! - [`RetryPolicy`] / [`classify_error`] - retry decisions
//! - [`RateLimiter`] - per-origin politeness and Retry-After
//! - [`charset`] - body decoding and query encoding for legacy charsets

pub mod charset;
mod client;
mod error;
mod profile;
pub mod rate_limiter;
pub mod retry;

pub use client::{DEFAULT_MAX_IN_FLIGHT, FetchClient, FetchConfig, FetchRequest, FetchResponse};
pub use error::FetchError;
pub use profile::{RequestProfile, default_profiles};
pub use rate_limiter::{RateLimiter, extract_origin, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
