//! Error types for page fetching.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while fetching a page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection-level failure (DNS, refused connection, TLS, reset body).
    #[error("transport error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// No complete response within the per-call deadline.
    #[error("timeout after {after:?} fetching {url}")]
    Timeout { url: String, after: Duration },

    /// Non-success HTTP status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Raw Retry-After header, when the server sent one.
        retry_after: Option<String>,
    },

    /// The URL could not be parsed or uses an unsupported scheme.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// The circuit for this operation is open; no request was made.
    #[error("circuit open for {operation}, retry in {retry_in:?}")]
    CircuitOpen {
        operation: String,
        retry_in: Duration,
    },

    /// The fetch client was shut down while the request waited for a slot.
    #[error("fetch client is shut down")]
    Closed,
}

impl FetchError {
    /// Creates a transport error from a reqwest error.
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            after,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error carrying a Retry-After value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a circuit-open rejection.
    pub fn circuit_open(operation: impl Into<String>, retry_in: Duration) -> Self {
        Self::CircuitOpen {
            operation: operation.into(),
            retry_in,
        }
    }

    /// Whether this failure says something about the health of the source.
    ///
    /// Client errors other than 408/429 prove the server answered, so they
    /// do not count against its circuit.
    #[must_use]
    pub fn counts_against_source(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            Self::InvalidUrl { .. } | Self::CircuitOpen { .. } | Self::Closed => false,
        }
    }

    /// Whether this is a circuit-open rejection.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether this is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
