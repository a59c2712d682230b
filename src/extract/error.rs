use std::fmt;

use thiserror::Error;

use crate::fetch::{FailureType, FetchError, classify_error};
use crate::rule::Operation;
use crate::validate::RejectReason;

/// Extraction strategies in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    PrimarySelectors,
    AlternateSelectors,
    PatternExtraction,
    LargestTextBlock,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PrimarySelectors => "primary-selectors",
            Self::AlternateSelectors => "alternate-selectors",
            Self::PatternExtraction => "pattern-extraction",
            Self::LargestTextBlock => "largest-text-block",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    NoMatch,
    Rejected(RejectReason),
}

/// What one strategy did with a page.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyAttempt {
    pub strategy: StrategyKind,
    pub outcome: AttemptOutcome,
}

impl fmt::Display for StrategyAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::NoMatch => write!(f, "{}: no match", self.strategy),
            AttemptOutcome::Rejected(reason) => write!(f, "{}: rejected, {reason}", self.strategy),
        }
    }
}

fn describe(attempts: &[StrategyAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{operation} extraction failed for {url} [{}]", describe(.attempts))]
    Failed {
        operation: Operation,
        url: String,
        attempts: Vec<StrategyAttempt>,
    },

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("source {source_id} has no {operation} rule")]
    MissingRule {
        source_id: String,
        operation: Operation,
    },
}

impl ExtractError {
    pub fn failed(operation: Operation, url: impl Into<String>, attempts: Vec<StrategyAttempt>) -> Self {
        Self::Failed {
            operation,
            url: url.into(),
            attempts,
        }
    }

    pub fn missing_rule(source_id: impl Into<String>, operation: Operation) -> Self {
        Self::MissingRule {
            source_id: source_id.into(),
            operation,
        }
    }

    /// Errors worth retrying later: transient fetch failures and extraction
    /// failures (a page served half-rendered often extracts on a re-fetch).
    /// An open circuit, a 404 or a configuration problem will not change.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(error) => {
                !error.is_circuit_open()
                    && matches!(
                        classify_error(error),
                        FailureType::Transient | FailureType::RateLimited
                    )
            }
            Self::Failed { .. } => true,
            Self::UnknownSource(_) | Self::MissingRule { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_failed_lists_every_strategy() {
        let error = ExtractError::failed(
            Operation::Chapter,
            "https://x.example/1.html",
            vec![
                StrategyAttempt {
                    strategy: StrategyKind::PrimarySelectors,
                    outcome: AttemptOutcome::NoMatch,
                },
                StrategyAttempt {
                    strategy: StrategyKind::LargestTextBlock,
                    outcome: AttemptOutcome::Rejected(RejectReason::Empty),
                },
            ],
        );
        assert_eq!(
            error.to_string(),
            "chapter extraction failed for https://x.example/1.html \
             [primary-selectors: no match; largest-text-block: rejected, empty]"
        );
    }

    #[test]
    fn test_retryable_classes() {
        assert!(ExtractError::from(FetchError::timeout("u", Duration::from_secs(1))).is_retryable());
        assert!(ExtractError::from(FetchError::http_status("u", 503)).is_retryable());
        assert!(!ExtractError::from(FetchError::http_status("u", 404)).is_retryable());
        assert!(!ExtractError::from(FetchError::circuit_open("x:chapter", Duration::ZERO)).is_retryable());
        assert!(ExtractError::failed(Operation::Chapter, "u", Vec::new()).is_retryable());
        assert!(!ExtractError::UnknownSource("x".into()).is_retryable());
    }
}
