//! Errors raised while loading source rules.

use std::path::PathBuf;

use thiserror::Error;

/// A rule configuration could not be turned into a [`super::SourceRule`].
///
/// These are schema errors: the process is expected to refuse to start
/// rather than run with a half-loaded rule set.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The rules file could not be read.
    #[error("failed to read rules from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The rules document is not valid JSON or does not match the schema.
    #[error("malformed rule records: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },

    /// A selector failed to parse.
    #[error("source '{source_id}': invalid selector for {field}: '{selector}' ({reason})")]
    InvalidSelector {
        source_id: String,
        field: String,
        selector: String,
        reason: String,
    },

    /// An ad pattern is not a valid regular expression.
    #[error("source '{source_id}': invalid ad pattern '{pattern}': {source}")]
    InvalidPattern {
        source_id: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The base URL is not an absolute http(s) URL.
    #[error("source '{source_id}': invalid base URL '{url}'")]
    InvalidUrl { source_id: String, url: String },

    /// A header name or value cannot be sent.
    #[error("source '{source_id}': invalid header '{name}'")]
    InvalidHeader { source_id: String, name: String },

    /// A field holds a value outside what the pipeline supports.
    #[error("source '{source_id}': invalid value for {field}: {reason}")]
    InvalidValue {
        source_id: String,
        field: String,
        reason: String,
    },

    /// Two records share the same id.
    #[error("duplicate source id '{0}'")]
    DuplicateId(String),
}

impl RuleError {
    /// Creates an invalid selector error.
    pub fn invalid_selector(
        source_id: impl Into<String>,
        field: impl Into<String>,
        selector: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSelector {
            source_id: source_id.into(),
            field: field.into(),
            selector: selector.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(
        source_id: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            source_id: source_id.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}
