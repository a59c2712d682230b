use thiserror::Error;

use crate::extract::ExtractError;
use crate::progress::ProgressError;
use crate::sink::SinkError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl ServiceError {
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}
