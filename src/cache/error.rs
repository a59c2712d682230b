//! Cache errors. Callers log these; a cache failure never fails an
//! operation.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry {label} could not be (de)serialized: {source}")]
    Serialize {
        label: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn serialize(label: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialize {
            label: label.into(),
            source,
        }
    }
}
