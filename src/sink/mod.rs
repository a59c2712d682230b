//! Document assembly.
//!
//! A [`DocumentSink`] turns a finished download into a file. The crate
//! ships [`TextSink`], which writes plain UTF-8 text; other formats are
//! rejected with [`SinkError::UnsupportedFormat`].

mod error;
mod text;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::SinkError;
pub use text::{TextSink, sanitize_file_stem};

use crate::model::{BookDetail, Chapter};

/// Output container format requested for a download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    #[default]
    Txt,
    Epub,
}

impl DocumentFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Txt => "txt",
            Self::Epub => "epub",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for DocumentFormat {
    type Err = SinkError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "txt" | "text" => Ok(Self::Txt),
            "epub" => Ok(Self::Epub),
            other => Err(SinkError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Writes a book and its ordered chapters somewhere durable.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    fn supports(&self, format: DocumentFormat) -> bool;

    /// Writes the document and returns the path of the created file.
    ///
    /// # Errors
    ///
    /// [`SinkError::UnsupportedFormat`] when `format` is not supported,
    /// [`SinkError::Io`] when the file cannot be written.
    async fn write(
        &self,
        book: &BookDetail,
        chapters: &[Chapter],
        format: DocumentFormat,
    ) -> Result<PathBuf, SinkError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("TXT".parse::<DocumentFormat>().unwrap(), DocumentFormat::Txt);
        assert_eq!("epub".parse::<DocumentFormat>().unwrap(), DocumentFormat::Epub);
        assert!(matches!(
            "pdf".parse::<DocumentFormat>(),
            Err(SinkError::UnsupportedFormat(format)) if format == "pdf"
        ));
    }
}
