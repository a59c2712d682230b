//! Cache categories and content-addressed keys.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const HOUR: u64 = 60 * 60;

/// Kind of cached record. Each category has its own directory on disk and
/// its own default time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    Search,
    Books,
    Toc,
    Chapters,
}

impl CacheCategory {
    pub const ALL: [Self; 4] = [Self::Search, Self::Books, Self::Toc, Self::Chapters];

    /// Directory name under the cache root, also the label prefix.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Books => "books",
            Self::Toc => "toc",
            Self::Chapters => "chapters",
        }
    }

    #[must_use]
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::Search => Duration::from_secs(HOUR),
            Self::Books => Duration::from_secs(24 * HOUR),
            Self::Toc => Duration::from_secs(6 * HOUR),
            Self::Chapters => Duration::from_secs(30 * 24 * HOUR),
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one cache entry.
///
/// The readable `label` (`toc:biquge:https://...`) is what invalidation
/// patterns match; the SHA-256 of the label names the entry on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    category: CacheCategory,
    label: String,
    hash: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(category: CacheCategory, parts: &[&str]) -> Self {
        let label = format!("{}:{}", category.as_str(), parts.join(":"));
        let hash = format!("{:x}", Sha256::digest(label.as_bytes()));
        Self {
            category,
            label,
            hash,
        }
    }

    #[must_use]
    pub fn search(source_id: &str, keyword: &str) -> Self {
        Self::new(CacheCategory::Search, &[source_id, keyword.trim()])
    }

    #[must_use]
    pub fn book(source_id: &str, url: &str) -> Self {
        Self::new(CacheCategory::Books, &[source_id, url])
    }

    #[must_use]
    pub fn toc(source_id: &str, url: &str) -> Self {
        Self::new(CacheCategory::Toc, &[source_id, url])
    }

    #[must_use]
    pub fn chapter(source_id: &str, url: &str) -> Self {
        Self::new(CacheCategory::Chapters, &[source_id, url])
    }

    #[must_use]
    pub fn category(&self) -> CacheCategory {
        self.category
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Hex SHA-256 of the label.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Compiles a `*` glob into an anchored regex. Every other character
/// matches literally.
#[must_use]
pub fn glob_regex(pattern: &str) -> Option<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).ok()
}
