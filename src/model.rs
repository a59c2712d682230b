//! Value records produced by the extractors and consumed by callers.
//!
//! Every record carries the identity fields `title` and `url` (always an
//! absolute URL once it leaves an extractor). Optional metadata is left as
//! `None` when a source does not expose it.

use serde::{Deserialize, Serialize};

/// One hit from a source's search page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    pub intro: Option<String>,
    pub category: Option<String>,
    pub latest_chapter: Option<String>,
    pub word_count: Option<String>,
    pub update_time: Option<String>,
    pub cover_url: Option<String>,
    /// Id of the rule that produced this result.
    pub source_id: String,
    /// Display name of the source.
    pub source_name: String,
}

/// Metadata from a book's detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDetail {
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    pub intro: Option<String>,
    pub category: Option<String>,
    pub cover_url: Option<String>,
    pub status: Option<String>,
    pub word_count: Option<String>,
    pub update_time: Option<String>,
    pub latest_chapter: Option<String>,
    /// Where the table of contents lives; equals `url` when the detail page
    /// doubles as the TOC.
    pub toc_url: String,
    pub source_id: String,
}

/// A TOC entry: a chapter reference without its body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterInfo {
    pub title: String,
    pub url: String,
    /// 1-based position in the table of contents.
    pub order: u32,
}

impl ChapterInfo {
    /// Creates a TOC entry.
    #[must_use]
    pub fn new(title: impl Into<String>, url: impl Into<String>, order: u32) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            order,
        }
    }
}

/// A fetched chapter with its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub title: String,
    pub url: String,
    /// Plain text, paragraphs separated by `\n`.
    pub content: String,
    /// Dense 1-based ordinal after the orchestrator has sorted the set.
    pub order: u32,
}

impl Chapter {
    /// Builds a chapter from its TOC entry and extracted body.
    #[must_use]
    pub fn from_info(info: &ChapterInfo, content: String) -> Self {
        Self {
            title: info.title.clone(),
            url: info.url.clone(),
            content,
            order: info.order,
        }
    }

    /// Number of characters in the body.
    #[must_use]
    pub fn content_chars(&self) -> usize {
        self.content.chars().count()
    }
}
