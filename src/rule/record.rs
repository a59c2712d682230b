//! Raw rule configuration records as they appear in the rules file.
//!
//! Records are deserialized with `serde` and converted exactly once into the
//! typed [`super::SourceRule`]; nothing downstream looks at these structs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A selector field: either one string (possibly comma-separated) or an
/// array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectorSpec {
    One(String),
    Many(Vec<String>),
}

impl SelectorSpec {
    /// Flattens into the list of raw strings.
    #[must_use]
    pub fn parts(&self) -> Vec<String> {
        match self {
            Self::One(single) => vec![single.clone()],
            Self::Many(many) => many.clone(),
        }
    }

    /// Whether no alternative holds usable text.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.parts().iter().all(|part| part.trim().is_empty())
    }
}

impl From<&str> for SelectorSpec {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

/// One source as configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    pub id: String,
    pub name: String,
    /// Base URL of the site.
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub search: Option<SearchRecord>,
    #[serde(default)]
    pub book: BookRecord,
    #[serde(default)]
    pub toc: TocRecord,
    #[serde(default)]
    pub chapter: ChapterRecord,
    #[serde(default)]
    pub timeouts: TimeoutRecord,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    /// URL template with `{keyword}` and optional `{page}` placeholders.
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub request_body_template: Option<String>,
    /// Charset used to percent-encode the keyword (e.g. `gbk`).
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub list_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub title_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub url_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub author_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub intro_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub category_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub latest_chapter_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub word_count_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub update_time_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub cover_selector: Option<SelectorSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRecord {
    #[serde(default)]
    pub title_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub author_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub intro_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub category_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub cover_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub status_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub word_count_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub update_time_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub latest_chapter_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub toc_url_selector: Option<SelectorSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocRecord {
    #[serde(default)]
    pub list_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub title_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub url_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub has_pages: bool,
    /// Selector for the "next page" link of a paginated TOC.
    #[serde(default)]
    pub pagination_rule: Option<SelectorSpec>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub trim_latest_section: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRecord {
    #[serde(default)]
    pub content_selectors: Vec<String>,
    #[serde(default)]
    pub remove_selectors: Vec<String>,
    #[serde(default)]
    pub next_page_selector: Option<SelectorSpec>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub ad_patterns: Vec<String>,
    #[serde(default)]
    pub min_content_length: Option<usize>,
}

/// Per-operation timeouts in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutRecord {
    #[serde(default)]
    pub search: Option<u64>,
    #[serde(default)]
    pub detail: Option<u64>,
    #[serde(default)]
    pub toc: Option<u64>,
    #[serde(default)]
    pub chapter: Option<u64>,
}
