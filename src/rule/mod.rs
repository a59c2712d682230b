//! Per-source extraction rules.
//!
//! A [`SourceRule`] describes how to find search results, book metadata, the
//! table of contents and chapter bodies on one site. Rules are built once from
//! [`RuleRecord`]s at startup: selectors are parsed, regexes compiled and
//! defaults resolved, so a loaded rule never needs re-validation.
//!
//! # Example
//!
//! ```
//! use harvester_core::rule::RuleRegistry;
//!
//! let registry = RuleRegistry::from_json_str(r##"[{
//!     "id": "demo",
//!     "name": "Demo",
//!     "url": "https://demo.example",
//!     "toc": {"listSelector": ".c li a"},
//!     "chapter": {"contentSelectors": ["#content"]}
//! }]"##).unwrap();
//!
//! assert!(registry.get("demo").is_some());
//! ```

mod error;
mod record;
mod selector;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use encoding_rs::Encoding;
use regex::Regex;
use reqwest::header::{HeaderName, HeaderValue};
use tracing::{debug, info, instrument};
use url::Url;

pub use error::RuleError;
pub use record::{
    BookRecord, ChapterRecord, RuleRecord, SearchRecord, SelectorSpec, TimeoutRecord, TocRecord,
};
pub use selector::{FieldSelector, SelectorList, Target, collapse_whitespace, read_target};

/// Default timeouts per operation.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_DETAIL_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_TOC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CHAPTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default page caps for paginated TOCs and multi-page chapters.
const DEFAULT_TOC_MAX_PAGES: u32 = 20;
const DEFAULT_CHAPTER_MAX_PAGES: u32 = 5;

/// Minimum chapter length (characters) accepted when a rule does not say.
pub const DEFAULT_MIN_CONTENT_LENGTH: usize = 100;

/// The four extraction operations a rule covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Search,
    Detail,
    Toc,
    Chapter,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Detail => "detail",
            Self::Toc => "toc",
            Self::Chapter => "chapter",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method of a search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Fields read from one search result item.
#[derive(Debug, Clone)]
pub struct SearchFields {
    pub title: Option<SelectorList>,
    pub url: Option<SelectorList>,
    pub author: Option<SelectorList>,
    pub intro: Option<SelectorList>,
    pub category: Option<SelectorList>,
    pub latest_chapter: Option<SelectorList>,
    pub word_count: Option<SelectorList>,
    pub update_time: Option<SelectorList>,
    pub cover: Option<SelectorList>,
}

#[derive(Debug, Clone)]
pub struct SearchRule {
    pub url_template: String,
    pub method: HttpMethod,
    pub body_template: Option<String>,
    /// Encoding used for the keyword; UTF-8 when `None`.
    pub charset: Option<&'static Encoding>,
    pub list: Option<SelectorList>,
    pub fields: SearchFields,
}

#[derive(Debug, Clone)]
pub struct DetailRule {
    pub title: Option<SelectorList>,
    pub author: Option<SelectorList>,
    pub intro: Option<SelectorList>,
    pub category: Option<SelectorList>,
    pub cover: Option<SelectorList>,
    pub status: Option<SelectorList>,
    pub word_count: Option<SelectorList>,
    pub update_time: Option<SelectorList>,
    pub latest_chapter: Option<SelectorList>,
    pub toc_url: Option<SelectorList>,
}

#[derive(Debug, Clone)]
pub struct TocRule {
    pub list: Option<SelectorList>,
    pub title: Option<SelectorList>,
    pub url: Option<SelectorList>,
    pub has_pages: bool,
    pub next_page: Option<SelectorList>,
    pub max_pages: u32,
    /// Drop a leading "latest chapters" block whose links repeat later.
    pub trim_latest_section: bool,
}

#[derive(Debug, Clone)]
pub struct ChapterRule {
    pub content: Option<SelectorList>,
    pub remove: Option<SelectorList>,
    pub next_page: Option<SelectorList>,
    pub max_pages: u32,
    pub ad_patterns: Vec<Regex>,
    pub min_content_length: usize,
}

/// Hard per-operation timeouts, used until the adaptive timeout has history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub search: Duration,
    pub detail: Duration,
    pub toc: Duration,
    pub chapter: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            search: DEFAULT_SEARCH_TIMEOUT,
            detail: DEFAULT_DETAIL_TIMEOUT,
            toc: DEFAULT_TOC_TIMEOUT,
            chapter: DEFAULT_CHAPTER_TIMEOUT,
        }
    }
}

impl OperationTimeouts {
    #[must_use]
    pub fn for_operation(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Search => self.search,
            Operation::Detail => self.detail,
            Operation::Toc => self.toc,
            Operation::Chapter => self.chapter,
        }
    }
}

/// Immutable extraction rule for one source.
#[derive(Debug, Clone)]
pub struct SourceRule {
    pub id: String,
    pub name: String,
    pub base_url: Url,
    pub enabled: bool,
    pub kind: String,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub search: Option<SearchRule>,
    pub detail: DetailRule,
    pub toc: TocRule,
    pub chapter: ChapterRule,
    pub timeouts: OperationTimeouts,
}

impl SourceRule {
    /// Builds a typed rule from its configuration record.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] for unparseable selectors, patterns, headers or
    /// base URL.
    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        let id = record.id.trim().to_string();
        if id.is_empty() {
            return Err(RuleError::invalid_value(&record.name, "id", "must not be empty"));
        }

        let base_url = Url::parse(record.url.trim())
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .ok_or_else(|| RuleError::InvalidUrl {
                source_id: id.clone(),
                url: record.url.clone(),
            })?;

        let mut headers = Vec::with_capacity(record.headers.len());
        for (name, value) in &record.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes());
            let header_value = HeaderValue::from_str(value);
            match (header_name, header_value) {
                (Ok(n), Ok(v)) => headers.push((n, v)),
                _ => {
                    return Err(RuleError::InvalidHeader {
                        source_id: id.clone(),
                        name: name.clone(),
                    });
                }
            }
        }

        let search = record
            .search
            .as_ref()
            .map(|search| build_search(&id, search))
            .transpose()?;

        let book = &record.book;
        let detail = DetailRule {
            title: optional_list(&id, "book.titleSelector", book.title_selector.as_ref())?,
            author: optional_list(&id, "book.authorSelector", book.author_selector.as_ref())?,
            intro: optional_list(&id, "book.introSelector", book.intro_selector.as_ref())?,
            category: optional_list(&id, "book.categorySelector", book.category_selector.as_ref())?,
            cover: optional_list(&id, "book.coverSelector", book.cover_selector.as_ref())?,
            status: optional_list(&id, "book.statusSelector", book.status_selector.as_ref())?,
            word_count: optional_list(&id, "book.wordCountSelector", book.word_count_selector.as_ref())?,
            update_time: optional_list(
                &id,
                "book.updateTimeSelector",
                book.update_time_selector.as_ref(),
            )?,
            latest_chapter: optional_list(
                &id,
                "book.latestChapterSelector",
                book.latest_chapter_selector.as_ref(),
            )?,
            toc_url: optional_list(&id, "book.tocUrlSelector", book.toc_url_selector.as_ref())?,
        };

        let toc_record = &record.toc;
        let toc = TocRule {
            list: optional_list(&id, "toc.listSelector", toc_record.list_selector.as_ref())?,
            title: optional_list(&id, "toc.titleSelector", toc_record.title_selector.as_ref())?,
            url: optional_list(&id, "toc.urlSelector", toc_record.url_selector.as_ref())?,
            has_pages: toc_record.has_pages,
            next_page: optional_list(&id, "toc.paginationRule", toc_record.pagination_rule.as_ref())?,
            max_pages: toc_record.max_pages.unwrap_or(DEFAULT_TOC_MAX_PAGES).max(1),
            trim_latest_section: toc_record.trim_latest_section,
        };
        if toc.has_pages && toc.next_page.is_none() {
            return Err(RuleError::invalid_value(
                &id,
                "toc.paginationRule",
                "required when hasPages is true",
            ));
        }

        let chapter_record = &record.chapter;
        let ad_patterns = chapter_record
            .ad_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
                    source_id: id.clone(),
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let chapter = ChapterRule {
            content: list_from_parts(&id, "chapter.contentSelectors", &chapter_record.content_selectors)?,
            remove: list_from_parts(&id, "chapter.removeSelectors", &chapter_record.remove_selectors)?,
            next_page: optional_list(
                &id,
                "chapter.nextPageSelector",
                chapter_record.next_page_selector.as_ref(),
            )?,
            max_pages: chapter_record.max_pages.unwrap_or(DEFAULT_CHAPTER_MAX_PAGES).max(1),
            ad_patterns,
            min_content_length: chapter_record
                .min_content_length
                .unwrap_or(DEFAULT_MIN_CONTENT_LENGTH),
        };

        let defaults = OperationTimeouts::default();
        let timeouts = OperationTimeouts {
            search: secs_or(record.timeouts.search, defaults.search),
            detail: secs_or(record.timeouts.detail, defaults.detail),
            toc: secs_or(record.timeouts.toc, defaults.toc),
            chapter: secs_or(record.timeouts.chapter, defaults.chapter),
        };

        Ok(Self {
            id,
            name: record.name.clone(),
            base_url,
            enabled: record.enabled,
            kind: record.kind.clone().unwrap_or_else(|| "novel".to_string()),
            headers,
            search,
            detail,
            toc,
            chapter,
            timeouts,
        })
    }

    /// Breaker/timeout key for an operation on this source.
    #[must_use]
    pub fn operation_key(&self, operation: Operation) -> String {
        format!("{}:{}", self.id, operation.as_str())
    }

    /// Resolves a possibly relative link against `page` (or the base URL).
    #[must_use]
    pub fn resolve_url(&self, href: &str, page: Option<&Url>) -> Option<String> {
        resolve_link(page.unwrap_or(&self.base_url), href)
    }
}

/// Resolves `href` against `base`, dropping links that cannot be followed.
#[must_use]
pub fn resolve_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("mailto:") {
        return None;
    }
    let resolved = base.join(href).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn build_search(id: &str, record: &SearchRecord) -> Result<SearchRule, RuleError> {
    if !record.url.contains("{keyword}") && record.request_body_template.is_none() {
        return Err(RuleError::invalid_value(
            id,
            "search.url",
            "needs a {keyword} placeholder or a requestBodyTemplate",
        ));
    }
    let method = match record.method.as_deref().map(str::to_ascii_uppercase).as_deref() {
        None | Some("GET") => HttpMethod::Get,
        Some("POST") => HttpMethod::Post,
        Some(other) => {
            return Err(RuleError::invalid_value(
                id,
                "search.method",
                format!("unsupported method '{other}'"),
            ));
        }
    };
    let charset = match record.charset.as_deref() {
        None => None,
        Some(label) => Some(Encoding::for_label(label.as_bytes()).ok_or_else(|| {
            RuleError::invalid_value(id, "search.charset", format!("unknown charset '{label}'"))
        })?),
    };
    Ok(SearchRule {
        url_template: record.url.clone(),
        method,
        body_template: record.request_body_template.clone(),
        charset,
        list: optional_list(id, "search.listSelector", record.list_selector.as_ref())?,
        fields: SearchFields {
            title: optional_list(id, "search.titleSelector", record.title_selector.as_ref())?,
            url: optional_list(id, "search.urlSelector", record.url_selector.as_ref())?,
            author: optional_list(id, "search.authorSelector", record.author_selector.as_ref())?,
            intro: optional_list(id, "search.introSelector", record.intro_selector.as_ref())?,
            category: optional_list(id, "search.categorySelector", record.category_selector.as_ref())?,
            latest_chapter: optional_list(
                id,
                "search.latestChapterSelector",
                record.latest_chapter_selector.as_ref(),
            )?,
            word_count: optional_list(
                id,
                "search.wordCountSelector",
                record.word_count_selector.as_ref(),
            )?,
            update_time: optional_list(
                id,
                "search.updateTimeSelector",
                record.update_time_selector.as_ref(),
            )?,
            cover: optional_list(id, "search.coverSelector", record.cover_selector.as_ref())?,
        },
    })
}

fn optional_list(
    id: &str,
    field: &str,
    spec: Option<&SelectorSpec>,
) -> Result<Option<SelectorList>, RuleError> {
    match spec {
        None => Ok(None),
        Some(spec) if spec.is_blank() => Ok(None),
        Some(spec) => list_from_parts(id, field, &spec.parts()),
    }
}

fn list_from_parts(id: &str, field: &str, parts: &[String]) -> Result<Option<SelectorList>, RuleError> {
    if parts.iter().all(|part| part.trim().is_empty()) {
        return Ok(None);
    }
    SelectorList::from_parts(parts)
        .map(Some)
        .map_err(|(selector, reason)| RuleError::invalid_selector(id, field, selector, reason))
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.filter(|secs| *secs > 0).map_or(default, Duration::from_secs)
}

/// All configured sources, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<String, Arc<SourceRule>>,
}

impl RuleRegistry {
    /// Builds a registry, failing on the first malformed record.
    ///
    /// # Errors
    ///
    /// Returns the first [`RuleError`] encountered, or
    /// [`RuleError::DuplicateId`] when two records share an id.
    #[instrument(skip(records), fields(count = records.len()))]
    pub fn from_records(records: &[RuleRecord]) -> Result<Self, RuleError> {
        let mut rules = BTreeMap::new();
        for record in records {
            let rule = SourceRule::from_record(record)?;
            debug!(source_id = %rule.id, enabled = rule.enabled, "loaded source rule");
            if rules.contains_key(&rule.id) {
                return Err(RuleError::DuplicateId(rule.id));
            }
            rules.insert(rule.id.clone(), Arc::new(rule));
        }
        Ok(Self { rules })
    }

    /// Parses a JSON array of rule records.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Parse`] for invalid JSON, otherwise as
    /// [`Self::from_records`].
    pub fn from_json_str(raw: &str) -> Result<Self, RuleError> {
        let records: Vec<RuleRecord> =
            serde_json::from_str(raw).map_err(|source| RuleError::Parse { source })?;
        Self::from_records(&records)
    }

    /// Loads rules from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Io`] when the file cannot be read, otherwise as
    /// [`Self::from_json_str`].
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json_str(&raw)?;
        info!(
            path = %path.display(),
            sources = registry.len(),
            enabled = registry.enabled().count(),
            "source rules loaded"
        );
        Ok(registry)
    }

    /// Looks up an enabled source.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<SourceRule>> {
        self.rules.get(id).filter(|rule| rule.enabled).cloned()
    }

    /// Enabled sources in id order.
    pub fn enabled(&self) -> impl Iterator<Item = &Arc<SourceRule>> {
        self.rules.values().filter(|rule| rule.enabled)
    }

    /// All sources, enabled or not.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SourceRule>> {
        self.rules.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(id: &str) -> RuleRecord {
        RuleRecord {
            id: id.to_string(),
            name: id.to_uppercase(),
            url: format!("https://{id}.example"),
            enabled: true,
            ..RuleRecord::default()
        }
    }

    #[test]
    fn test_from_record_resolves_defaults() {
        let rule = SourceRule::from_record(&record("a")).unwrap();
        assert_eq!(rule.timeouts, OperationTimeouts::default());
        assert_eq!(rule.kind, "novel");
        assert_eq!(rule.toc.max_pages, DEFAULT_TOC_MAX_PAGES);
        assert_eq!(rule.chapter.min_content_length, DEFAULT_MIN_CONTENT_LENGTH);
        assert!(rule.search.is_none());
    }

    #[test]
    fn test_from_record_rejects_relative_base_url() {
        let mut rec = record("a");
        rec.url = "/relative".to_string();
        assert!(matches!(
            SourceRule::from_record(&rec),
            Err(RuleError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_from_record_rejects_bad_selector() {
        let mut rec = record("a");
        rec.toc.list_selector = Some(SelectorSpec::from("li[[a"));
        let err = SourceRule::from_record(&rec).unwrap_err();
        assert!(err.to_string().contains("toc.listSelector"), "{err}");
    }

    #[test]
    fn test_from_record_rejects_bad_ad_pattern() {
        let mut rec = record("a");
        rec.chapter.ad_patterns = vec!["(unclosed".to_string()];
        assert!(matches!(
            SourceRule::from_record(&rec),
            Err(RuleError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_from_record_requires_pagination_rule_with_pages() {
        let mut rec = record("a");
        rec.toc.has_pages = true;
        assert!(matches!(
            SourceRule::from_record(&rec),
            Err(RuleError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_search_rule_requires_keyword_placeholder() {
        let mut rec = record("a");
        rec.search = Some(SearchRecord {
            url: "https://a.example/search".to_string(),
            ..SearchRecord::default()
        });
        assert!(SourceRule::from_record(&rec).is_err());
    }

    #[test]
    fn test_search_rule_parses_gbk_charset_and_post() {
        let mut rec = record("a");
        rec.search = Some(SearchRecord {
            url: "https://a.example/modules/search.php".to_string(),
            method: Some("post".to_string()),
            request_body_template: Some("searchkey={keyword}".to_string()),
            charset: Some("gbk".to_string()),
            ..SearchRecord::default()
        });
        let rule = SourceRule::from_record(&rec).unwrap();
        let search = rule.search.unwrap();
        assert_eq!(search.method, HttpMethod::Post);
        assert_eq!(search.charset.unwrap().name(), "GBK");
    }

    #[test]
    fn test_chapter_content_selectors_flatten_into_alternatives() {
        let mut rec = record("a");
        rec.chapter.content_selectors = vec!["#content, #booktxt".to_string(), ".txt".to_string()];
        let rule = SourceRule::from_record(&rec).unwrap();
        assert_eq!(rule.chapter.content.unwrap().alternatives().len(), 3);
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let err = RuleRegistry::from_records(&[record("a"), record("a")]).unwrap_err();
        assert!(matches!(err, RuleError::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn test_registry_hides_disabled_sources() {
        let mut disabled = record("b");
        disabled.enabled = false;
        let registry = RuleRegistry::from_records(&[record("a"), disabled]).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("b").is_none());
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn test_registry_from_json_reports_parse_errors() {
        assert!(matches!(
            RuleRegistry::from_json_str("{not json"),
            Err(RuleError::Parse { .. })
        ));
    }

    #[test]
    fn test_resolve_link_variants() {
        let base = Url::parse("https://a.example/book/1/").unwrap();
        assert_eq!(
            resolve_link(&base, "/book/1/2.html").as_deref(),
            Some("https://a.example/book/1/2.html")
        );
        assert_eq!(
            resolve_link(&base, "3.html").as_deref(),
            Some("https://a.example/book/1/3.html")
        );
        assert_eq!(resolve_link(&base, "javascript:void(0)"), None);
        assert_eq!(resolve_link(&base, "#top"), None);
    }
}
