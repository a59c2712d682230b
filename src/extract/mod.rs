//! Rule-driven extractors with strategy fallback.
//!
//! Each operation fetches its page once through the guarded fetch path and
//! then walks an ordered chain of strategies over the parsed document:
//!
//! 1. the rule's own selectors,
//! 2. built-in selector sets common across sites,
//! 3. structural patterns (chapter-title anchors, `<p>` harvesting, meta
//!    tags),
//! 4. for chapters only, the largest paragraph block.
//!
//! The first candidate the [`ContentValidator`] accepts wins. When every
//! strategy fails, [`ExtractError::Failed`] lists what each one did.
//!
//! Parsing is synchronous: `scraper::Html` is not `Send`, so documents are
//! parsed and dropped between awaits.

mod builtin;
pub mod chapter;
pub mod detail;
mod error;
pub mod search;
mod strategy;
pub mod text;
pub mod toc;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use url::Url;

pub use error::{AttemptOutcome, ExtractError, StrategyAttempt, StrategyKind};
pub use strategy::{PageContext, StrategyFn, run_chain};

use crate::breaker::Guard;
use crate::fetch::{FetchClient, FetchError, FetchRequest, FetchResponse};
use crate::model::{BookDetail, Chapter, ChapterInfo, SearchResult};
use crate::rule::{HttpMethod, Operation, SourceRule};
use crate::validate::ContentValidator;

/// Runs the four extraction operations against any source rule.
///
/// Cheap to clone; the fetch client and guard are shared.
#[derive(Debug, Clone)]
pub struct Extractor {
    client: Arc<FetchClient>,
    guard: Arc<Guard>,
    validator: ContentValidator,
}

impl Extractor {
    #[must_use]
    pub fn new(client: Arc<FetchClient>, guard: Arc<Guard>, validator: ContentValidator) -> Self {
        Self {
            client,
            guard,
            validator,
        }
    }

    #[must_use]
    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    #[must_use]
    pub fn validator(&self) -> &ContentValidator {
        &self.validator
    }

    /// Searches one source.
    ///
    /// # Errors
    ///
    /// [`ExtractError::MissingRule`] when the source has no search rule,
    /// [`ExtractError::Fetch`] when the page cannot be fetched and
    /// [`ExtractError::Failed`] when no strategy finds a result.
    #[instrument(skip(self, rule), fields(source_id = %rule.id))]
    pub async fn search(
        &self,
        rule: &SourceRule,
        keyword: &str,
        page: u32,
    ) -> Result<Vec<SearchResult>, ExtractError> {
        let search_rule = rule
            .search
            .as_ref()
            .ok_or_else(|| ExtractError::missing_rule(&rule.id, Operation::Search))?;
        let request = search::build_request(rule, search_rule, keyword, page)
            .ok_or_else(|| FetchError::invalid_url(&search_rule.url_template))?;
        let fetch_request = match request.method {
            HttpMethod::Get => FetchRequest::get(&request.url, Duration::ZERO),
            HttpMethod::Post => FetchRequest::post(
                &request.url,
                request.body.unwrap_or_default(),
                Duration::ZERO,
            ),
        };

        let response = self.fetch_page(rule, Operation::Search, fetch_request).await?;
        let page_url = page_url(rule, &response);
        let results = search::parse_search(&self.context(rule, &page_url), &response.body)
            .map_err(|attempts| ExtractError::failed(Operation::Search, &request.url, attempts))?;
        debug!(count = results.len(), "search results extracted");
        Ok(results)
    }

    /// Reads a book's detail page.
    ///
    /// # Errors
    ///
    /// [`ExtractError::Fetch`] or [`ExtractError::Failed`].
    #[instrument(skip(self, rule), fields(source_id = %rule.id))]
    pub async fn detail(&self, rule: &SourceRule, url: &str) -> Result<BookDetail, ExtractError> {
        let response = self
            .fetch_page(rule, Operation::Detail, FetchRequest::get(url, Duration::ZERO))
            .await?;
        let page_url = page_url(rule, &response);
        detail::parse_detail(&self.context(rule, &page_url), &response.body)
            .map_err(|attempts| ExtractError::failed(Operation::Detail, url, attempts))
    }

    /// Reads a full table of contents, following pagination when the rule
    /// declares it.
    ///
    /// Pages after the first that fail are logged and end pagination; the
    /// entries gathered so far are kept.
    ///
    /// # Errors
    ///
    /// [`ExtractError::Fetch`] or [`ExtractError::Failed`] for the first page.
    #[instrument(skip(self, rule), fields(source_id = %rule.id))]
    pub async fn toc(&self, rule: &SourceRule, url: &str) -> Result<Vec<ChapterInfo>, ExtractError> {
        let mut entries = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(url.to_string());
        let mut pages = 0;

        while let Some(page) = next.take() {
            if pages >= rule.toc.max_pages || !visited.insert(page.clone()) {
                debug!(pages, "toc pagination stopped");
                break;
            }
            let first = pages == 0;
            pages += 1;

            let request = FetchRequest::get(&page, Duration::ZERO);
            let response = match self.fetch_page(rule, Operation::Toc, request).await {
                Ok(response) => response,
                Err(error) if first => return Err(error.into()),
                Err(error) => {
                    warn!(url = %page, error = %error, "toc page failed, keeping earlier pages");
                    break;
                }
            };
            let page_url = page_url(rule, &response);
            match toc::parse_toc_page(&self.context(rule, &page_url), &response.body) {
                Ok(parsed) => {
                    entries.extend(parsed.entries);
                    next = parsed.next_page;
                }
                Err(attempts) if first => {
                    return Err(ExtractError::failed(Operation::Toc, url, attempts));
                }
                Err(_) => {
                    warn!(url = %page, "toc page had no entries, keeping earlier pages");
                }
            }
        }

        let entries = toc::finalize(entries, rule.toc.trim_latest_section);
        info!(chapters = entries.len(), pages, "toc extracted");
        Ok(entries)
    }

    /// Reads one chapter, following its continuation pages.
    ///
    /// When `info.title` is empty the page heading is used.
    ///
    /// # Errors
    ///
    /// [`ExtractError::Fetch`] or [`ExtractError::Failed`] for the first page.
    #[instrument(skip(self, rule, info), fields(source_id = %rule.id, url = %info.url))]
    pub async fn chapter(&self, rule: &SourceRule, info: &ChapterInfo) -> Result<Chapter, ExtractError> {
        let mut parts: Vec<String> = Vec::new();
        let mut visited = HashSet::new();
        let mut heading = None;
        let mut next = Some(info.url.clone());

        while let Some(page) = next.take() {
            if parts.len() >= rule.chapter.max_pages as usize || !visited.insert(page.clone()) {
                break;
            }
            let first = parts.is_empty();
            let request = FetchRequest::get(&page, Duration::ZERO);
            let response = match self.fetch_page(rule, Operation::Chapter, request).await {
                Ok(response) => response,
                Err(error) if first => return Err(error.into()),
                Err(error) => {
                    warn!(url = %page, error = %error, "chapter continuation failed");
                    break;
                }
            };
            let page_url = page_url(rule, &response);
            match chapter::parse_chapter_page(&self.context(rule, &page_url), &response.body, first) {
                Ok(parsed) => {
                    if first {
                        heading = parsed.title;
                    }
                    parts.push(parsed.content);
                    next = parsed.next_page;
                }
                Err(attempts) if first => {
                    return Err(ExtractError::failed(Operation::Chapter, &info.url, attempts));
                }
                Err(_) => break,
            }
        }

        let mut chapter = Chapter::from_info(info, parts.join("\n"));
        if chapter.title.is_empty() {
            chapter.title = heading.unwrap_or_default();
        }
        debug!(pages = parts.len(), chars = chapter.content_chars(), "chapter extracted");
        Ok(chapter)
    }

    fn context<'a>(&'a self, rule: &'a SourceRule, page_url: &'a Url) -> PageContext<'a> {
        PageContext {
            rule,
            page_url,
            validator: &self.validator,
        }
    }

    /// Fetches through the guard for `<source>:<operation>`, with the rule's
    /// headers and its base URL as referer.
    async fn fetch_page(
        &self,
        rule: &SourceRule,
        operation: Operation,
        request: FetchRequest,
    ) -> Result<FetchResponse, FetchError> {
        let mut request = request
            .with_headers(rule.headers.clone())
            .with_referer(Some(rule.base_url.to_string()));
        let client = &self.client;
        self.guard
            .run(
                &rule.operation_key(operation),
                rule.timeouts.for_operation(operation),
                move |timeout| {
                    request.timeout = timeout;
                    async move { client.fetch(&request).await }
                },
            )
            .await
    }
}

/// Final URL of a response, or the source's base URL if it does not parse.
fn page_url(rule: &SourceRule, response: &FetchResponse) -> Url {
    Url::parse(&response.url).unwrap_or_else(|_| rule.base_url.clone())
}
