//! The [`Harvester`] facade.
//!
//! Builds and owns every service object (fetch client, guard, extractor,
//! cache, progress tracker, sink) and exposes the public operations:
//! search, detail, table of contents, chapter, and background downloads
//! with progress queries. No state is global; two harvesters in one
//! process share nothing.

mod config;
mod error;
mod search;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub use config::{DEFAULT_MAX_SEARCH_RESULTS, HarvesterConfig};
pub use error::ServiceError;
pub use search::{merge_results, relevance};

use crate::breaker::Guard;
use crate::cache::{CacheKey, CacheManager};
use crate::download::{ChapterSource, DownloadOptions, DownloadOrchestrator, DownloadOutcome, ProgressHandle};
use crate::extract::{ExtractError, Extractor, toc};
use crate::fetch::FetchClient;
use crate::model::{BookDetail, Chapter, ChapterInfo, SearchResult};
use crate::progress::{FileStatus, ProgressSnapshot, ProgressTracker, TaskId, Transition};
use crate::rule::{RuleRegistry, SourceRule};
use crate::sink::{DocumentFormat, DocumentSink, SinkError};
use crate::validate::ContentValidator;

/// Listing entry for a configured source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
    pub searchable: bool,
}

/// Entry point to the pipeline. Cheap to clone; clones share all state.
///
/// Must be created inside a tokio runtime: the cache and progress sweep
/// workers start immediately. Call [`Harvester::shutdown`] to stop them.
#[derive(Clone)]
pub struct Harvester {
    config: Arc<HarvesterConfig>,
    rules: Arc<RuleRegistry>,
    client: Arc<FetchClient>,
    extractor: Extractor,
    cache: Arc<CacheManager>,
    tracker: Arc<ProgressTracker>,
    sink: Arc<dyn DocumentSink>,
    downloads: Arc<DashMap<TaskId, JoinHandle<()>>>,
}

impl fmt::Debug for Harvester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harvester")
            .field("sources", &self.rules.len())
            .field("tasks", &self.tracker.len())
            .field("downloads", &self.downloads.len())
            .finish_non_exhaustive()
    }
}

impl Harvester {
    /// Builds the pipeline from `config` and starts its sweep workers.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidConfig`] when `config` fails validation.
    pub fn new(
        config: HarvesterConfig,
        rules: RuleRegistry,
        sink: Arc<dyn DocumentSink>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let client = Arc::new(FetchClient::new(config.fetch.clone()));
        let guard = Arc::new(Guard::new(config.breaker, config.timeouts));
        let validator = ContentValidator::new(config.max_ad_ratio, config.min_paragraphs);
        let extractor = Extractor::new(Arc::clone(&client), guard, validator);
        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        let tracker = Arc::new(ProgressTracker::new(config.tracker));
        cache.start_sweeper();
        tracker.start_sweeper();

        info!(
            sources = rules.len(),
            enabled = rules.enabled().count(),
            cache = cache.is_enabled(),
            "harvester ready"
        );
        Ok(Self {
            config: Arc::new(config),
            rules: Arc::new(rules),
            client,
            extractor,
            cache,
            tracker,
            sink,
            downloads: Arc::new(DashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    #[must_use]
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    #[must_use]
    pub fn guard(&self) -> &Guard {
        self.extractor.guard()
    }

    #[must_use]
    pub fn sources(&self) -> Vec<SourceSummary> {
        self.rules
            .iter()
            .map(|rule| SourceSummary {
                id: rule.id.clone(),
                name: rule.name.clone(),
                base_url: rule.base_url.to_string(),
                enabled: rule.enabled,
                searchable: rule.search.is_some(),
            })
            .collect()
    }

    /// Searches every enabled source concurrently.
    ///
    /// A failing source is logged and contributes nothing. Results are
    /// de-duplicated by (title, author), ranked by similarity to `keyword`
    /// and capped at `max_results` (itself capped by the configuration).
    #[instrument(skip(self))]
    pub async fn search(&self, keyword: &str, max_results: usize) -> Vec<SearchResult> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Vec::new();
        }
        let searches = self
            .rules
            .enabled()
            .filter(|rule| rule.search.is_some())
            .map(|rule| self.search_source(rule, keyword));
        let batches = join_all(searches).await;
        let limit = max_results.clamp(1, self.config.max_search_results);
        let results = merge_results(batches, keyword, limit);
        info!(results = results.len(), "search finished");
        results
    }

    async fn search_source(&self, rule: &SourceRule, keyword: &str) -> Vec<SearchResult> {
        let key = CacheKey::search(&rule.id, keyword);
        if let Some(results) = self.cache.get::<Vec<SearchResult>>(&key).await {
            return results;
        }
        match self.extractor.search(rule, keyword, 1).await {
            Ok(results) => {
                self.store(&key, &results).await;
                results
            }
            Err(error) => {
                warn!(source_id = %rule.id, error = %error, "source search failed");
                Vec::new()
            }
        }
    }

    /// Book metadata from its detail page.
    ///
    /// # Errors
    ///
    /// [`ExtractError::UnknownSource`] or any extraction failure.
    #[instrument(skip(self))]
    pub async fn get_detail(&self, url: &str, source_id: &str) -> Result<BookDetail, ServiceError> {
        let rule = self.rule(source_id)?;
        let key = CacheKey::book(&rule.id, url);
        if let Some(detail) = self.cache.get(&key).await {
            return Ok(detail);
        }
        let detail = self.extractor.detail(&rule, url).await?;
        self.store(&key, &detail).await;
        Ok(detail)
    }

    /// Table of contents, optionally sliced to chapters `start..=end`
    /// (1-based).
    ///
    /// # Errors
    ///
    /// [`ExtractError::UnknownSource`] or any extraction failure.
    #[instrument(skip(self))]
    pub async fn get_toc(
        &self,
        url: &str,
        source_id: &str,
        start: Option<u32>,
        end: Option<u32>,
    ) -> Result<Vec<ChapterInfo>, ServiceError> {
        let rule = self.rule(source_id)?;
        let entries = self.full_toc(&rule, url).await?;
        Ok(toc::slice(&entries, start, end))
    }

    async fn full_toc(&self, rule: &SourceRule, url: &str) -> Result<Vec<ChapterInfo>, ExtractError> {
        let key = CacheKey::toc(&rule.id, url);
        if let Some(entries) = self.cache.get::<Vec<ChapterInfo>>(&key).await
            && !entries.is_empty()
        {
            return Ok(entries);
        }
        let entries = self.extractor.toc(rule, url).await?;
        if !entries.is_empty() {
            self.store(&key, &entries).await;
        }
        Ok(entries)
    }

    /// One chapter by URL; the title comes from the page heading.
    ///
    /// # Errors
    ///
    /// [`ExtractError::UnknownSource`] or any extraction failure.
    #[instrument(skip(self))]
    pub async fn get_chapter(&self, url: &str, source_id: &str) -> Result<Chapter, ServiceError> {
        let rule = self.rule(source_id)?;
        let source = CachedChapters {
            rule,
            extractor: self.extractor.clone(),
            cache: Arc::clone(&self.cache),
        };
        Ok(source.fetch_chapter(&ChapterInfo::new("", url, 1)).await?)
    }

    /// Starts a background download and returns its task id at once.
    ///
    /// `options` defaults to the configured download options. An unknown
    /// source or unsupported format fails the task immediately; the id is
    /// still returned so the failure can be queried like any other.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidConfig`] when `options` are invalid.
    #[instrument(skip(self, options))]
    pub fn start_download(
        &self,
        url: &str,
        source_id: &str,
        format: DocumentFormat,
        options: Option<DownloadOptions>,
    ) -> Result<TaskId, ServiceError> {
        let options = options.unwrap_or_else(|| self.config.download.clone());
        config::validate_download(&options)?;

        self.downloads.retain(|_, handle| !handle.is_finished());
        let task_id = self.tracker.create(0);

        let rule = match self.rule(source_id) {
            Ok(rule) => rule,
            Err(error) => {
                self.fail(&task_id, &error.to_string());
                return Ok(task_id);
            }
        };
        if !self.sink.supports(format) {
            self.fail(&task_id, &SinkError::UnsupportedFormat(format.to_string()).to_string());
            return Ok(task_id);
        }

        let job = DownloadJob {
            harvester: self.clone(),
            task_id: task_id.clone(),
            rule,
            url: url.to_string(),
            format,
            options,
        };
        let handle = tokio::spawn(job.run());
        self.downloads.insert(task_id.clone(), handle);
        info!(task_id = %task_id, "download started");
        Ok(task_id)
    }

    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`](crate::progress::ProgressError) for
    /// an unknown or evicted task.
    pub fn get_progress(&self, task_id: &TaskId) -> Result<ProgressSnapshot, ServiceError> {
        Ok(self.tracker.snapshot(task_id)?)
    }

    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`](crate::progress::ProgressError) for
    /// an unknown or evicted task.
    pub fn get_downloaded_file_path(&self, task_id: &TaskId) -> Result<FileStatus, ServiceError> {
        Ok(self.tracker.file_status(task_id)?)
    }

    /// Cancels a download. It stops before its next batch; chapters in
    /// flight finish or time out on their own.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`](crate::progress::ProgressError) for
    /// an unknown task.
    pub fn cancel_download(&self, task_id: &TaskId) -> Result<Transition, ServiceError> {
        let transition = self.tracker.cancel(task_id)?;
        if transition == Transition::Applied {
            info!(task_id = %task_id, "download cancelled");
        }
        Ok(transition)
    }

    /// Cancels running downloads, stops the sweep workers and closes idle
    /// connections.
    pub async fn shutdown(&self) {
        let running: Vec<TaskId> = self.downloads.iter().map(|entry| entry.key().clone()).collect();
        for task_id in running {
            if let Some((_, handle)) = self.downloads.remove(&task_id) {
                let _ = self.tracker.cancel(&task_id);
                handle.abort();
            }
        }
        self.cache.shutdown().await;
        self.tracker.shutdown().await;
        self.client.close();
        info!("harvester stopped");
    }

    fn rule(&self, source_id: &str) -> Result<Arc<SourceRule>, ExtractError> {
        self.rules
            .get(source_id)
            .ok_or_else(|| ExtractError::UnknownSource(source_id.to_string()))
    }

    fn fail(&self, task_id: &TaskId, message: &str) {
        error!(task_id = %task_id, error = message, "download failed");
        if let Err(err) = self.tracker.complete(task_id, false, Some(message.to_string())) {
            debug!(task_id = %task_id, error = %err, "could not mark task failed");
        }
    }

    async fn store<T: Serialize + Sync>(&self, key: &CacheKey, value: &T) {
        if let Err(error) = self.cache.set(key, value, None).await {
            warn!(key = key.label(), error = %error, "cache write failed");
        }
    }
}

/// Chapter source backed by the chapter cache and the extractor.
struct CachedChapters {
    rule: Arc<SourceRule>,
    extractor: Extractor,
    cache: Arc<CacheManager>,
}

#[async_trait]
impl ChapterSource for CachedChapters {
    async fn fetch_chapter(&self, info: &ChapterInfo) -> Result<Chapter, ExtractError> {
        let key = CacheKey::chapter(&self.rule.id, &info.url);
        if let Some(cached) = self.cache.get::<Chapter>(&key).await {
            let mut chapter = Chapter::from_info(info, cached.content);
            if chapter.title.is_empty() {
                chapter.title = cached.title;
            }
            return Ok(chapter);
        }

        let chapter = self.extractor.chapter(&self.rule, info).await?;
        if !chapter.content.trim().is_empty()
            && let Err(error) = self.cache.set(&key, &chapter, None).await
        {
            warn!(key = key.label(), error = %error, "cache write failed");
        }
        Ok(chapter)
    }
}

/// One background download, from detail page to written document.
struct DownloadJob {
    harvester: Harvester,
    task_id: TaskId,
    rule: Arc<SourceRule>,
    url: String,
    format: DocumentFormat,
    options: DownloadOptions,
}

impl DownloadJob {
    #[instrument(skip_all, fields(task_id = %self.task_id, source_id = %self.rule.id))]
    async fn run(self) {
        let harvester = &self.harvester;
        let tracker = &harvester.tracker;
        if let Err(error) = tracker.start(&self.task_id) {
            debug!(error = %error, "task vanished before start");
            return;
        }

        let detail = self.detail().await;
        let entries = match harvester.full_toc(&self.rule, &detail.toc_url).await {
            Ok(entries) => toc::slice(&entries, self.options.start_chapter, self.options.end_chapter),
            Err(error) => {
                harvester.fail(&self.task_id, &format!("could not obtain table of contents: {error}"));
                return;
            }
        };
        if entries.is_empty() {
            harvester.fail(&self.task_id, "table of contents is empty");
            return;
        }
        let total = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        if let Err(error) = tracker.set_total(&self.task_id, total) {
            debug!(error = %error, "could not set task total");
        }

        let source = CachedChapters {
            rule: Arc::clone(&self.rule),
            extractor: harvester.extractor.clone(),
            cache: Arc::clone(&harvester.cache),
        };
        let progress = ProgressHandle::new(Arc::clone(&harvester.tracker), self.task_id.clone());
        let outcome = DownloadOrchestrator::new(self.options.clone())
            .download(&entries, &source, Some(&progress))
            .await;

        if outcome.cancelled || tracker.is_stopped(&self.task_id) {
            info!(chapters = outcome.chapters.len(), "download stopped, task already ended");
            return;
        }
        if !outcome.meets_quorum(self.options.quorum_ratio) {
            harvester.fail(&self.task_id, &shortfall_message(&outcome));
            return;
        }

        match harvester.sink.write(&detail, &outcome.chapters, self.format).await {
            Ok(path) => self.finish(path, &outcome).await,
            Err(error) => harvester.fail(&self.task_id, &format!("failed to write document: {error}")),
        }
    }

    /// Detail page, or a stand-in pointing at `url` when it cannot be read
    /// so that a bare TOC URL still downloads.
    async fn detail(&self) -> BookDetail {
        match self.harvester.get_detail(&self.url, &self.rule.id).await {
            Ok(detail) => detail,
            Err(error) => {
                warn!(url = %self.url, error = %error, "detail page unavailable, using the URL as TOC");
                BookDetail {
                    title: fallback_title(&self.url),
                    url: self.url.clone(),
                    author: None,
                    intro: None,
                    category: None,
                    cover_url: None,
                    status: None,
                    word_count: None,
                    update_time: None,
                    latest_chapter: None,
                    toc_url: self.url.clone(),
                    source_id: self.rule.id.clone(),
                }
            }
        }
    }

    /// Records the written file and completes the task. A task that ended
    /// while the document was being written keeps no file.
    async fn finish(&self, path: PathBuf, outcome: &DownloadOutcome) {
        let tracker = &self.harvester.tracker;
        match tracker.set_file_path(&self.task_id, path.clone()) {
            Ok(Transition::Applied) => {}
            Ok(Transition::Ignored) | Err(_) => {
                warn!(path = %path.display(), "task ended during write, removing document");
                if let Err(error) = tokio::fs::remove_file(&path).await {
                    debug!(error = %error, "could not remove orphaned document");
                }
                return;
            }
        }
        let message = (!outcome.failures.is_empty()).then(|| {
            format!(
                "partial download: {} of {} chapters failed",
                outcome.failures.len(),
                outcome.requested
            )
        });
        match tracker.complete(&self.task_id, true, message) {
            Ok(_) => info!(
                chapters = outcome.chapters.len(),
                failed = outcome.failures.len(),
                "download complete"
            ),
            Err(error) => debug!(error = %error, "could not complete task"),
        }
    }
}

fn shortfall_message(outcome: &DownloadOutcome) -> String {
    let mut message = format!(
        "obtained {} of {} chapters",
        outcome.chapters.len(),
        outcome.requested
    );
    if outcome.timed_out {
        message.push_str(" before the time limit");
    }
    if let Some(first) = outcome.failures.first() {
        message.push_str(&format!("; first error: {}", first.error));
    }
    message
}

fn fallback_title(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()).map(str::to_string))
                .or_else(|| parsed.host_str().map(str::to_string))
        })
        .unwrap_or_else(|| "book".to_string())
}
