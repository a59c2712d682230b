//! Batch chapter download.
//!
//! The [`DownloadOrchestrator`] turns a table of contents into an ordered
//! set of chapters:
//!
//! 1. entries are fetched in concurrent batches of `batch_size`, with
//!    `batch_delay` between batches;
//! 2. each entry is retried with exponential backoff on retryable failures;
//! 3. failures get one more sequential attempt in a final pass;
//! 4. results are de-duplicated, sorted and numbered `1..=N`.
//!
//! Before every batch (and every final-pass attempt) a paused task is held
//! until it resumes, and a task that has ended for any reason stops the
//! download. The wall-clock ceiling is checked before every batch.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use harvester_core::download::{ChapterSource, DownloadOptions, DownloadOrchestrator};
//! use harvester_core::extract::ExtractError;
//! use harvester_core::model::{Chapter, ChapterInfo};
//!
//! struct Fixed;
//!
//! #[async_trait]
//! impl ChapterSource for Fixed {
//!     async fn fetch_chapter(&self, info: &ChapterInfo) -> Result<Chapter, ExtractError> {
//!         Ok(Chapter::from_info(info, "text ".repeat(40)))
//!     }
//! }
//!
//! # async fn example() {
//! let toc = vec![ChapterInfo::new("第1章", "https://example.com/1.html", 1)];
//! let outcome = DownloadOrchestrator::new(DownloadOptions::default())
//!     .download(&toc, &Fixed, None)
//!     .await;
//! assert_eq!(outcome.chapters.len(), 1);
//! # }
//! ```

mod order;
mod stats;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use order::{chapter_number, dedup, parse_chinese_numeral, sort_and_number};
pub use stats::{DownloadStats, StatsSummary};

use crate::extract::ExtractError;
use crate::fetch::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::model::{Chapter, ChapterInfo};
use crate::progress::{ProgressTracker, TaskId};
use crate::validate::text_length;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRY_TIMES: u32 = 3;
pub const DEFAULT_QUORUM_RATIO: f64 = 0.5;

const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MIN_CONTENT_LENGTH: usize = 50;
const DEFAULT_FINAL_PASS_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(2 * 60 * 60);
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Fetches one chapter. The service implements this over the chapter
/// extractor and cache; tests script it.
#[async_trait]
pub trait ChapterSource: Send + Sync {
    async fn fetch_chapter(&self, info: &ChapterInfo) -> Result<Chapter, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Entries fetched concurrently per batch.
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Retries after the first attempt, per chapter, in the main pass.
    pub retry_times: u32,
    pub retry_base_delay: Duration,
    /// Chapters shorter than this (non-blank characters) count as failed.
    pub min_content_length: usize,
    /// Per-chapter deadline in the final pass.
    pub final_pass_timeout: Duration,
    /// Wall-clock ceiling for the whole download.
    pub max_duration: Duration,
    /// Lowest share of chapters for the download to count as a success.
    pub quorum_ratio: f64,
    /// 1-based inclusive chapter range; `None` means from the first / to
    /// the last.
    pub start_chapter: Option<u32>,
    pub end_chapter: Option<u32>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            retry_times: DEFAULT_RETRY_TIMES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            min_content_length: DEFAULT_MIN_CONTENT_LENGTH,
            final_pass_timeout: DEFAULT_FINAL_PASS_TIMEOUT,
            max_duration: DEFAULT_MAX_DURATION,
            quorum_ratio: DEFAULT_QUORUM_RATIO,
            start_chapter: None,
            end_chapter: None,
        }
    }
}

impl DownloadOptions {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_times.saturating_add(1),
            self.retry_base_delay,
            MAX_RETRY_DELAY,
            2.0,
        )
    }
}

/// A chapter that could not be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterFailure {
    pub info: ChapterInfo,
    pub error: String,
    pub attempts: u32,
    /// Not worth retrying: a 404, an open circuit, the time ceiling.
    pub permanent: bool,
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Sorted, with dense ordinals.
    pub chapters: Vec<Chapter>,
    pub failures: Vec<ChapterFailure>,
    pub stats: StatsSummary,
    /// Number of TOC entries the download was asked for.
    pub requested: usize,
    /// The task ended before the download did: cancelled, or failed from
    /// outside (for example as stalled).
    pub cancelled: bool,
    pub timed_out: bool,
}

impl DownloadOutcome {
    /// Share of requested chapters obtained, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn obtained_share(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        (self.chapters.len() as f64 / self.requested as f64).min(1.0)
    }

    /// At least one chapter and at least `ratio` of those requested.
    #[must_use]
    pub fn meets_quorum(&self, ratio: f64) -> bool {
        !self.chapters.is_empty() && self.obtained_share() >= ratio
    }
}

/// Where the orchestrator reports progress and looks for cancellation.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tracker: Arc<ProgressTracker>,
    task_id: TaskId,
}

impl ProgressHandle {
    #[must_use]
    pub fn new(tracker: Arc<ProgressTracker>, task_id: TaskId) -> Self {
        Self { tracker, task_id }
    }

    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Cancelled, failed (for example by the stall sweep) or no longer
    /// tracked.
    fn is_stopped(&self) -> bool {
        self.tracker.is_stopped(&self.task_id)
    }

    /// Returns once the task is no longer Paused.
    async fn wait_while_paused(&self) {
        if !self.tracker.is_paused(&self.task_id) {
            return;
        }
        info!(task_id = %self.task_id, "download paused");
        while self.tracker.is_paused(&self.task_id) {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
        info!(task_id = %self.task_id, "download resumed");
    }

    fn heartbeat(&self) {
        if let Err(error) = self.tracker.heartbeat(&self.task_id) {
            debug!(task_id = %self.task_id, error = %error, "heartbeat rejected");
        }
    }

    fn report(&self, stats: &DownloadStats, current: Option<String>) {
        let completed = u32::try_from(stats.completed()).unwrap_or(u32::MAX);
        let failed = u32::try_from(stats.failed()).unwrap_or(u32::MAX);
        if let Err(error) = self.tracker.update_progress(&self.task_id, completed, current, failed) {
            debug!(task_id = %self.task_id, error = %error, "progress update rejected");
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOrchestrator {
    options: DownloadOptions,
    policy: RetryPolicy,
}

impl DownloadOrchestrator {
    #[must_use]
    pub fn new(options: DownloadOptions) -> Self {
        let policy = options.retry_policy();
        Self { options, policy }
    }

    #[must_use]
    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Downloads every entry of `entries` through `source`.
    ///
    /// Individual chapter failures never fail the call; they are listed in
    /// the outcome. The caller decides what share of chapters is enough.
    #[instrument(skip_all, fields(chapters = entries.len(), task_id = progress.map(|p| p.task_id.as_str())))]
    pub async fn download(
        &self,
        entries: &[ChapterInfo],
        source: &dyn ChapterSource,
        progress: Option<&ProgressHandle>,
    ) -> DownloadOutcome {
        let started = Instant::now();
        let stats = DownloadStats::new();
        let mut chapters = Vec::with_capacity(entries.len());
        let mut failures = Vec::new();
        let mut cancelled = false;
        let mut timed_out = false;
        let batch_size = self.options.batch_size.max(1);

        info!(batch_size, "starting download");

        for (index, batch) in entries.chunks(batch_size).enumerate() {
            if let Some(progress) = progress {
                progress.wait_while_paused().await;
            }
            if progress.is_some_and(ProgressHandle::is_stopped) {
                info!(batch = index, "download stopped");
                cancelled = true;
                break;
            }
            if started.elapsed() >= self.options.max_duration {
                let remaining = &entries[index * batch_size..];
                warn!(
                    remaining = remaining.len(),
                    limit_secs = self.options.max_duration.as_secs(),
                    "download time ceiling reached"
                );
                for info in remaining {
                    stats.increment_failed();
                    failures.push(ChapterFailure {
                        info: info.clone(),
                        error: "timed out".to_string(),
                        attempts: 0,
                        permanent: true,
                    });
                }
                if let Some(progress) = progress {
                    progress.report(&stats, None);
                }
                timed_out = true;
                break;
            }
            if index > 0 && !self.options.batch_delay.is_zero() {
                tokio::time::sleep(self.options.batch_delay).await;
            }

            let stats = &stats;
            let mut pending: FuturesUnordered<_> = batch
                .iter()
                .map(|info| async move { (info, self.fetch_with_retry(source, info, stats, progress).await) })
                .collect();
            while let Some((info, result)) = pending.next().await {
                match result {
                    Ok(chapter) => {
                        stats.increment_completed();
                        chapters.push(chapter);
                    }
                    Err(failure) => {
                        stats.increment_failed();
                        warn!(url = %info.url, attempts = failure.attempts, error = %failure.error, "chapter failed");
                        failures.push(failure);
                    }
                }
                if let Some(progress) = progress {
                    progress.report(stats, Some(info.title.clone()));
                }
            }
        }

        if !cancelled && !timed_out && !failures.is_empty() {
            let (recovered, still_failed, was_cancelled) = self.final_pass(failures, source, &stats, progress).await;
            chapters.extend(recovered);
            failures = still_failed;
            cancelled = was_cancelled;
        }

        let chapters = sort_and_number(dedup(chapters));
        let summary = stats.summary();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            retried = summary.retried,
            recovered = summary.recovered,
            elapsed_ms = started.elapsed().as_millis(),
            "download finished"
        );
        DownloadOutcome {
            chapters,
            failures,
            stats: summary,
            requested: entries.len(),
            cancelled,
            timed_out,
        }
    }

    /// One more sequential attempt per failure, each under
    /// `final_pass_timeout`.
    async fn final_pass(
        &self,
        failures: Vec<ChapterFailure>,
        source: &dyn ChapterSource,
        stats: &DownloadStats,
        progress: Option<&ProgressHandle>,
    ) -> (Vec<Chapter>, Vec<ChapterFailure>, bool) {
        info!(failures = failures.len(), "final pass over failed chapters");
        let mut recovered = Vec::new();
        let mut still_failed = Vec::new();
        let mut cancelled = false;

        for mut failure in failures {
            if !cancelled && let Some(progress) = progress {
                progress.wait_while_paused().await;
            }
            if cancelled || progress.is_some_and(ProgressHandle::is_stopped) {
                cancelled = true;
                still_failed.push(failure);
                continue;
            }
            if let Some(progress) = progress {
                progress.report(stats, Some(failure.info.title.clone()));
            }
            failure.attempts += 1;
            let attempt = tokio::time::timeout(self.options.final_pass_timeout, source.fetch_chapter(&failure.info)).await;
            match attempt {
                Ok(Ok(chapter)) if self.acceptable(&chapter) => {
                    info!(url = %failure.info.url, "chapter recovered in final pass");
                    stats.record_recovery();
                    if let Some(progress) = progress {
                        progress.report(stats, Some(chapter.title.clone()));
                    }
                    recovered.push(chapter);
                }
                Ok(Ok(chapter)) => {
                    failure.error = too_short(&chapter);
                    still_failed.push(failure);
                }
                Ok(Err(error)) => {
                    failure.error = error.to_string();
                    still_failed.push(failure);
                }
                Err(_) => {
                    failure.error = format!(
                        "final pass timed out after {}s",
                        self.options.final_pass_timeout.as_secs()
                    );
                    still_failed.push(failure);
                }
            }
        }
        (recovered, still_failed, cancelled)
    }

    async fn fetch_with_retry(
        &self,
        source: &dyn ChapterSource,
        info: &ChapterInfo,
        stats: &DownloadStats,
        progress: Option<&ProgressHandle>,
    ) -> Result<Chapter, ChapterFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (error, failure_type) = match source.fetch_chapter(info).await {
                Ok(chapter) if self.acceptable(&chapter) => return Ok(chapter),
                Ok(chapter) => (too_short(&chapter), FailureType::Transient),
                Err(error) => {
                    let failure_type = failure_type(&error);
                    (error.to_string(), failure_type)
                }
            };

            match self.policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry { delay, attempt: next } => {
                    debug!(url = %info.url, next, delay_ms = delay.as_millis(), error = %error, "retrying chapter");
                    stats.increment_retried();
                    if let Some(progress) = progress {
                        progress.heartbeat();
                    }
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url = %info.url, %reason, "giving up on chapter");
                    return Err(ChapterFailure {
                        info: info.clone(),
                        error,
                        attempts: attempt,
                        permanent: matches!(failure_type, FailureType::Permanent | FailureType::NeedsAuth),
                    });
                }
            }
        }
    }

    fn acceptable(&self, chapter: &Chapter) -> bool {
        text_length(&chapter.content) >= self.options.min_content_length.max(1)
    }
}

fn too_short(chapter: &Chapter) -> String {
    format!("content too short ({} chars)", text_length(&chapter.content))
}

/// Retry class of an extraction error. An open circuit, a 404 or a missing
/// rule will not improve on retry.
fn failure_type(error: &ExtractError) -> FailureType {
    match error {
        ExtractError::Fetch(fetch) if error.is_retryable() => classify_error(fetch),
        _ if error.is_retryable() => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use dashmap::DashMap;

    use super::*;
    use crate::fetch::FetchError;
    use crate::progress::{TaskStatus, TrackerConfig};

    type Behavior = Box<dyn Fn(&ChapterInfo, u32) -> Result<String, ExtractError> + Send + Sync>;

    struct Scripted {
        calls: DashMap<String, u32>,
        latency: Duration,
        behavior: Behavior,
    }

    impl Scripted {
        fn new(behavior: impl Fn(&ChapterInfo, u32) -> Result<String, ExtractError> + Send + Sync + 'static) -> Self {
            Self {
                calls: DashMap::new(),
                latency: Duration::ZERO,
                behavior: Box::new(behavior),
            }
        }

        fn calls(&self, url: &str) -> u32 {
            self.calls.get(url).map_or(0, |count| *count)
        }
    }

    #[async_trait]
    impl ChapterSource for Scripted {
        async fn fetch_chapter(&self, info: &ChapterInfo) -> Result<Chapter, ExtractError> {
            let call = {
                let mut count = self.calls.entry(info.url.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            (self.behavior)(info, call).map(|content| Chapter::from_info(info, content))
        }
    }

    fn body() -> String {
        "正文内容，足够长。".repeat(5)
    }

    fn toc(titles: &[&str]) -> Vec<ChapterInfo> {
        titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                let order = u32::try_from(i + 1).unwrap();
                ChapterInfo::new(*title, format!("https://x.example/{order}.html"), order)
            })
            .collect()
    }

    fn options() -> DownloadOptions {
        DownloadOptions {
            batch_size: 2,
            batch_delay: Duration::from_millis(10),
            retry_times: 2,
            retry_base_delay: Duration::from_millis(10),
            min_content_length: 10,
            final_pass_timeout: Duration::from_secs(5),
            ..DownloadOptions::default()
        }
    }

    fn not_found(info: &ChapterInfo) -> ExtractError {
        FetchError::http_status(&info.url, 404).into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_chapters_sorted_and_reported() {
        let tracker = Arc::new(ProgressTracker::default());
        let task = tracker.create(3);
        tracker.start(&task).unwrap();
        let handle = ProgressHandle::new(Arc::clone(&tracker), task.clone());

        let source = Scripted::new(|_, _| Ok(body()));
        let outcome = DownloadOrchestrator::new(options())
            .download(&toc(&["第3章", "第1章", "第2章"]), &source, Some(&handle))
            .await;

        let titles: Vec<&str> = outcome.chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["第1章", "第2章", "第3章"]);
        assert_eq!(outcome.chapters.iter().map(|c| c.order).collect::<Vec<_>>(), [1, 2, 3]);
        assert!(outcome.failures.is_empty());
        assert!(outcome.meets_quorum(1.0));
        assert_eq!(tracker.snapshot(&task).unwrap().completed_chapters, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let source = Scripted::new(|info, call| {
            if call == 1 {
                Err(FetchError::timeout(&info.url, Duration::from_secs(1)).into())
            } else {
                Ok(body())
            }
        });
        let outcome = DownloadOrchestrator::new(options())
            .download(&toc(&["第1章"]), &source, None)
            .await;
        assert_eq!(outcome.chapters.len(), 1);
        assert_eq!(outcome.stats.retried, 1);
        assert_eq!(source.calls("https://x.example/1.html"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_skips_retries_but_gets_final_pass() {
        let source = Scripted::new(|info, _| if info.order == 2 { Err(not_found(info)) } else { Ok(body()) });
        let outcome = DownloadOrchestrator::new(options())
            .download(&toc(&["第1章", "第2章", "第3章"]), &source, None)
            .await;

        assert_eq!(outcome.chapters.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        let failure = &outcome.failures[0];
        assert!(failure.permanent);
        assert_eq!(failure.attempts, 2);
        assert!(failure.error.contains("404"));
        assert_eq!(source.calls("https://x.example/2.html"), 2);
        assert_eq!(outcome.stats.retried, 0);
        assert!(outcome.meets_quorum(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_pass_recovers_chapter() {
        let source = Scripted::new(|_, call| if call <= 3 { Ok("短".to_string()) } else { Ok(body()) });
        let outcome = DownloadOrchestrator::new(options())
            .download(&toc(&["第1章"]), &source, None)
            .await;

        assert_eq!(outcome.chapters.len(), 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.stats.recovered, 1);
        assert_eq!(outcome.stats.failed, 0);
        assert_eq!(outcome.stats.retried, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_before_next_batch() {
        let tracker = Arc::new(ProgressTracker::default());
        let task = tracker.create(4);
        tracker.start(&task).unwrap();
        let handle = ProgressHandle::new(Arc::clone(&tracker), task.clone());

        let cancel_tracker = Arc::clone(&tracker);
        let cancel_task = task.clone();
        let source = Scripted::new(move |info, _| {
            if info.order == 2 {
                cancel_tracker.cancel(&cancel_task).unwrap();
            }
            Ok(body())
        });
        let outcome = DownloadOrchestrator::new(options())
            .download(&toc(&["第1章", "第2章", "第3章", "第4章"]), &source, Some(&handle))
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.chapters.len(), 2);
        assert_eq!(source.calls("https://x.example/3.html"), 0);
        let snapshot = tracker.snapshot(&task).unwrap();
        assert_eq!(snapshot.status, crate::progress::TaskStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_ceiling_fails_unfetched_entries() {
        let mut source = Scripted::new(|_, _| Ok(body()));
        source.latency = Duration::from_secs(10);
        let outcome = DownloadOrchestrator::new(DownloadOptions {
            batch_size: 1,
            max_duration: Duration::from_secs(15),
            ..options()
        })
        .download(&toc(&["第1章", "第2章", "第3章", "第4章"]), &source, None)
        .await;

        assert!(outcome.timed_out);
        assert_eq!(outcome.chapters.len(), 2);
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures.iter().all(|f| f.permanent && f.error == "timed out"));
        assert!(!outcome.meets_quorum(0.6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_pass_heartbeats_hold_off_the_stall_sweep() {
        let tracker = Arc::new(ProgressTracker::new(TrackerConfig {
            stall_timeout: Duration::from_secs(300),
            ..TrackerConfig::default()
        }));
        let task = tracker.create(8);
        tracker.start(&task).unwrap();
        let handle = ProgressHandle::new(Arc::clone(&tracker), task.clone());

        let mut source = Scripted::new(|info, _| if info.order == 1 { Ok(body()) } else { Err(not_found(info)) });
        source.latency = Duration::from_secs(59);
        let orchestrator = DownloadOrchestrator::new(DownloadOptions {
            batch_size: 8,
            final_pass_timeout: Duration::from_secs(60),
            ..options()
        });
        let titles = ["第1章", "第2章", "第3章", "第4章", "第5章", "第6章", "第7章", "第8章"];
        let entries = toc(&titles);
        let download = orchestrator.download(&entries, &source, Some(&handle));
        let sweeps = async {
            let mut stalled = 0;
            for _ in 0..15 {
                tokio::time::sleep(Duration::from_secs(30)).await;
                stalled += tracker.sweep().stalled;
            }
            stalled
        };
        let (outcome, stalled) = tokio::join!(download, sweeps);

        assert_eq!(stalled, 0);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.chapters.len(), 1);
        assert_eq!(outcome.failures.len(), 7);
        assert_eq!(tracker.snapshot(&task).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_failed_elsewhere_stops_download() {
        let tracker = Arc::new(ProgressTracker::default());
        let task = tracker.create(4);
        tracker.start(&task).unwrap();
        let handle = ProgressHandle::new(Arc::clone(&tracker), task.clone());

        let fail_tracker = Arc::clone(&tracker);
        let fail_task = task.clone();
        let source = Scripted::new(move |info, _| {
            if info.order == 2 {
                fail_tracker.complete(&fail_task, false, Some("stalled".into())).unwrap();
            }
            Ok(body())
        });
        let outcome = DownloadOrchestrator::new(options())
            .download(&toc(&["第1章", "第2章", "第3章", "第4章"]), &source, Some(&handle))
            .await;

        assert!(outcome.cancelled);
        assert_eq!(source.calls("https://x.example/3.html"), 0);
        assert_eq!(tracker.snapshot(&task).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_task_holds_next_batch_until_resumed() {
        let tracker = Arc::new(ProgressTracker::default());
        let task = tracker.create(4);
        tracker.start(&task).unwrap();
        let handle = ProgressHandle::new(Arc::clone(&tracker), task.clone());

        let pause_tracker = Arc::clone(&tracker);
        let pause_task = task.clone();
        let source = Scripted::new(move |info, call| {
            if info.order == 2 && call == 1 {
                pause_tracker.pause(&pause_task).unwrap();
            }
            Ok(body())
        });
        let orchestrator = DownloadOrchestrator::new(options());
        let entries = toc(&["第1章", "第2章", "第3章", "第4章"]);
        let download = orchestrator.download(&entries, &source, Some(&handle));
        let resume = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let calls_while_paused = source.calls("https://x.example/3.html");
            assert_eq!(tracker.snapshot(&task).unwrap().status, TaskStatus::Paused);
            tracker.start(&task).unwrap();
            calls_while_paused
        };
        let (outcome, calls_while_paused) = tokio::join!(download, resume);

        assert_eq!(calls_while_paused, 0);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.chapters.len(), 4);
        assert_eq!(source.calls("https://x.example/3.html"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kept_duplicate_does_not_depend_on_latency() {
        struct Timed;

        #[async_trait]
        impl ChapterSource for Timed {
            async fn fetch_chapter(&self, info: &ChapterInfo) -> Result<Chapter, ExtractError> {
                let delay = if info.title == "序章甲" { 20 } else { 10 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Chapter::from_info(info, body()))
            }
        }

        let shared = "https://x.example/prologue.html";
        let entries = vec![
            ChapterInfo::new("序章甲", shared, 1),
            ChapterInfo::new("序章乙", shared, 2),
        ];
        let outcome = DownloadOrchestrator::new(options()).download(&entries, &Timed, None).await;
        let titles: Vec<&str> = outcome.chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["序章甲"]);
    }

    #[test]
    fn test_failure_types() {
        let url = "https://x.example/1.html";
        assert_eq!(failure_type(&FetchError::http_status(url, 503).into()), FailureType::Transient);
        assert_eq!(failure_type(&FetchError::http_status(url, 429).into()), FailureType::RateLimited);
        assert_eq!(failure_type(&FetchError::http_status(url, 404).into()), FailureType::Permanent);
        assert_eq!(
            failure_type(&FetchError::circuit_open("s:chapter", Duration::from_secs(5)).into()),
            FailureType::Permanent
        );
        assert_eq!(failure_type(&ExtractError::failed(crate::rule::Operation::Chapter, url, Vec::new())), FailureType::Transient);
    }
}
