//! Service-wide tunables.

use crate::breaker::{BreakerConfig, TimeoutConfig};
use crate::cache::CacheConfig;
use crate::download::DownloadOptions;
use crate::fetch::FetchConfig;
use crate::progress::TrackerConfig;
use crate::validate::{DEFAULT_MAX_AD_RATIO, DEFAULT_MIN_PARAGRAPHS};

use super::ServiceError;

pub const DEFAULT_MAX_SEARCH_RESULTS: usize = 50;

/// Everything [`Harvester`](super::Harvester) needs to build its parts.
/// `Default` gives a working configuration with the disk cache off.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub fetch: FetchConfig,
    pub breaker: BreakerConfig,
    pub timeouts: TimeoutConfig,
    pub cache: CacheConfig,
    pub tracker: TrackerConfig,
    /// Defaults for downloads started without explicit options.
    pub download: DownloadOptions,
    pub max_ad_ratio: f64,
    pub min_paragraphs: usize,
    /// Cap applied when a search asks for more.
    pub max_search_results: usize,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            breaker: BreakerConfig::default(),
            timeouts: TimeoutConfig::default(),
            cache: CacheConfig::default(),
            tracker: TrackerConfig::default(),
            download: DownloadOptions::default(),
            max_ad_ratio: DEFAULT_MAX_AD_RATIO,
            min_paragraphs: DEFAULT_MIN_PARAGRAPHS,
            max_search_results: DEFAULT_MAX_SEARCH_RESULTS,
        }
    }
}

impl HarvesterConfig {
    /// Rejects values that would stall or disable the pipeline.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.fetch.max_in_flight == 0 {
            return Err(ServiceError::invalid_config("fetch.max_in_flight", "must be at least 1"));
        }
        if self.fetch.profiles.is_empty() {
            return Err(ServiceError::invalid_config("fetch.profiles", "at least one profile is required"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ServiceError::invalid_config("breaker.failure_threshold", "must be at least 1"));
        }
        if self.timeouts.min > self.timeouts.max {
            return Err(ServiceError::invalid_config(
                "timeouts",
                format!("min {:?} exceeds max {:?}", self.timeouts.min, self.timeouts.max),
            ));
        }
        if self.cache.enabled && self.cache.memory_capacity == 0 {
            return Err(ServiceError::invalid_config("cache.memory_capacity", "must be at least 1"));
        }
        validate_download(&self.download)?;
        if !(0.0..=1.0).contains(&self.max_ad_ratio) {
            return Err(ServiceError::invalid_config("max_ad_ratio", "must be within 0..=1"));
        }
        if self.max_search_results == 0 {
            return Err(ServiceError::invalid_config("max_search_results", "must be at least 1"));
        }
        Ok(())
    }
}

/// Checks per-download options, including those passed to
/// `start_download`.
pub(crate) fn validate_download(options: &DownloadOptions) -> Result<(), ServiceError> {
    if options.batch_size == 0 {
        return Err(ServiceError::invalid_config("download.batch_size", "must be at least 1"));
    }
    if !(0.0..=1.0).contains(&options.quorum_ratio) {
        return Err(ServiceError::invalid_config("download.quorum_ratio", "must be within 0..=1"));
    }
    if options.max_duration.is_zero() {
        return Err(ServiceError::invalid_config("download.max_duration", "must be positive"));
    }
    if let (Some(start), Some(end)) = (options.start_chapter, options.end_chapter)
        && start > end
    {
        return Err(ServiceError::invalid_config(
            "download.start_chapter",
            format!("start {start} is after end {end}"),
        ));
    }
    Ok(())
}
