//! Harvester Core Library
//!
//! A resilient, rule-driven pipeline that extracts search results, book
//! metadata, tables of contents and chapter text from many independently
//! structured novel sites, and assembles complete, correctly ordered
//! documents from them.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`rule`] - Per-source extraction rules, parsed once at load
//! - [`fetch`] - HTTP client with header profiles, retries and politeness
//! - [`breaker`] - Circuit breaker and adaptive timeouts per operation
//! - [`validate`] - Content scoring, garbled-text detection, ad cleaning
//! - [`extract`] - Strategy-chain extractors for search, detail, TOC, chapter
//! - [`cache`] - Memory and disk cache with per-category TTL
//! - [`download`] - Batch chapter download with retries and ordering
//! - [`progress`] - Download task state machine and stall sweep
//! - [`sink`] - Document assembly
//! - [`service`] - The [`Harvester`] facade wiring it all together

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod breaker;
pub mod cache;
pub mod download;
pub mod extract;
pub mod fetch;
pub mod model;
pub mod progress;
pub mod rule;
pub mod service;
pub mod sink;
pub mod validate;
mod user_agent;
mod worker;

// Re-export commonly used types
pub use breaker::{BreakerConfig, CircuitState, Guard, TimeoutConfig};
pub use cache::{CacheCategory, CacheConfig, CacheKey, CacheManager, CacheStats};
pub use download::{
    ChapterSource, DownloadOptions, DownloadOrchestrator, DownloadOutcome, DownloadStats,
};
pub use extract::{ExtractError, Extractor};
pub use fetch::{
    FailureType, FetchClient, FetchConfig, FetchError, RetryDecision, RetryPolicy, classify_error,
};
pub use model::{BookDetail, Chapter, ChapterInfo, SearchResult};
pub use progress::{
    FileStatus, ProgressError, ProgressSnapshot, ProgressTracker, TaskId, TaskStatus,
};
pub use rule::{RuleError, RuleRegistry, SourceRule};
pub use service::{Harvester, HarvesterConfig, ServiceError, SourceSummary};
pub use sink::{DocumentFormat, DocumentSink, SinkError, TextSink};
pub use validate::ContentValidator;
