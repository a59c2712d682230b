//! Resilient page fetcher.
//!
//! [`FetchClient`] sends one logical request as a bounded series of attempts:
//! each [`RequestProfile`] is tried in order, and each profile is retried
//! with exponential backoff on transient failures before the next profile is
//! used. Total attempts never exceed `profiles × retries_per_profile`.
//!
//! Connections are pooled per origin. A pool that has not been used for
//! `idle_timeout` is rebuilt on next use, and [`FetchClient::sweep_idle`]
//! drops idle pools outright.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderName, HeaderValue, REFERER,
    RETRY_AFTER, USER_AGENT,
};
use reqwest::{Client, redirect};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::charset::decode_body;
use super::profile::{RequestProfile, default_profiles};
use super::rate_limiter::{RateLimiter, extract_origin, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::FetchError;
use crate::rule::HttpMethod;

/// Default cap on simultaneous in-flight requests across all origins.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_REDIRECTS: usize = 10;

/// Tunables for [`FetchClient`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Minimum spacing between requests to one origin.
    pub politeness_delay: Duration,
    pub profiles: Vec<RequestProfile>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            politeness_delay: Duration::ZERO,
            profiles: default_profiles(),
        }
    }
}

/// One logical request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: HttpMethod,
    /// Form body for POST requests.
    pub body: Option<String>,
    /// Hard deadline for each attempt (send + body).
    pub timeout: Duration,
    pub referer: Option<String>,
    /// Extra headers from the source rule.
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl FetchRequest {
    /// A GET request with the given per-attempt timeout.
    #[must_use]
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            body: None,
            timeout,
            referer: None,
            headers: Vec::new(),
        }
    }

    /// A form POST request.
    #[must_use]
    pub fn post(url: impl Into<String>, body: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body.into()),
            ..Self::get(url, timeout)
        }
    }

    #[must_use]
    pub fn with_referer(mut self, referer: Option<String>) -> Self {
        self.referer = referer;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(HeaderName, HeaderValue)>) -> Self {
        self.headers = headers;
        self
    }
}

/// A successfully fetched and decoded page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// URL after redirects.
    pub url: String,
    pub status: u16,
    pub body: String,
    /// Name of the charset the body was decoded with.
    pub encoding: &'static str,
    /// Name of the profile that succeeded.
    pub profile: &'static str,
    /// Attempts made, the successful one included.
    pub attempts: u32,
    /// Duration of the successful attempt.
    pub elapsed: Duration,
}

#[derive(Debug)]
struct PooledClient {
    client: Client,
    last_used: Mutex<Instant>,
}

impl PooledClient {
    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// HTTP fetcher with profile fallback, retries and per-origin pooling.
///
/// Designed to be created once and shared behind an `Arc`.
#[derive(Debug)]
pub struct FetchClient {
    config: FetchConfig,
    pools: DashMap<String, PooledClient>,
    limiter: RateLimiter,
    in_flight: Arc<Semaphore>,
}

impl Default for FetchClient {
    fn default() -> Self {
        Self::new(FetchConfig::default())
    }
}

impl FetchClient {
    #[must_use]
    pub fn new(config: FetchConfig) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let limiter = RateLimiter::new(config.politeness_delay);
        Self {
            config,
            pools: DashMap::new(),
            limiter,
            in_flight,
        }
    }

    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetches `url` with GET: the `fetch(url, timeout, referer)` shorthand.
    ///
    /// # Errors
    ///
    /// As [`Self::fetch`].
    pub async fn get(
        &self,
        url: &str,
        timeout: Duration,
        referer: Option<&str>,
    ) -> Result<FetchResponse, FetchError> {
        let request = FetchRequest::get(url, timeout).with_referer(referer.map(str::to_string));
        self.fetch(&request).await
    }

    /// Performs a request, walking profiles and retrying as configured.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error (e.g. HTTP 404), or the last error
    /// seen once every profile has exhausted its retries.
    #[instrument(skip(self, request), fields(url = %request.url, origin))]
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let parsed = Url::parse(&request.url)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
            .ok_or_else(|| FetchError::invalid_url(&request.url))?;
        let origin = extract_origin(parsed.as_str());
        tracing::Span::current().record("origin", origin.as_str());

        let mut attempts = 0u32;
        let mut last_error = None;

        'profiles: for profile in &self.config.profiles {
            let mut attempt = 1;
            loop {
                attempts += 1;
                let error = match self.attempt(&origin, profile, request).await {
                    Ok(mut response) => {
                        response.attempts = attempts;
                        return Ok(response);
                    }
                    Err(error) => error,
                };

                if let FetchError::HttpStatus {
                    retry_after: Some(value),
                    ..
                } = &error
                    && let Some(delay) = parse_retry_after(value)
                {
                    self.limiter.record_rate_limit(&request.url, delay);
                }

                let failure = classify_error(&error);
                warn!(
                    origin = %origin,
                    profile = profile.name,
                    attempt,
                    failure = ?failure,
                    error = %error,
                    "fetch attempt failed"
                );

                match failure {
                    FailureType::Permanent => return Err(error),
                    FailureType::NeedsAuth => {
                        last_error = Some(error);
                        continue 'profiles;
                    }
                    FailureType::Transient | FailureType::RateLimited => {}
                }

                match self.config.retry.should_retry(failure, attempt) {
                    RetryDecision::Retry { delay, attempt: next } => {
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(profile = profile.name, %reason, "advancing to next profile");
                        last_error = Some(error);
                        continue 'profiles;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::invalid_url(&request.url)))
    }

    async fn attempt(
        &self,
        origin: &str,
        profile: &RequestProfile,
        request: &FetchRequest,
    ) -> Result<FetchResponse, FetchError> {
        self.limiter.acquire(&request.url).await;
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let client = self.client_for(origin, &request.url)?;

        let mut builder = match request.method {
            HttpMethod::Get => client.get(&request.url),
            HttpMethod::Post => client
                .post(&request.url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(request.body.clone().unwrap_or_default()),
        };
        builder = builder
            .header(USER_AGENT, profile.user_agent.as_str())
            .header(ACCEPT, profile.accept)
            .header(ACCEPT_ENCODING, profile.accept_encoding)
            .timeout(request.timeout);
        if let Some(language) = profile.accept_language {
            builder = builder.header(ACCEPT_LANGUAGE, language);
        }
        if profile.send_referer
            && let Some(referer) = &request.referer
        {
            builder = builder.header(REFERER, referer.as_str());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.clone(), value.clone());
        }

        let url = request.url.as_str();
        let started = Instant::now();
        let outcome = tokio::time::timeout(request.timeout, async {
            let response = builder.send().await.map_err(|e| map_reqwest_error(url, e, request.timeout))?;
            let status = response.status();
            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                return Err(FetchError::http_status_with_retry_after(
                    url,
                    status.as_u16(),
                    retry_after,
                ));
            }
            let final_url = response.url().to_string();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .bytes()
                .await
                .map_err(|e| map_reqwest_error(url, e, request.timeout))?;
            Ok((status.as_u16(), final_url, content_type, bytes))
        })
        .await;
        let elapsed = started.elapsed();

        let (status, final_url, content_type, bytes) = match outcome {
            Err(_) => return Err(FetchError::timeout(url, request.timeout)),
            Ok(result) => result?,
        };
        let (body, encoding) = decode_body(&bytes, content_type.as_deref());

        info!(
            origin = %origin,
            status,
            profile = profile.name,
            duration_ms = elapsed.as_millis(),
            bytes = bytes.len(),
            encoding = encoding.name(),
            "fetched page"
        );

        Ok(FetchResponse {
            url: final_url,
            status,
            body,
            encoding: encoding.name(),
            profile: profile.name,
            attempts: 0,
            elapsed,
        })
    }

    /// Returns the pooled client for an origin, rebuilding it when idle.
    fn client_for(&self, origin: &str, url: &str) -> Result<Client, FetchError> {
        if let Some(pooled) = self.pools.get(origin)
            && pooled.idle_for() < self.config.idle_timeout
        {
            pooled.touch();
            return Ok(pooled.client.clone());
        }

        let client = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .pool_idle_timeout(self.config.idle_timeout)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| FetchError::transport(url, e))?;
        debug!(origin, "created connection pool");
        self.pools.insert(
            origin.to_string(),
            PooledClient {
                client: client.clone(),
                last_used: Mutex::new(Instant::now()),
            },
        );
        Ok(client)
    }

    /// Drops connection pools idle for longer than the idle timeout.
    pub fn sweep_idle(&self) -> usize {
        let before = self.pools.len();
        self.pools
            .retain(|_, pooled| pooled.idle_for() < self.config.idle_timeout);
        let removed = before.saturating_sub(self.pools.len());
        if removed > 0 {
            debug!(removed, "dropped idle connection pools");
        }
        removed
    }

    /// Number of origins with a live pool.
    #[must_use]
    pub fn pooled_origins(&self) -> usize {
        self.pools.len()
    }

    /// Stops admitting new requests; waiting requests fail with
    /// [`FetchError::Closed`].
    pub fn close(&self) {
        self.in_flight.close();
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error, timeout: Duration) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url, timeout)
    } else {
        FetchError::transport(url, error)
    }
}
