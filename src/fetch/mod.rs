//! HTTP access for the collectors: cache lookup, rate limiting, timeouts and
//! retries around a shared `reqwest::Client`.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{config::Config, error::NetworkError};

pub mod cache;
pub mod rate_limiter;

pub use cache::HttpCache;
pub use rate_limiter::RateLimiter;

/// Statuses worth another attempt.
const TRANSIENT_STATUSES: [u16; 7] = [408, 413, 429, 500, 502, 503, 504];

/// Timeout class of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchProfile {
    /// Single route or stop lookups.
    Small,
    /// Bulk listings of every route-stop or stop.
    Large,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base, 2×base, 4×base...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.min(16))
    }
}

pub struct FetchClient {
    http: reqwest::Client,
    limiter: RateLimiter,
    cache: HttpCache,
    retry: RetryPolicy,
    small_timeout: Duration,
    large_timeout: Duration,
}

enum Attempt {
    Done(Value),
    Retry(NetworkError),
    Fail(NetworkError),
}

impl FetchClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(concat!("hk_bus_data/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(20))
            .gzip(true)
            .build()?;

        Ok(Self {
            http,
            limiter: RateLimiter::new(config.requests_per_second),
            cache: HttpCache::new(&config.cache_dir, config.cache_ttl, config.cache_enabled),
            retry: RetryPolicy {
                retry_limit: config.retry_limit,
                base_delay: config.retry_backoff,
            },
            small_timeout: config.request_timeout,
            large_timeout: config.large_request_timeout,
        })
    }

    pub fn cache(&self) -> &HttpCache {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn timeout(&self, profile: FetchProfile) -> Duration {
        match profile {
            FetchProfile::Small => self.small_timeout,
            FetchProfile::Large => self.large_timeout,
        }
    }

    /// GET `url` as JSON, answering from the cache when a fresh entry exists.
    pub async fn fetch_json(&self, url: &str, profile: FetchProfile) -> Result<Value, NetworkError> {
        if let Some(hit) = self.cache.get(url).await {
            debug!(url, "cache hit");
            return Ok(hit);
        }

        let value = self.fetch_with_retry(url, profile).await?;
        self.cache.set(url, &value).await;
        Ok(value)
    }

    /// Like [`fetch_json`](Self::fetch_json) but never reads or writes the cache.
    pub async fn fetch_json_fresh(
        &self,
        url: &str,
        profile: FetchProfile,
    ) -> Result<Value, NetworkError> {
        self.fetch_with_retry(url, profile).await
    }

    async fn fetch_with_retry(&self, url: &str, profile: FetchProfile) -> Result<Value, NetworkError> {
        let mut attempt = 0;
        loop {
            match self.attempt(url, profile).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fail(e) => return Err(e),
                Attempt::Retry(e) if attempt >= self.retry.retry_limit => return Err(e),
                Attempt::Retry(e) => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    warn!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e.message,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&self, url: &str, profile: FetchProfile) -> Attempt {
        self.limiter.acquire().await;
        debug!(url, ?profile, "fetching");

        let response = match self
            .http
            .get(url)
            .timeout(self.timeout(profile))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let error = NetworkError::new(url, e.to_string(), e.status().map(|s| s.as_u16()));
                return if e.is_timeout() || e.is_connect() || e.is_request() {
                    Attempt::Retry(error)
                } else {
                    Attempt::Fail(error)
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error = NetworkError::new(url, status_message(status), Some(status.as_u16()));
            return if TRANSIENT_STATUSES.contains(&status.as_u16()) {
                Attempt::Retry(error)
            } else {
                Attempt::Fail(error)
            };
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            // body cut off mid-stream, usually a reset connection
            Err(e) => return Attempt::Retry(NetworkError::new(url, e.to_string(), Some(status.as_u16()))),
        };

        match serde_json::from_slice(&body) {
            Ok(value) => Attempt::Done(value),
            Err(e) => Attempt::Fail(NetworkError::new(
                url,
                format!("invalid JSON body: {e}"),
                None,
            )),
        }
    }
}

fn status_message(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("unexpected status {reason}"),
        None => format!("unexpected status {}", status.as_u16()),
    }
}
