use std::{fmt::Display, ops::RangeInclusive, path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use thiserror::Error;

pub const DEFAULT_CTB_BASE_URL: &str = "https://rt.data.gov.hk/v2/transport/citybus";
pub const DEFAULT_KMB_BASE_URL: &str = "https://data.etabus.gov.hk/v1/transport/kmb";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{var} must be within {constraint}, got {value}")]
    OutOfRange {
        var: &'static str,
        constraint: String,
        value: String,
    },

    #[error("{var} must be an http(s) URL, got {value:?}: {reason}")]
    InvalidUrl {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} must not be empty")]
    Empty { var: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceSelection {
    Ctb,
    Kmb,
    All,
}

impl SourceSelection {
    pub fn includes_ctb(self) -> bool {
        matches!(self, Self::Ctb | Self::All)
    }

    pub fn includes_kmb(self) -> bool {
        matches!(self, Self::Kmb | Self::All)
    }
}

/// Fetches Citybus and KMB route/stop data and publishes it as a JSON tree.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Which operator to collect.
    #[arg(long, env = "SOURCE", value_enum, default_value_t = SourceSelection::All)]
    pub source: SourceSelection,

    #[arg(long, env = "OUTPUT_DIR", default_value = "data")]
    pub output_dir: PathBuf,

    #[arg(long, env = "REQUESTS_PER_SECOND", default_value_t = 10.0)]
    pub requests_per_second: f64,

    /// Batch size for concurrent requests.
    #[arg(long, env = "CONCURRENT_REQUESTS", default_value_t = 10)]
    pub concurrency: usize,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Timeout for the bulk listing endpoints.
    #[arg(long, env = "LARGE_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    pub large_request_timeout_secs: u64,

    #[arg(long, env = "RETRY_LIMIT", default_value_t = 3)]
    pub retry_limit: u32,

    /// First retry delay; doubles on every further attempt.
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 2000)]
    pub retry_backoff_ms: u64,

    #[arg(long = "cache", env = "CACHE_ENABLED")]
    pub cache_enabled: bool,

    #[arg(long, env = "CACHE_DIR", default_value = ".cache/http")]
    pub cache_dir: PathBuf,

    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 3600)]
    pub cache_ttl_secs: u64,

    /// Remove every cached response before collecting.
    #[arg(long)]
    pub clear_cache: bool,

    #[arg(long, env = "CTB_BASE_URL", default_value = DEFAULT_CTB_BASE_URL)]
    pub ctb_base_url: String,

    #[arg(long, env = "KMB_BASE_URL", default_value = DEFAULT_KMB_BASE_URL)]
    pub kmb_base_url: String,

    /// Previously deployed ctb/stops/allstops.json, used to skip unchanged stops.
    #[arg(long, env = "CTB_PUBLISHED_STOPS_URL")]
    pub ctb_published_stops_url: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value_t = tracing::Level::INFO)]
    pub log_level: tracing::Level,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    pub requests_per_second: f64,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub large_request_timeout: Duration,
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub cache_enabled: bool,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub ctb_base_url: String,
    pub kmb_base_url: String,
    pub ctb_published_stops_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            requests_per_second: 10.0,
            concurrency: 10,
            request_timeout: Duration::from_secs(30),
            large_request_timeout: Duration::from_secs(60),
            retry_limit: 3,
            retry_backoff: Duration::from_millis(2000),
            cache_enabled: false,
            cache_dir: PathBuf::from(".cache/http"),
            cache_ttl: Duration::from_secs(3600),
            ctb_base_url: DEFAULT_CTB_BASE_URL.to_string(),
            kmb_base_url: DEFAULT_KMB_BASE_URL.to_string(),
            ctb_published_stops_url: None,
        }
    }
}

impl TryFrom<&Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let config = Config {
            output_dir: non_empty("OUTPUT_DIR", cli.output_dir.clone())?,
            requests_per_second: in_range(
                "REQUESTS_PER_SECOND",
                cli.requests_per_second,
                0.1..=1000.0,
            )?,
            concurrency: in_range("CONCURRENT_REQUESTS", cli.concurrency, 1..=200)?,
            request_timeout: Duration::from_secs(in_range(
                "REQUEST_TIMEOUT_SECS",
                cli.request_timeout_secs,
                1..=600,
            )?),
            large_request_timeout: Duration::from_secs(in_range(
                "LARGE_REQUEST_TIMEOUT_SECS",
                cli.large_request_timeout_secs,
                1..=1800,
            )?),
            retry_limit: in_range("RETRY_LIMIT", cli.retry_limit, 0..=10)?,
            retry_backoff: Duration::from_millis(in_range(
                "RETRY_BACKOFF_MS",
                cli.retry_backoff_ms,
                0..=60_000,
            )?),
            cache_enabled: cli.cache_enabled,
            cache_dir: non_empty("CACHE_DIR", cli.cache_dir.clone())?,
            cache_ttl: Duration::from_secs(in_range(
                "CACHE_TTL_SECS",
                cli.cache_ttl_secs,
                1..=604_800,
            )?),
            ctb_base_url: http_url("CTB_BASE_URL", &cli.ctb_base_url)?,
            kmb_base_url: http_url("KMB_BASE_URL", &cli.kmb_base_url)?,
            ctb_published_stops_url: cli
                .ctb_published_stops_url
                .as_deref()
                .map(|url| http_url("CTB_PUBLISHED_STOPS_URL", url))
                .transpose()?,
        };

        Ok(config)
    }
}

fn in_range<T>(var: &'static str, value: T, range: RangeInclusive<T>) -> Result<T, ConfigError>
where
    T: PartialOrd + Display,
{
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            var,
            constraint: format!("{}..={}", range.start(), range.end()),
            value: value.to_string(),
        })
    }
}

fn non_empty(var: &'static str, path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.as_os_str().is_empty() {
        Err(ConfigError::Empty { var })
    } else {
        Ok(path)
    }
}

/// Validates the URL and strips any trailing slash so paths can be appended.
fn http_url(var: &'static str, value: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        var,
        value: value.to_string(),
        reason,
    };

    let url = reqwest::Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }

    Ok(value.trim_end_matches('/').to_string())
}
