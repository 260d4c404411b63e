use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A request that ultimately failed after retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("request to {url} failed: {message}{}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct NetworkError {
    pub url: String,
    pub message: String,
    pub status: Option<u16>,
}

impl NetworkError {
    pub fn new(url: impl Into<String>, message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            url: url.into(),
            message: message.into(),
            status,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("unexpected payload: {0}")]
    Validation(String),

    #[error("filesystem error at {path:?}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{context}: {source}")]
    Processing {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// Wraps a lower-level failure with the pipeline step it happened in.
    pub fn processing(context: impl Into<String>, source: Error) -> Self {
        Self::Processing {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}
