//! Error types shared by the catalog, resolution, cache, and acquisition layers.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of one outbound call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// HTTP 429 after the bounded retry loop gave up.
    #[error("rate limited after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Cache file read, parse, or persist failure. Never fatal to a batch.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file {path} unreadable: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Batch-fatal acquisition failures.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("failed to prepare output path {path}: {source}")]
    OutputPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create working directory: {0}")]
    WorkDir(#[source] std::io::Error),

    #[error("archive write failed: {0}")]
    Archive(String),

    #[error("no downloadable media found")]
    NoMedia,
}

impl From<zip::result::ZipError> for AcquireError {
    fn from(error: zip::result::ZipError) -> Self {
        Self::Archive(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write document: {0}")]
    Write(String),

    #[error("document is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("failed to save document to {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render default config: {0}")]
    Render(#[from] toml::ser::Error),
}
