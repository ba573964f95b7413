// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error taxonomy. Per-entry and per-period failures are recovered
/// locally and reported through the run summary; only run-level failures
/// surface as one of these to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// The portal index could not be fetched, retries included.
    #[error("source index unavailable: {url}: {source}")]
    SourceUnavailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The index was reachable but no period-coded archive links parsed out
    /// of it. Distinct from a network failure: the upstream markup changed.
    #[error("no periods found at {url}")]
    NoPeriodsFound { url: String },

    /// A selected period does not exist in the index.
    #[error("period {period} is not available in the source index")]
    PeriodNotFound { period: String },

    /// Archive download failed for one period (retries exhausted, or a fatal
    /// 4xx status).
    #[error("download failed for period {period}: {reason}")]
    DownloadFailed { period: String, reason: String },

    /// Downloaded file is empty or does not carry the ZIP signature.
    #[error("corrupt archive for period {period}: {reason}")]
    ArchiveCorrupt { period: String, reason: String },

    /// A feed document is not well-formed XML.
    #[error("malformed entry document {path}: {reason}")]
    MalformedEntry { path: PathBuf, reason: String },

    /// Every selected period failed; the run produced nothing.
    #[error("all {attempted} selected periods failed")]
    AllPeriodsFailed { attempted: usize },

    /// Zero records remained after dedup/filtering and the caller did not
    /// opt into empty output.
    #[error("dataset is empty after all pipeline stages")]
    EmptyDataset,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
