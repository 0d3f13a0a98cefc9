use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

/// Fatal problems detected before any generation work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0:?} not found")]
    NotFound(PathBuf),

    #[error("failed to read configuration {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid date string {value:?}, expected format {format}")]
    InvalidDate { value: String, format: &'static str },

    #[error("dates override must be a mapping with exactly the keys train, val and test: {0}")]
    MalformedOverride(String),

    #[error("{0} meta variable cannot have more than one channel")]
    MetaWidth(String),

    #[error("differing files for channel {channel}: {first:?} vs {second:?}")]
    AmbiguousFiles {
        channel: String,
        first: Option<PathBuf>,
        second: Option<PathBuf>,
    },

    #[error("channel {channel} configured with width {first} and {second}")]
    ConflictingWidth {
        channel: String,
        first: usize,
        second: usize,
    },

    #[error("unsupported dtype {0:?}, only float32 is supported")]
    UnsupportedDtype(String),

    #[error("invalid grid shape {0:?}, expected two non-zero dimensions")]
    InvalidShape(Vec<usize>),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Outcome of a sample that could not be produced.
#[derive(Debug, Error)]
pub enum SampleError {
    /// Benign: the date is left out of its shard and its count.
    #[error("sample for {date} skipped: {reason}")]
    Skipped { date: NaiveDate, reason: String },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl SampleError {
    pub fn is_skip(&self) -> bool {
        matches!(self, SampleError::Skipped { .. })
    }
}
