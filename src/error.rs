use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or timeout class failure. Retried, then recorded per record.
    #[error("fetch failed for {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    /// Document is present but unusable. Never retried.
    #[error("cannot parse {source_name}: {reason}")]
    ContentParse { source_name: String, reason: String },

    #[error("record store {path:?} is corrupt: {reason}")]
    StoreCorruption { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn fetch(url: &str, reason: impl Into<String>) -> Self {
        PipelineError::TransientFetch {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientFetch { .. } => "transient_fetch",
            PipelineError::ContentParse { .. } => "content_parse",
            PipelineError::StoreCorruption { .. } => "store_corruption",
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Io { .. } => "io",
            PipelineError::Csv(_) => "csv",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientFetch { .. })
    }

    /// Errors that abort the whole run instead of a single stage.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::StoreCorruption { .. } | PipelineError::Configuration(_)
        )
    }
}
