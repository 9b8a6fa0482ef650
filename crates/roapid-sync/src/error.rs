use std::path::PathBuf;

use roapid_core::CoreError;
use roapid_storage::{FetchError, StorageError};
use roapid_wiki::WikiError;
use thiserror::Error;

use crate::config::ConfigError;

/// What the loops do with a failed job or startup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log and move on; retrying cannot help until the input changes.
    SkipAndLog,
    /// Leave the schedule entry untouched so the next sweep retries it.
    RetryNextSweep,
    /// Abort startup.
    Fatal,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown endpoint type: {0}")]
    UnknownEndpoint(String),
    #[error("open cloud api key required for {0}")]
    MissingApiKey(String),
    #[error(transparent)]
    InvalidFormat(#[from] CoreError),
    #[error("error fetching data from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("error pushing {title} to wiki: {source}")]
    Publish {
        title: String,
        #[source]
        source: WikiError,
    },
    #[error("failed to read {}: {source}", path.display())]
    LocalDocument {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            JobError::InvalidFormat(_) | JobError::UnknownEndpoint(_) => ErrorPolicy::SkipAndLog,
            JobError::MissingApiKey(_)
            | JobError::Fetch { .. }
            | JobError::Storage(_)
            | JobError::Publish { .. }
            | JobError::LocalDocument { .. } => ErrorPolicy::RetryNextSweep,
        }
    }
}

impl ConfigError {
    pub fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::Fatal
    }
}
