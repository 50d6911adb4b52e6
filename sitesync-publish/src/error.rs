use std::path::PathBuf;

use thiserror::Error;

use sitesync_core::StoreError;
use sitesync_renderer::RenderError;
use sitesync_sync::{Classify, ErrorClass, SyncError};

/// Pipeline-service failures, classified like backend errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("already exists: {what}")]
    Conflict { what: String },

    #[error("transient pipeline failure: {0}")]
    Transient(String),

    #[error("pipeline error: {0}")]
    Fatal(String),

    #[error("render error: {0}")]
    Render(#[from] RenderError),
}

impl PipelineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        PipelineError::NotFound { what: what.into() }
    }

    pub fn of_class(class: ErrorClass, what: impl Into<String>) -> Self {
        let what = what.into();
        match class {
            ErrorClass::NotFound => PipelineError::NotFound { what },
            ErrorClass::Conflict => PipelineError::Conflict { what },
            ErrorClass::Transient | ErrorClass::RateLimited => PipelineError::Transient(what),
            ErrorClass::Fatal => PipelineError::Fatal(what),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::NotFound { .. })
    }
}

impl Classify for PipelineError {
    fn class(&self) -> ErrorClass {
        match self {
            PipelineError::NotFound { .. } => ErrorClass::NotFound,
            PipelineError::Conflict { .. } => ErrorClass::Conflict,
            PipelineError::Transient(_) => ErrorClass::Transient,
            PipelineError::Fatal(_) | PipelineError::Render(_) => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("already in progress: {key}")]
    Locked { key: String },

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("pre-publish hook failed: {0}")]
    Hook(String),

    #[error("lock table poisoned")]
    Poisoned,

    #[error("task join error: {0}")]
    Join(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> PublishError {
    PublishError::Io {
        path: path.into(),
        source,
    }
}
