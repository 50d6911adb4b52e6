//! Error types for sitesync-sync.

use chrono::{DateTime, Utc};
use thiserror::Error;

use sitesync_core::StoreError;

/// How a failure should be handled by retry and batch logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Recoverable by creating the missing object and retrying.
    NotFound,
    /// The object already exists; creation callers treat this as success.
    Conflict,
    /// Remote budget exhausted. Never retried by [`crate::retry::RetryPolicy`].
    RateLimited,
    /// Retried up to a fixed bound, then surfaced.
    Transient,
    /// Validation or schema failure; skips only the offending item.
    Fatal,
}

/// Anything that can report its [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("already exists: {what}")]
    Conflict { what: String },

    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    /// Item cannot be mapped to a backend path.
    #[error("cannot resolve path for {content_id}: {reason}")]
    Unresolvable { content_id: String, reason: String },

    /// A backend file could not be parsed.
    #[error("malformed file {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SyncError {
    pub fn not_found(what: impl Into<String>) -> Self {
        SyncError::NotFound { what: what.into() }
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        SyncError::Conflict { what: what.into() }
    }

    /// Build an error of the given class; used by test doubles and fault
    /// injection.
    pub fn of_class(class: ErrorClass, what: impl Into<String>) -> Self {
        let what = what.into();
        match class {
            ErrorClass::NotFound => SyncError::NotFound { what },
            ErrorClass::Conflict => SyncError::Conflict { what },
            ErrorClass::RateLimited => SyncError::RateLimited { reset_at: Utc::now() },
            ErrorClass::Transient => SyncError::Transient(what),
            ErrorClass::Fatal => SyncError::Fatal(what),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}

impl Classify for SyncError {
    fn class(&self) -> ErrorClass {
        match self {
            SyncError::NotFound { .. } => ErrorClass::NotFound,
            SyncError::Conflict { .. } => ErrorClass::Conflict,
            SyncError::RateLimited { .. } => ErrorClass::RateLimited,
            SyncError::Transient(_) => ErrorClass::Transient,
            SyncError::Fatal(_)
            | SyncError::Unresolvable { .. }
            | SyncError::Malformed { .. }
            | SyncError::Store(_)
            | SyncError::Json(_)
            | SyncError::Yaml(_) => ErrorClass::Fatal,
        }
    }
}

impl SyncError {
    /// The file was read but its content cannot become a store item.
    pub fn is_bad_content(&self) -> bool {
        matches!(
            self,
            SyncError::Malformed { .. }
                | SyncError::Unresolvable { .. }
                | SyncError::Json(_)
                | SyncError::Yaml(_)
        )
    }
}

/// Treat `Conflict` as success, mapping it to `fallback`.
pub fn conflict_ok<T>(result: Result<T, SyncError>, fallback: impl FnOnce() -> T) -> Result<T, SyncError> {
    match result {
        Err(e) if e.is_conflict() => Ok(fallback()),
        other => other,
    }
}
