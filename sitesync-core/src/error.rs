//! Error types for sitesync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from content store and config operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("site '{site}' not found")]
    SiteNotFound { site: String },

    #[error("content item '{id}' not found in site '{site}'")]
    ItemNotFound { site: String, id: String },

    /// Content ids double as file names in the file store.
    #[error("invalid key '{key}': only ASCII letters, digits, '.', '_' and '-' are allowed")]
    InvalidKey { key: String },

    #[error("invalid site name '{name}': it must contain at least one letter or digit")]
    InvalidSiteName { name: String },

    /// A thread panicked while holding the store lock.
    #[error("content store lock poisoned")]
    Poisoned,
}

/// Convenience constructor for [`StoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
