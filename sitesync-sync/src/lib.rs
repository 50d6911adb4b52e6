//! # sitesync-sync
//!
//! Content → backend synchronization.
//!
//! [`ChecksumTracker`] marks items dirty, a [`BackendSync`] implementation
//! pushes dirty items and writes confirmed state back to the store, and the
//! reverse walk imports backend files into the store. [`GitBackend`] is the
//! git-hosted implementation, over either [`GitHubClient`] or
//! [`MemoryGitHost`].

pub mod backend;
pub mod checksum;
pub mod diff;
pub mod error;
pub mod format;
pub mod git;
pub mod paths;
pub mod retry;
pub mod status;

pub use backend::{
    write_back, BackendFile, BackendProvider, BackendSync, ImportMode, ImportReport, SyncReport,
    SyncResult,
};
pub use checksum::{fingerprint, ChecksumTracker};
pub use diff::{diff_pending, ItemDiff};
pub use error::{Classify, ErrorClass, SyncError};
pub use git::{GitBackend, GitBackendProvider, GitHost, GitHubClient, MemoryGitHost};
pub use retry::{RateGovernor, RateLimit, RetryPolicy};
pub use status::{all_site_statuses, site_status, SiteStatus};
