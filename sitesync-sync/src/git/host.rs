//! Git-hosting provider boundary.
//!
//! Every call is scoped to one organization and authenticated by the
//! implementation. Errors use the [`SyncError`] taxonomy: missing objects are
//! `NotFound`, creating something that exists is `Conflict`.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::retry::RateLimit;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub name: String,
    pub default_branch: String,
}

/// A commit and the tree it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    pub tree: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub sha: String,
    pub content: String,
}

/// One entry of a tree modification list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum TreeChange {
    Upsert { path: String, content: String },
    Delete { path: String },
}

impl TreeChange {
    pub fn path(&self) -> &str {
        match self {
            TreeChange::Upsert { path, .. } | TreeChange::Delete { path } => path,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, TreeChange::Delete { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: "sitesync".to_string(),
            email: "sitesync@users.noreply.github.com".to_string(),
        }
    }
}

impl From<&sitesync_core::Author> for CommitAuthor {
    fn from(author: &sitesync_core::Author) -> Self {
        Self {
            name: author.name.clone(),
            email: author.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { sha: String },
    /// Head was already contained in base.
    UpToDate,
}

pub trait GitHost: Send + Sync {
    fn repository_exists(&self, repo: &str) -> Result<bool, SyncError>;

    /// `Conflict` when the repository already exists.
    fn create_repository(&self, repo: &str) -> Result<RepoInfo, SyncError>;

    fn get_repository(&self, repo: &str) -> Result<RepoInfo, SyncError>;

    fn branch_head(&self, repo: &str, branch: &str) -> Result<CommitRef, SyncError>;

    /// `Conflict` when the branch already exists.
    fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), SyncError>;

    fn delete_branch(&self, repo: &str, branch: &str) -> Result<(), SyncError>;

    fn set_default_branch(&self, repo: &str, branch: &str) -> Result<(), SyncError>;

    fn get_file(&self, repo: &str, git_ref: &str, path: &str) -> Result<RemoteFile, SyncError>;

    /// Create or replace a single file with its own commit. Returns the
    /// commit sha.
    fn put_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String, SyncError>;

    /// `NotFound` when the file is absent.
    fn delete_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String, SyncError>;

    /// Direct children of `path` (`""` for the root) at `git_ref`, with
    /// paths relative to the repository root. A `path` naming a file yields
    /// that file as the only `Blob` entry.
    fn list_dir(&self, repo: &str, git_ref: &str, path: &str) -> Result<Vec<TreeEntry>, SyncError>;

    /// Every blob reachable from `git_ref`.
    fn list_files(&self, repo: &str, git_ref: &str) -> Result<Vec<String>, SyncError>;

    /// Apply `changes` on top of `base_tree`; returns the new tree sha.
    fn create_tree(
        &self,
        repo: &str,
        base_tree: &str,
        changes: &[TreeChange],
    ) -> Result<String, SyncError>;

    fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parents: &[String],
        author: &CommitAuthor,
    ) -> Result<String, SyncError>;

    fn update_ref(&self, repo: &str, branch: &str, sha: &str) -> Result<(), SyncError>;

    /// Merge `head` into `base`.
    fn merge(
        &self,
        repo: &str,
        base: &str,
        head: &str,
        message: &str,
    ) -> Result<MergeOutcome, SyncError>;

    /// Last known API budget, if the host reports one.
    fn rate_limit(&self) -> Result<Option<RateLimit>, SyncError>;
}
