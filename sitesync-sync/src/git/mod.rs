//! Git-hosted backend: provider boundary, GitHub client, in-memory host and
//! the [`GitBackend`](backend::GitBackend) built on them.

pub mod backend;
pub mod github;
pub mod host;
pub mod memory;

pub use backend::{GitBackend, GitBackendProvider};
pub use github::GitHubClient;
pub use host::{CommitAuthor, CommitRef, GitHost, MergeOutcome, RepoInfo, TreeChange};
pub use memory::MemoryGitHost;
