//! GitHub REST implementation of [`GitHost`] over blocking `ureq`.
//!
//! Status mapping:
//!
//! | response                                   | class         |
//! |--------------------------------------------|---------------|
//! | 404                                        | `NotFound`    |
//! | 409, 422 "already exists"                  | `Conflict`    |
//! | 403/429 with an exhausted budget           | `RateLimited` |
//! | 5xx, transport errors                      | `Transient`   |
//! | any other 4xx                              | `Fatal`       |
//!
//! Every response's `x-ratelimit-*` headers are fed to the shared
//! [`RateGovernor`].

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use sitesync_core::config::GitHubConfig;

use crate::error::SyncError;
use crate::git::host::{
    CommitAuthor, CommitRef, EntryKind, GitHost, MergeOutcome, RemoteFile, RepoInfo, TreeChange,
    TreeEntry,
};
use crate::retry::{RateGovernor, RateLimit};

const USER_AGENT: &str = concat!("sitesync/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// Parse `x-ratelimit-remaining` / `x-ratelimit-reset` (epoch seconds).
pub fn limit_from_headers(remaining: Option<&str>, reset: Option<&str>) -> Option<RateLimit> {
    let remaining = remaining?.trim().parse::<u32>().ok()?;
    let reset = reset?.trim().parse::<i64>().ok()?;
    let reset_at = Utc.timestamp_opt(reset, 0).single()?;
    Some(RateLimit { remaining, reset_at })
}

/// Map an error status to the sync taxonomy.
pub fn classify_status(code: u16, body: &str, limit: Option<RateLimit>, what: &str) -> SyncError {
    let lowered = body.to_lowercase();
    match code {
        404 => SyncError::not_found(what),
        409 => SyncError::conflict(what),
        422 if lowered.contains("already exists") => SyncError::conflict(what),
        403 | 429 => {
            let exhausted = limit.map(|l| l.remaining == 0).unwrap_or(false);
            if exhausted || code == 429 || lowered.contains("rate limit") {
                let reset_at = limit
                    .map(|l| l.reset_at)
                    .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
                SyncError::RateLimited { reset_at }
            } else {
                SyncError::Fatal(format!("{what}: HTTP {code}: {body}"))
            }
        }
        500..=599 => SyncError::Transient(format!("{what}: HTTP {code}")),
        _ => SyncError::Fatal(format!("{what}: HTTP {code}: {body}")),
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RepoWire {
    name: String,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct ShaWire {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct BranchWire {
    commit: BranchCommitWire,
}

#[derive(Debug, Deserialize)]
struct BranchCommitWire {
    sha: String,
    commit: CommitBodyWire,
}

#[derive(Debug, Deserialize)]
struct CommitBodyWire {
    tree: ShaWire,
}

#[derive(Debug, Deserialize)]
struct ContentWire {
    path: String,
    sha: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct DirEntryWire {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TreeWire {
    tree: Vec<DirEntryWire>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct WriteWire {
    commit: ShaWire,
}

#[derive(Debug, Deserialize)]
struct RateWire {
    resources: RateResourcesWire,
}

#[derive(Debug, Deserialize)]
struct RateResourcesWire {
    core: RateCoreWire,
}

#[derive(Debug, Deserialize)]
struct RateCoreWire {
    remaining: u32,
    reset: i64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    agent: ureq::Agent,
    api_url: String,
    organization: String,
    token: Option<String>,
    governor: Arc<RateGovernor>,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig, governor: Arc<RateGovernor>) -> Result<Self, SyncError> {
        if config.organization.is_empty() {
            return Err(SyncError::Fatal("github.organization is not configured".to_string()));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build();
        Ok(Self {
            agent,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            organization: config.organization.clone(),
            token: config.token.clone(),
            governor,
        })
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    fn repo_url(&self, repo: &str, rest: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_url, self.organization, repo, rest)
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let req = self
            .agent
            .request(method, url)
            .set("Accept", "application/vnd.github+json")
            .set("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => req.set("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }

    fn observe(&self, response: &ureq::Response) -> Option<RateLimit> {
        let limit = limit_from_headers(
            response.header("x-ratelimit-remaining"),
            response.header("x-ratelimit-reset"),
        );
        if let Some(limit) = limit {
            self.governor.observe(limit);
        }
        limit
    }

    fn send(
        &self,
        req: ureq::Request,
        body: Option<Value>,
        what: &str,
    ) -> Result<ureq::Response, SyncError> {
        let result = match body {
            Some(body) => req.send_json(body),
            None => req.call(),
        };
        match result {
            Ok(response) => {
                self.observe(&response);
                Ok(response)
            }
            Err(ureq::Error::Status(code, response)) => {
                let limit = self.observe(&response);
                let body = response.into_string().unwrap_or_default();
                let err = classify_status(code, &body, limit, what);
                if let SyncError::RateLimited { reset_at } = &err {
                    self.governor.exhausted(*reset_at);
                }
                Err(err)
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(SyncError::Transient(format!("{what}: {transport}")))
            }
        }
    }

    fn json<T: serde::de::DeserializeOwned>(
        &self,
        response: ureq::Response,
        what: &str,
    ) -> Result<T, SyncError> {
        response
            .into_json::<T>()
            .map_err(|e| SyncError::Transient(format!("{what}: unreadable response: {e}")))
    }

    fn file_sha(&self, repo: &str, branch: &str, path: &str) -> Result<Option<String>, SyncError> {
        match self.get_file(repo, branch, path) {
            Ok(file) => Ok(Some(file.sha)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// The contents endpoint answers a directory with an array of entries and a
/// file with a single object.
fn dir_entries(body: Value) -> Result<Vec<TreeEntry>, SyncError> {
    let entries: Vec<DirEntryWire> = if body.is_array() {
        serde_json::from_value(body)?
    } else {
        vec![serde_json::from_value(body)?]
    };
    Ok(entries
        .into_iter()
        .filter_map(|e| match e.kind.as_str() {
            "file" => Some(TreeEntry { path: e.path, kind: EntryKind::Blob }),
            "dir" => Some(TreeEntry { path: e.path, kind: EntryKind::Tree }),
            _ => None,
        })
        .collect())
}

fn decode_content(path: &str, encoded: &str) -> Result<String, SyncError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| SyncError::Malformed { path: path.to_string(), reason: e.to_string() })?;
    String::from_utf8(bytes)
        .map_err(|e| SyncError::Malformed { path: path.to_string(), reason: e.to_string() })
}

fn author_json(author: &CommitAuthor) -> Value {
    json!({ "name": author.name, "email": author.email })
}

fn encode_path(path: &str) -> String {
    path.trim_matches('/')
        .split('/')
        .map(|segment| segment.replace(' ', "%20"))
        .collect::<Vec<_>>()
        .join("/")
}

impl GitHost for GitHubClient {
    fn repository_exists(&self, repo: &str) -> Result<bool, SyncError> {
        match self.get_repository(repo) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create_repository(&self, repo: &str) -> Result<RepoInfo, SyncError> {
        let url = format!("{}/orgs/{}/repos", self.api_url, self.organization);
        let body = json!({ "name": repo, "private": true, "auto_init": true });
        let what = format!("repository {repo}");
        let response = self.send(self.request("POST", &url), Some(body), &what)?;
        let wire: RepoWire = self.json(response, &what)?;
        Ok(RepoInfo { name: wire.name, default_branch: wire.default_branch })
    }

    fn get_repository(&self, repo: &str) -> Result<RepoInfo, SyncError> {
        let what = format!("repository {repo}");
        let response = self.send(self.request("GET", &self.repo_url(repo, "")), None, &what)?;
        let wire: RepoWire = self.json(response, &what)?;
        Ok(RepoInfo { name: wire.name, default_branch: wire.default_branch })
    }

    fn branch_head(&self, repo: &str, branch: &str) -> Result<CommitRef, SyncError> {
        let what = format!("branch {repo}:{branch}");
        let url = self.repo_url(repo, &format!("/branches/{branch}"));
        let wire: BranchWire = self.json(self.send(self.request("GET", &url), None, &what)?, &what)?;
        Ok(CommitRef { sha: wire.commit.sha, tree: wire.commit.commit.tree.sha })
    }

    fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), SyncError> {
        let what = format!("branch {repo}:{branch}");
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": sha });
        self.send(self.request("POST", &self.repo_url(repo, "/git/refs")), Some(body), &what)?;
        Ok(())
    }

    fn delete_branch(&self, repo: &str, branch: &str) -> Result<(), SyncError> {
        let what = format!("branch {repo}:{branch}");
        let url = self.repo_url(repo, &format!("/git/refs/heads/{branch}"));
        self.send(self.request("DELETE", &url), None, &what)?;
        Ok(())
    }

    fn set_default_branch(&self, repo: &str, branch: &str) -> Result<(), SyncError> {
        let what = format!("repository {repo}");
        let body = json!({ "default_branch": branch });
        self.send(self.request("PATCH", &self.repo_url(repo, "")), Some(body), &what)?;
        Ok(())
    }

    fn get_file(&self, repo: &str, git_ref: &str, path: &str) -> Result<RemoteFile, SyncError> {
        let what = format!("file {path}");
        let url = self.repo_url(repo, &format!("/contents/{}", encode_path(path)));
        let req = self.request("GET", &url).query("ref", git_ref);
        let wire: ContentWire = self.json(self.send(req, None, &what)?, &what)?;
        let content = decode_content(&wire.path, &wire.content)?;
        Ok(RemoteFile { path: wire.path, sha: wire.sha, content })
    }

    fn put_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String, SyncError> {
        let what = format!("file {path}");
        let mut body = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "branch": branch,
            "committer": author_json(author),
        });
        if let Some(sha) = self.file_sha(repo, branch, path)? {
            body["sha"] = Value::String(sha);
        }
        let url = self.repo_url(repo, &format!("/contents/{}", encode_path(path)));
        let wire: WriteWire = self.json(self.send(self.request("PUT", &url), Some(body), &what)?, &what)?;
        Ok(wire.commit.sha)
    }

    fn delete_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String, SyncError> {
        let what = format!("file {path}");
        let sha = self
            .file_sha(repo, branch, path)?
            .ok_or_else(|| SyncError::not_found(&what))?;
        let body = json!({
            "message": message,
            "sha": sha,
            "branch": branch,
            "committer": author_json(author),
        });
        let url = self.repo_url(repo, &format!("/contents/{}", encode_path(path)));
        let wire: WriteWire =
            self.json(self.send(self.request("DELETE", &url), Some(body), &what)?, &what)?;
        Ok(wire.commit.sha)
    }

    fn list_dir(&self, repo: &str, git_ref: &str, path: &str) -> Result<Vec<TreeEntry>, SyncError> {
        let what = format!("path {path}");
        let url = self.repo_url(repo, &format!("/contents/{}", encode_path(path)));
        let req = self.request("GET", &url).query("ref", git_ref);
        let body = self.json::<Value>(self.send(req, None, &what)?, &what)?;
        dir_entries(body)
    }

    fn list_files(&self, repo: &str, git_ref: &str) -> Result<Vec<String>, SyncError> {
        let what = format!("tree {git_ref}");
        let url = self.repo_url(repo, &format!("/git/trees/{git_ref}"));
        let req = self.request("GET", &url).query("recursive", "1");
        let wire: TreeWire = self.json(self.send(req, None, &what)?, &what)?;
        if wire.truncated {
            tracing::warn!("tree listing for {repo}@{git_ref} was truncated by the host");
        }
        Ok(wire
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| e.path)
            .collect())
    }

    fn create_tree(
        &self,
        repo: &str,
        base_tree: &str,
        changes: &[TreeChange],
    ) -> Result<String, SyncError> {
        let entries: Vec<Value> = changes
            .iter()
            .map(|change| match change {
                TreeChange::Upsert { path, content } => json!({
                    "path": path, "mode": "100644", "type": "blob", "content": content,
                }),
                TreeChange::Delete { path } => json!({
                    "path": path, "mode": "100644", "type": "blob", "sha": Value::Null,
                }),
            })
            .collect();
        let body = json!({ "base_tree": base_tree, "tree": entries });
        let what = format!("tree on {base_tree}");
        let url = self.repo_url(repo, "/git/trees");
        let wire: ShaWire = self.json(self.send(self.request("POST", &url), Some(body), &what)?, &what)?;
        Ok(wire.sha)
    }

    fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parents: &[String],
        author: &CommitAuthor,
    ) -> Result<String, SyncError> {
        let body = json!({
            "message": message,
            "tree": tree,
            "parents": parents,
            "author": author_json(author),
        });
        let what = format!("commit on {tree}");
        let url = self.repo_url(repo, "/git/commits");
        let wire: ShaWire = self.json(self.send(self.request("POST", &url), Some(body), &what)?, &what)?;
        Ok(wire.sha)
    }

    fn update_ref(&self, repo: &str, branch: &str, sha: &str) -> Result<(), SyncError> {
        let what = format!("ref {branch}");
        let body = json!({ "sha": sha, "force": false });
        let url = self.repo_url(repo, &format!("/git/refs/heads/{branch}"));
        self.send(self.request("PATCH", &url), Some(body), &what)?;
        Ok(())
    }

    fn merge(
        &self,
        repo: &str,
        base: &str,
        head: &str,
        message: &str,
    ) -> Result<MergeOutcome, SyncError> {
        let what = format!("merge {head} into {base}");
        let body = json!({ "base": base, "head": head, "commit_message": message });
        let url = self.repo_url(repo, "/merges");
        let response = match self.send(self.request("POST", &url), Some(body), &what) {
            Ok(response) => response,
            // 409 from the merges endpoint is a content conflict, not an existing object.
            Err(e) if e.is_conflict() => return Err(SyncError::Fatal(format!("{what}: merge conflict"))),
            Err(e) => return Err(e),
        };
        if response.status() == 204 {
            return Ok(MergeOutcome::UpToDate);
        }
        let wire: ShaWire = self.json(response, &what)?;
        Ok(MergeOutcome::Merged { sha: wire.sha })
    }

    fn rate_limit(&self) -> Result<Option<RateLimit>, SyncError> {
        if let Some(limit) = self.governor.last() {
            return Ok(Some(limit));
        }
        let url = format!("{}/rate_limit", self.api_url);
        let wire: RateWire = self.json(self.send(self.request("GET", &url), None, "rate limit")?, "rate limit")?;
        let reset_at: Option<DateTime<Utc>> = Utc.timestamp_opt(wire.resources.core.reset, 0).single();
        let limit = reset_at.map(|reset_at| RateLimit {
            remaining: wire.resources.core.remaining,
            reset_at,
        });
        if let Some(limit) = limit {
            self.governor.observe(limit);
        }
        Ok(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(remaining: u32) -> Option<RateLimit> {
        Some(RateLimit { remaining, reset_at: Utc.timestamp_opt(1_900_000_000, 0).unwrap() })
    }

    #[test]
    fn parses_rate_limit_headers() {
        let parsed = limit_from_headers(Some("42"), Some("1900000000")).unwrap();
        assert_eq!(parsed.remaining, 42);
        assert_eq!(parsed.reset_at.timestamp(), 1_900_000_000);
        assert!(limit_from_headers(None, Some("1")).is_none());
        assert!(limit_from_headers(Some("x"), Some("1")).is_none());
    }

    #[test]
    fn maps_missing_and_existing_objects() {
        assert!(classify_status(404, "", None, "repo").is_not_found());
        assert!(classify_status(409, "", None, "repo").is_conflict());
        let body = r#"{"message":"Repository creation failed.","errors":[{"message":"name already exists on this account"}]}"#;
        assert!(classify_status(422, body, None, "repo").is_conflict());
        assert!(matches!(
            classify_status(422, r#"{"message":"Validation Failed"}"#, None, "repo"),
            SyncError::Fatal(_)
        ));
    }

    #[test]
    fn forbidden_with_exhausted_budget_is_rate_limited() {
        let err = classify_status(403, "", limit(0), "file");
        assert!(matches!(err, SyncError::RateLimited { reset_at } if reset_at.timestamp() == 1_900_000_000));
        assert!(matches!(classify_status(403, "", limit(10), "file"), SyncError::Fatal(_)));
        assert!(matches!(
            classify_status(403, "You have exceeded a secondary rate limit", limit(10), "file"),
            SyncError::RateLimited { .. }
        ));
        assert!(matches!(classify_status(429, "", None, "file"), SyncError::RateLimited { .. }));
    }

    #[test]
    fn server_errors_are_transient() {
        for code in [500, 502, 503] {
            assert!(matches!(classify_status(code, "", None, "x"), SyncError::Transient(_)));
        }
        assert!(matches!(classify_status(400, "bad", None, "x"), SyncError::Fatal(_)));
    }

    #[test]
    fn decodes_wrapped_base64() {
        let encoded = "aGVsbG8g\nd29ybGQ=\n";
        assert_eq!(decode_content("a.md", encoded).unwrap(), "hello world");
        assert!(decode_content("a.md", "***").is_err());
    }

    #[test]
    fn directory_listing_maps_entry_types() {
        let body = serde_json::json!([
            { "name": "a.md", "path": "content/a.md", "type": "file", "sha": "1" },
            { "name": "news", "path": "content/news", "type": "dir", "sha": "2" },
            { "name": "theme", "path": "content/theme", "type": "submodule", "sha": "3" }
        ]);
        assert_eq!(
            dir_entries(body).unwrap(),
            vec![
                TreeEntry { path: "content/a.md".into(), kind: EntryKind::Blob },
                TreeEntry { path: "content/news".into(), kind: EntryKind::Tree },
            ]
        );
    }

    #[test]
    fn file_path_lists_as_single_blob() {
        let body = serde_json::json!({
            "name": "b.md",
            "path": "content/b.md",
            "type": "file",
            "encoding": "base64",
            "content": "LS0tCmlkOiBiCi0tLQo=\n",
            "sha": "3d21ec53a331a6f037a91c368710b99387d012c1"
        });
        assert_eq!(
            dir_entries(body).unwrap(),
            vec![TreeEntry { path: "content/b.md".into(), kind: EntryKind::Blob }]
        );
    }

    #[test]
    fn client_requires_organization() {
        let governor = Arc::new(RateGovernor::new(100, Duration::ZERO));
        assert!(GitHubClient::new(&GitHubConfig::default(), governor).is_err());
    }
}
