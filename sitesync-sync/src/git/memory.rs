//! In-process [`GitHost`] with recorded calls, recorded commits and fault
//! injection. Content-addressed: identical trees share a sha.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};

use crate::error::{ErrorClass, SyncError};
use crate::git::host::{
    CommitAuthor, CommitRef, EntryKind, GitHost, MergeOutcome, RemoteFile, RepoInfo, TreeChange,
    TreeEntry,
};
use crate::retry::RateLimit;

type Files = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Commit {
    tree: String,
    parents: Vec<String>,
}

#[derive(Debug, Default)]
struct Repo {
    default_branch: String,
    branches: BTreeMap<String, String>,
    commits: HashMap<String, Commit>,
    trees: HashMap<String, Files>,
    tree_changes: HashMap<String, Vec<TreeChange>>,
}

/// A commit created through the host API, with the changes it applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub repo: String,
    pub sha: String,
    pub message: String,
    pub author: CommitAuthor,
    pub changes: Vec<TreeChange>,
}

#[derive(Debug, Default)]
struct Inner {
    repos: BTreeMap<String, Repo>,
    calls: Vec<String>,
    faults: Vec<(String, ErrorClass)>,
    commits: Vec<RecordedCommit>,
    counter: u64,
    rate: Option<RateLimit>,
}

#[derive(Debug)]
pub struct MemoryGitHost {
    initial_branch: String,
    inner: Mutex<Inner>,
}

impl Default for MemoryGitHost {
    fn default() -> Self {
        Self::new()
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())[..40].to_string()
}

fn tree_sha(files: &Files) -> String {
    let mut parts = Vec::with_capacity(files.len() * 2);
    for (path, content) in files {
        parts.push(path.as_str());
        parts.push(content.as_str());
    }
    digest(&parts)
}

impl MemoryGitHost {
    /// New repositories start on `main`.
    pub fn new() -> Self {
        Self::with_initial_branch("main")
    }

    /// New repositories start on `branch`, like a host whose organization
    /// default differs from the site's main branch.
    pub fn with_initial_branch(branch: &str) -> Self {
        Self {
            initial_branch: branch.to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fail the next call to `op` with an error of `class`.
    pub fn fail_next(&self, op: &str, class: ErrorClass) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.push((op.to_string(), class));
        }
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().map(|i| i.calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().map(|i| i.calls.len()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.calls.clear();
        }
    }

    /// Commits created through the API for `repo`, oldest first.
    pub fn commits(&self, repo: &str) -> Vec<RecordedCommit> {
        self.inner
            .lock()
            .map(|i| i.commits.iter().filter(|c| c.repo == repo).cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_rate_limit(&self, limit: RateLimit) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rate = Some(limit);
        }
    }

    /// Files on `branch`, for assertions.
    pub fn files(&self, repo: &str, branch: &str) -> Result<Files, SyncError> {
        let inner = self.lock()?;
        let repo = repo_ref(&inner, repo)?;
        let sha = branch_sha(repo, branch)?;
        Ok(repo.trees[&repo.commits[sha].tree].clone())
    }

    pub fn branches(&self, repo: &str) -> Result<Vec<String>, SyncError> {
        let inner = self.lock()?;
        Ok(repo_ref(&inner, repo)?.branches.keys().cloned().collect())
    }

    /// Commit `content` at `path` on `branch` without recording a call.
    pub fn seed_file(&self, repo: &str, branch: &str, path: &str, content: &str) -> Result<(), SyncError> {
        let mut inner = self.lock()?;
        let counter = next_counter(&mut inner);
        let repo = repo_mut(&mut inner, repo)?;
        let head = branch_sha(repo, branch)?.to_string();
        let mut files = repo.trees[&repo.commits[&head].tree].clone();
        files.insert(path.to_string(), content.to_string());
        let tree = store_tree(repo, files);
        let sha = digest(&[tree.as_str(), head.as_str(), "seed", counter.to_string().as_str()]);
        repo.commits.insert(sha.clone(), Commit { tree, parents: vec![head] });
        repo.branches.insert(branch.to_string(), sha);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, SyncError> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Fatal("memory git host poisoned".to_string()))
    }

    /// Record the call and apply any injected fault.
    fn enter(&self, op: &str) -> Result<MutexGuard<'_, Inner>, SyncError> {
        let mut inner = self.lock()?;
        inner.calls.push(op.to_string());
        if let Some(pos) = inner.faults.iter().position(|(o, _)| o == op) {
            let (_, class) = inner.faults.remove(pos);
            return Err(SyncError::of_class(class, format!("injected {op} failure")));
        }
        Ok(inner)
    }
}

fn next_counter(inner: &mut Inner) -> u64 {
    inner.counter += 1;
    inner.counter
}

fn repo_ref<'a>(inner: &'a Inner, repo: &str) -> Result<&'a Repo, SyncError> {
    inner
        .repos
        .get(repo)
        .ok_or_else(|| SyncError::not_found(format!("repository {repo}")))
}

fn repo_mut<'a>(inner: &'a mut Inner, repo: &str) -> Result<&'a mut Repo, SyncError> {
    inner
        .repos
        .get_mut(repo)
        .ok_or_else(|| SyncError::not_found(format!("repository {repo}")))
}

fn branch_sha<'a>(repo: &'a Repo, branch: &str) -> Result<&'a String, SyncError> {
    repo.branches
        .get(branch)
        .ok_or_else(|| SyncError::not_found(format!("branch {branch}")))
}

/// Branch name or commit sha.
fn resolve<'a>(repo: &'a Repo, git_ref: &str) -> Result<&'a Files, SyncError> {
    let sha = match repo.branches.get(git_ref) {
        Some(sha) => sha.as_str(),
        None if repo.commits.contains_key(git_ref) => git_ref,
        None => return Err(SyncError::not_found(format!("ref {git_ref}"))),
    };
    Ok(&repo.trees[&repo.commits[sha].tree])
}

fn store_tree(repo: &mut Repo, files: Files) -> String {
    let sha = tree_sha(&files);
    repo.trees.entry(sha.clone()).or_insert(files);
    sha
}

fn ancestors(repo: &Repo, sha: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([sha.to_string()]);
    while let Some(next) = queue.pop_front() {
        if !seen.insert(next.clone()) {
            continue;
        }
        if let Some(commit) = repo.commits.get(&next) {
            queue.extend(commit.parents.iter().cloned());
        }
    }
    seen
}

/// Nearest common ancestor by breadth-first walk from `a`.
fn merge_base(repo: &Repo, a: &str, b: &str) -> Option<String> {
    let of_b = ancestors(repo, b);
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([a.to_string()]);
    while let Some(next) = queue.pop_front() {
        if of_b.contains(&next) {
            return Some(next);
        }
        if !seen.insert(next.clone()) {
            continue;
        }
        if let Some(commit) = repo.commits.get(&next) {
            queue.extend(commit.parents.iter().cloned());
        }
    }
    None
}

fn apply_changes(mut files: Files, changes: &[TreeChange]) -> Result<Files, SyncError> {
    for change in changes {
        match change {
            TreeChange::Upsert { path, content } => {
                files.insert(path.clone(), content.clone());
            }
            TreeChange::Delete { path } => {
                if files.remove(path).is_none() {
                    return Err(SyncError::Fatal(format!("tree has no entry at {path}")));
                }
            }
        }
    }
    Ok(files)
}

impl MemoryGitHost {
    fn commit_files(
        &self,
        repo_name: &str,
        branch: &str,
        message: &str,
        author: &CommitAuthor,
        change: TreeChange,
        op: &str,
    ) -> Result<String, SyncError> {
        let mut inner = self.enter(op)?;
        let counter = next_counter(&mut inner);
        let repo = repo_mut(&mut inner, repo_name)?;
        let head = branch_sha(repo, branch)?.clone();
        let files = repo.trees[&repo.commits[&head].tree].clone();
        if change.is_delete() && !files.contains_key(change.path()) {
            return Err(SyncError::not_found(format!("file {}", change.path())));
        }
        let files = apply_changes(files, std::slice::from_ref(&change))?;
        let tree = store_tree(repo, files);
        let sha = digest(&[tree.as_str(), head.as_str(), message, counter.to_string().as_str()]);
        repo.commits.insert(sha.clone(), Commit { tree, parents: vec![head] });
        repo.branches.insert(branch.to_string(), sha.clone());
        inner.commits.push(RecordedCommit {
            repo: repo_name.to_string(),
            sha: sha.clone(),
            message: message.to_string(),
            author: author.clone(),
            changes: vec![change],
        });
        Ok(sha)
    }
}

impl GitHost for MemoryGitHost {
    fn repository_exists(&self, repo: &str) -> Result<bool, SyncError> {
        Ok(self.enter("repository_exists")?.repos.contains_key(repo))
    }

    fn create_repository(&self, repo_name: &str) -> Result<RepoInfo, SyncError> {
        let mut inner = self.enter("create_repository")?;
        if inner.repos.contains_key(repo_name) {
            return Err(SyncError::conflict(format!("repository {repo_name}")));
        }
        let mut repo = Repo {
            default_branch: self.initial_branch.clone(),
            ..Repo::default()
        };
        let files = Files::from([("README.md".to_string(), format!("# {repo_name}\n"))]);
        let tree = store_tree(&mut repo, files);
        let sha = digest(&[tree.as_str(), "initial commit", repo_name]);
        repo.commits.insert(sha.clone(), Commit { tree, parents: vec![] });
        repo.branches.insert(self.initial_branch.clone(), sha);
        inner.repos.insert(repo_name.to_string(), repo);
        Ok(RepoInfo {
            name: repo_name.to_string(),
            default_branch: self.initial_branch.clone(),
        })
    }

    fn get_repository(&self, repo: &str) -> Result<RepoInfo, SyncError> {
        let inner = self.enter("get_repository")?;
        let found = repo_ref(&inner, repo)?;
        Ok(RepoInfo {
            name: repo.to_string(),
            default_branch: found.default_branch.clone(),
        })
    }

    fn branch_head(&self, repo: &str, branch: &str) -> Result<CommitRef, SyncError> {
        let inner = self.enter("branch_head")?;
        let repo = repo_ref(&inner, repo)?;
        let sha = branch_sha(repo, branch)?;
        Ok(CommitRef {
            sha: sha.clone(),
            tree: repo.commits[sha].tree.clone(),
        })
    }

    fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> Result<(), SyncError> {
        let mut inner = self.enter("create_branch")?;
        let repo = repo_mut(&mut inner, repo)?;
        if repo.branches.contains_key(branch) {
            return Err(SyncError::conflict(format!("branch {branch}")));
        }
        if !repo.commits.contains_key(sha) {
            return Err(SyncError::not_found(format!("commit {sha}")));
        }
        repo.branches.insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    fn delete_branch(&self, repo: &str, branch: &str) -> Result<(), SyncError> {
        let mut inner = self.enter("delete_branch")?;
        let repo = repo_mut(&mut inner, repo)?;
        if repo.default_branch == branch {
            return Err(SyncError::Fatal(format!("cannot delete default branch {branch}")));
        }
        repo.branches
            .remove(branch)
            .map(|_| ())
            .ok_or_else(|| SyncError::not_found(format!("branch {branch}")))
    }

    fn set_default_branch(&self, repo: &str, branch: &str) -> Result<(), SyncError> {
        let mut inner = self.enter("set_default_branch")?;
        let repo = repo_mut(&mut inner, repo)?;
        branch_sha(repo, branch)?;
        repo.default_branch = branch.to_string();
        Ok(())
    }

    fn get_file(&self, repo: &str, git_ref: &str, path: &str) -> Result<RemoteFile, SyncError> {
        let inner = self.enter("get_file")?;
        let files = resolve(repo_ref(&inner, repo)?, git_ref)?;
        let content = files
            .get(path)
            .ok_or_else(|| SyncError::not_found(format!("file {path}")))?;
        Ok(RemoteFile {
            path: path.to_string(),
            sha: digest(&[content.as_str()]),
            content: content.clone(),
        })
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
        let change = TreeChange::Upsert {
            path: path.to_string(),
            content: content.to_string(),
        };
        self.commit_files(repo, branch, message, author, change, "put_file")
    }

    fn delete_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String, SyncError> {
        let change = TreeChange::Delete { path: path.to_string() };
        self.commit_files(repo, branch, message, author, change, "delete_file")
    }

    fn list_dir(&self, repo: &str, git_ref: &str, path: &str) -> Result<Vec<TreeEntry>, SyncError> {
        let inner = self.enter("list_dir")?;
        let files = resolve(repo_ref(&inner, repo)?, git_ref)?;
        let dir = path.trim_matches('/');
        if files.contains_key(dir) {
            return Ok(vec![TreeEntry { path: dir.to_string(), kind: EntryKind::Blob }]);
        }
        let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };

        let mut entries = BTreeMap::new();
        for file in files.keys() {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((sub, _)) => {
                    entries.insert(format!("{prefix}{sub}"), EntryKind::Tree);
                }
                None => {
                    entries.insert(file.clone(), EntryKind::Blob);
                }
            }
        }
        if entries.is_empty() && !dir.is_empty() {
            return Err(SyncError::not_found(format!("path {dir}")));
        }
        Ok(entries
            .into_iter()
            .map(|(path, kind)| TreeEntry { path, kind })
            .collect())
    }

    fn list_files(&self, repo: &str, git_ref: &str) -> Result<Vec<String>, SyncError> {
        let inner = self.enter("list_files")?;
        Ok(resolve(repo_ref(&inner, repo)?, git_ref)?.keys().cloned().collect())
    }

    fn create_tree(
        &self,
        repo: &str,
        base_tree: &str,
        changes: &[TreeChange],
    ) -> Result<String, SyncError> {
        let mut inner = self.enter("create_tree")?;
        let repo = repo_mut(&mut inner, repo)?;
        let base = repo
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("tree {base_tree}")))?;
        let files = apply_changes(base, changes)?;
        let sha = store_tree(repo, files);
        if sha != base_tree {
            repo.tree_changes.insert(sha.clone(), changes.to_vec());
        }
        Ok(sha)
    }

    fn create_commit(
        &self,
        repo_name: &str,
        message: &str,
        tree: &str,
        parents: &[String],
        author: &CommitAuthor,
    ) -> Result<String, SyncError> {
        let mut inner = self.enter("create_commit")?;
        let counter = next_counter(&mut inner);
        let repo = repo_mut(&mut inner, repo_name)?;
        if !repo.trees.contains_key(tree) {
            return Err(SyncError::not_found(format!("tree {tree}")));
        }
        if let Some(missing) = parents.iter().find(|p| !repo.commits.contains_key(*p)) {
            return Err(SyncError::not_found(format!("commit {missing}")));
        }
        let sha = digest(&[tree, parents.join(",").as_str(), message, counter.to_string().as_str()]);
        repo.commits.insert(
            sha.clone(),
            Commit {
                tree: tree.to_string(),
                parents: parents.to_vec(),
            },
        );
        let changes = repo.tree_changes.get(tree).cloned().unwrap_or_default();
        inner.commits.push(RecordedCommit {
            repo: repo_name.to_string(),
            sha: sha.clone(),
            message: message.to_string(),
            author: author.clone(),
            changes,
        });
        Ok(sha)
    }

    fn update_ref(&self, repo: &str, branch: &str, sha: &str) -> Result<(), SyncError> {
        let mut inner = self.enter("update_ref")?;
        let repo = repo_mut(&mut inner, repo)?;
        let current = branch_sha(repo, branch)?.clone();
        if !repo.commits.contains_key(sha) {
            return Err(SyncError::not_found(format!("commit {sha}")));
        }
        if !ancestors(repo, sha).contains(&current) {
            return Err(SyncError::Fatal(format!(
                "update of {branch} to {sha} is not a fast forward"
            )));
        }
        repo.branches.insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    fn merge(
        &self,
        repo_name: &str,
        base: &str,
        head: &str,
        message: &str,
    ) -> Result<MergeOutcome, SyncError> {
        let mut inner = self.enter("merge")?;
        let counter = next_counter(&mut inner);
        let repo = repo_mut(&mut inner, repo_name)?;
        let base_sha = branch_sha(repo, base)?.clone();
        let head_sha = branch_sha(repo, head)?.clone();

        if ancestors(repo, &base_sha).contains(&head_sha) {
            return Ok(MergeOutcome::UpToDate);
        }
        if ancestors(repo, &head_sha).contains(&base_sha) {
            repo.branches.insert(base.to_string(), head_sha.clone());
            return Ok(MergeOutcome::Merged { sha: head_sha });
        }

        let empty = Files::new();
        let ancestor = merge_base(repo, &base_sha, &head_sha)
            .map(|sha| repo.trees[&repo.commits[&sha].tree].clone())
            .unwrap_or(empty);
        let ours = repo.trees[&repo.commits[&base_sha].tree].clone();
        let theirs = repo.trees[&repo.commits[&head_sha].tree].clone();

        let mut merged = ours.clone();
        let paths: BTreeSet<&String> = ancestor.keys().chain(theirs.keys()).collect();
        for path in paths {
            let (a, o, t) = (ancestor.get(path), ours.get(path), theirs.get(path));
            if t == a || t == o {
                continue;
            }
            if o != a {
                return Err(SyncError::Fatal(format!("merge conflict in {path}")));
            }
            match t {
                Some(content) => merged.insert(path.clone(), content.clone()),
                None => merged.remove(path),
            };
        }

        let tree = store_tree(repo, merged);
        let sha = digest(&[
            tree.as_str(),
            base_sha.as_str(),
            head_sha.as_str(),
            message,
            counter.to_string().as_str(),
        ]);
        repo.commits.insert(
            sha.clone(),
            Commit {
                tree,
                parents: vec![base_sha, head_sha],
            },
        );
        repo.branches.insert(base.to_string(), sha.clone());
        Ok(MergeOutcome::Merged { sha })
    }

    fn rate_limit(&self) -> Result<Option<RateLimit>, SyncError> {
        Ok(self.enter("rate_limit")?.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> CommitAuthor {
        CommitAuthor::default()
    }

    #[test]
    fn create_repository_twice_conflicts() {
        let host = MemoryGitHost::new();
        host.create_repository("site").unwrap();
        let err = host.create_repository("site").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn list_dir_groups_subdirectories() {
        let host = MemoryGitHost::new();
        host.create_repository("site").unwrap();
        host.seed_file("site", "main", "content/a.md", "a").unwrap();
        host.seed_file("site", "main", "content/news/b.md", "b").unwrap();

        let entries = host.list_dir("site", "main", "content").unwrap();
        assert_eq!(
            entries,
            vec![
                TreeEntry { path: "content/a.md".into(), kind: EntryKind::Blob },
                TreeEntry { path: "content/news".into(), kind: EntryKind::Tree },
            ]
        );
        assert!(host.list_dir("site", "main", "nope").unwrap_err().is_not_found());
        assert_eq!(
            host.list_dir("site", "main", "content/a.md").unwrap(),
            vec![TreeEntry { path: "content/a.md".into(), kind: EntryKind::Blob }]
        );
    }

    #[test]
    fn identical_trees_share_sha() {
        let host = MemoryGitHost::new();
        host.create_repository("site").unwrap();
        let head = host.branch_head("site", "main").unwrap();
        let same = host
            .create_tree(
                "site",
                &head.tree,
                &[TreeChange::Upsert { path: "README.md".into(), content: "# site\n".into() }],
            )
            .unwrap();
        assert_eq!(same, head.tree);
    }

    #[test]
    fn merge_fast_forwards_then_reports_up_to_date() {
        let host = MemoryGitHost::new();
        host.create_repository("site").unwrap();
        let head = host.branch_head("site", "main").unwrap();
        host.create_branch("site", "preview", &head.sha).unwrap();
        host.put_file("site", "main", "content/a.md", "a", "add a", &author()).unwrap();

        assert!(matches!(
            host.merge("site", "preview", "main", "merge").unwrap(),
            MergeOutcome::Merged { .. }
        ));
        assert_eq!(host.files("site", "preview").unwrap().get("content/a.md").unwrap(), "a");
        assert_eq!(
            host.merge("site", "preview", "main", "merge").unwrap(),
            MergeOutcome::UpToDate
        );
    }

    #[test]
    fn three_way_merge_combines_disjoint_edits() {
        let host = MemoryGitHost::new();
        host.create_repository("site").unwrap();
        let head = host.branch_head("site", "main").unwrap();
        host.create_branch("site", "preview", &head.sha).unwrap();
        host.put_file("site", "main", "a.md", "a", "a", &author()).unwrap();
        host.put_file("site", "preview", "b.md", "b", "b", &author()).unwrap();

        host.merge("site", "preview", "main", "merge").unwrap();
        let files = host.files("site", "preview").unwrap();
        assert!(files.contains_key("a.md") && files.contains_key("b.md"));
    }

    #[test]
    fn update_ref_rejects_non_fast_forward() {
        let host = MemoryGitHost::new();
        host.create_repository("site").unwrap();
        let base = host.branch_head("site", "main").unwrap();
        let commit_on_base = |path: &str| {
            let tree = host
                .create_tree(
                    "site",
                    &base.tree,
                    &[TreeChange::Upsert { path: path.into(), content: path.into() }],
                )
                .unwrap();
            host.create_commit("site", path, &tree, &[base.sha.clone()], &author())
                .unwrap()
        };
        let first = commit_on_base("content/a.md");
        let second = commit_on_base("content/b.md");

        host.update_ref("site", "main", &first).unwrap();
        let err = host.update_ref("site", "main", &second).unwrap_err();
        assert!(matches!(err, SyncError::Fatal(_)));
        assert!(host.files("site", "main").unwrap().contains_key("content/a.md"));
    }

    #[test]
    fn injected_fault_fires_once() {
        let host = MemoryGitHost::new();
        host.fail_next("repository_exists", ErrorClass::Transient);
        assert!(host.repository_exists("site").is_err());
        assert!(!host.repository_exists("site").unwrap());
        assert_eq!(host.call_count(), 2);
    }
}
