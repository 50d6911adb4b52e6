//! Git-hosted implementation of [`BackendSync`].
//!
//! One repository per site, named by [`Site::repo_name`], with main, draft
//! and live branches. Content is committed to main; publishing merges main
//! forward into draft and live.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;

use sitesync_core::{
    ConfigItem, ContentId, ContentItem, ContentStatus, ContentStore, FileFormat, Site, SyncState,
};

use crate::backend::{
    item_for_state, write_back, BackendFile, BackendProvider, BackendSync, ImportMode,
    ImportReport, SyncReport, SyncResult,
};
use crate::checksum::ChecksumTracker;
use crate::error::{conflict_ok, Classify, ErrorClass, SyncError};
use crate::format::{deserialize, serialize, LinkMap};
use crate::git::host::{CommitAuthor, CommitRef, EntryKind, GitHost, MergeOutcome, RepoInfo, TreeChange};
use crate::paths::{is_infrastructure, resolve_path, split_page_path, under_root};
use crate::retry::{RateGovernor, RetryPolicy};

pub struct GitBackend {
    site: Site,
    repo: String,
    host: Arc<dyn GitHost>,
    store: Arc<dyn ContentStore>,
    tracker: ChecksumTracker,
    retry: RetryPolicy,
    governor: Arc<RateGovernor>,
}

/// Changes and pending writebacks for one commit author.
#[derive(Default)]
struct AuthorBatch {
    changes: BTreeMap<String, TreeChange>,
    results: Vec<SyncResult>,
}

impl AuthorBatch {
    fn upsert(&mut self, path: &str, content: String) {
        self.changes.insert(
            path.to_string(),
            TreeChange::Upsert { path: path.to_string(), content },
        );
    }

    /// An upsert at the same path wins over a delete.
    fn delete(&mut self, path: &str) {
        self.changes
            .entry(path.to_string())
            .or_insert_with(|| TreeChange::Delete { path: path.to_string() });
    }
}

impl GitBackend {
    pub fn new(
        site: Site,
        host: Arc<dyn GitHost>,
        store: Arc<dyn ContentStore>,
        retry: RetryPolicy,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            repo: site.repo_name(),
            tracker: ChecksumTracker::new(store.clone()),
            site,
            host,
            store,
            retry,
            governor,
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn host(&self) -> &dyn GitHost {
        self.host.as_ref()
    }

    fn main_branch(&self) -> &str {
        &self.site.branches.main
    }

    /// Retry transient failures; record rate limits with the governor.
    fn call<T>(&self, label: &str, op: impl FnMut() -> Result<T, SyncError>) -> Result<T, SyncError> {
        let result = self.retry.run(label, op);
        if let Err(SyncError::RateLimited { reset_at }) = &result {
            self.governor.exhausted(*reset_at);
        }
        result
    }

    /// [`call`](Self::call) paced by the governor, for bulk paths.
    fn bulk_call<T>(&self, label: &str, op: impl FnMut() -> Result<T, SyncError>) -> Result<T, SyncError> {
        self.governor.throttle();
        self.call(label, op)
    }

    fn links(&self) -> Result<LinkMap, SyncError> {
        let items = self.store.list_items(&self.site.name)?;
        Ok(LinkMap::from_items(&self.site.config, &items))
    }

    /// Resolved backend path and serialized content of an item.
    pub fn render_item(&self, item: &ContentItem, links: &LinkMap) -> Result<(String, String), SyncError> {
        let path = resolve_path(&self.site.config, item)?;
        let format = self
            .site
            .config
            .item_for(&item.content_type)
            .and_then(ConfigItem::format)
            .ok_or_else(|| SyncError::Unresolvable {
                content_id: item.id.0.clone(),
                reason: format!("no file format for {path}"),
            })?;
        let content = serialize(item, format, links)?;
        Ok((path, content))
    }

    fn author_of(item: Option<&ContentItem>) -> CommitAuthor {
        item.and_then(|i| i.author.as_ref())
            .map(CommitAuthor::from)
            .unwrap_or_default()
    }

    fn ensure_branch(&self, branch: &str, sha: &str) -> Result<(), SyncError> {
        conflict_ok(
            self.call("create_branch", || self.host.create_branch(&self.repo, branch, sha)),
            || (),
        )
    }

    /// Create main/draft/live from the repository's initial commit. A
    /// differing default branch is replaced, not renamed.
    fn provision_branches(&self, info: &RepoInfo) -> Result<(), SyncError> {
        let branches = &self.site.branches;
        let head = self.call("branch_head", || {
            self.host.branch_head(&self.repo, &info.default_branch)
        })?;

        if info.default_branch != branches.main {
            self.ensure_branch(&branches.main, &head.sha)?;
            self.call("set_default_branch", || {
                self.host.set_default_branch(&self.repo, &branches.main)
            })?;
            match self.call("delete_branch", || {
                self.host.delete_branch(&self.repo, &info.default_branch)
            }) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            tracing::info!(
                "{}: replaced default branch {} with {}",
                self.repo,
                info.default_branch,
                branches.main
            );
        }

        self.ensure_branch(&branches.draft, &head.sha)?;
        self.ensure_branch(&branches.live, &head.sha)?;
        Ok(())
    }

    fn merge_into(&self, branch: &str) -> Result<(), SyncError> {
        let message = format!("Promote {} into {branch}", self.main_branch());
        let outcome = self.call("merge", || {
            self.host.merge(&self.repo, branch, self.main_branch(), &message)
        })?;
        match outcome {
            MergeOutcome::Merged { sha } => tracing::info!("{}: merged into {branch} at {sha}", self.repo),
            MergeOutcome::UpToDate => tracing::debug!("{}: {branch} already up to date", self.repo),
        }
        Ok(())
    }

    /// Commit `changes` on top of `parent` and move main. Returns `None`
    /// when the resulting tree equals the parent's.
    fn commit_changes(
        &self,
        parent: &CommitRef,
        changes: &[TreeChange],
        message: &str,
        author: &CommitAuthor,
    ) -> Result<Option<CommitRef>, SyncError> {
        let tree = self.bulk_call("create_tree", || {
            self.host.create_tree(&self.repo, &parent.tree, changes)
        })?;
        if tree == parent.tree {
            tracing::debug!("{}: tree unchanged, skipping commit", self.repo);
            return Ok(None);
        }
        let parents = [parent.sha.clone()];
        let sha = self.bulk_call("create_commit", || {
            self.host.create_commit(&self.repo, message, &tree, &parents, author)
        })?;
        self.bulk_call("update_ref", || self.host.update_ref(&self.repo, self.main_branch(), &sha))?;
        Ok(Some(CommitRef { sha, tree }))
    }

    /// Write one active item with its own commit, removing a stale previous
    /// path.
    fn push_item(
        &self,
        state: &SyncState,
        item: &ContentItem,
        verb: &str,
    ) -> Result<Option<SyncResult>, SyncError> {
        let (path, content) = self.render_item(item, &self.links()?)?;
        let author = Self::author_of(Some(item));
        let message = format!("{verb} {path}");
        let put = || {
            self.host
                .put_file(&self.repo, self.main_branch(), &path, &content, &message, &author)
        };

        match self.call("put_file", put) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                tracing::info!("{}: backend missing, creating before retry", self.repo);
                self.create_website_in_backend()?;
                self.call("put_file", put)?;
            }
            Err(e) => return Err(e),
        }

        if let Some(previous) = state.backend_path().filter(|p| *p != path) {
            self.remove_file(previous, &author)?;
        }

        let result = SyncResult {
            content_id: state.content_id.clone(),
            path: Some(path),
            checksum: state.current_checksum.clone(),
            deleted: false,
        };
        write_back(self.store.as_ref(), &self.site, std::slice::from_ref(&result))?;
        Ok(Some(result))
    }

    /// Delete a file; an already-missing file is fine.
    fn remove_file(&self, path: &str, author: &CommitAuthor) -> Result<(), SyncError> {
        let message = format!("Delete {path}");
        match self.call("delete_file", || {
            self.host
                .delete_file(&self.repo, self.main_branch(), path, &message, author)
        }) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!("{}: {path} already absent", self.repo);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Format and content type for a backend path, or `None` when no config
    /// item claims it.
    fn classify_path(&self, path: &str) -> Option<(FileFormat, Vec<&ConfigItem>)> {
        let config = &self.site.config;
        if let Some(item) = config.data_item_for_path(path) {
            return item.format().map(|format| (format, vec![item]));
        }
        if !under_root(config, path) {
            return None;
        }
        let pages = config.page_items_for_path(path);
        if pages.is_empty() {
            None
        } else {
            Some((FileFormat::Markdown, pages))
        }
    }

    fn import_file(
        &self,
        file: &BackendFile,
        mode: ImportMode,
        links: &LinkMap,
    ) -> Result<(ContentId, bool), SyncError> {
        let malformed = |reason: &str| SyncError::Malformed {
            path: file.path.clone(),
            reason: reason.to_string(),
        };
        let (format, candidates) = self
            .classify_path(&file.path)
            .ok_or_else(|| malformed("no config item matches this path"))?;
        let parsed = deserialize(&file.path, &file.content, format, links)?;

        let content_type = parsed
            .content_type
            .as_deref()
            .and_then(|t| candidates.iter().find(|c| c.content_type() == t))
            .or_else(|| candidates.first())
            .map(|c| c.content_type().to_string())
            .ok_or_else(|| malformed("no content type"))?;

        let existing = self.store.get_item(&self.site.name, &parsed.id)?;
        let created = existing.is_none();
        let mut item = existing
            .clone()
            .unwrap_or_else(|| ContentItem::new(self.site.name.clone(), parsed.id.clone(), &content_type));
        item.content_type = content_type;
        item.title = parsed.title;
        item.metadata = parsed.metadata;
        item.body = parsed.body;
        item.status = ContentStatus::Active;
        if format == FileFormat::Markdown {
            let (dirpath, filename) = split_page_path(&self.site.config, &file.path)
                .ok_or_else(|| malformed("not a page path"))?;
            item.dirpath = dirpath;
            item.filename = filename;
        }

        if existing.as_ref() == Some(&item) {
            self.tracker.upsert(&item)?;
        } else {
            item.updated_at = Utc::now();
            self.tracker.save(&item)?;
        }

        if mode == ImportMode::Authoritative {
            self.store.upsert_sync_state(&self.site.name, &item.id, &mut |state| {
                state.synced_checksum = Some(state.current_checksum.clone());
                state.set_backend_path(&file.path);
            })?;
        }
        Ok((item.id, created))
    }

    /// Breadth-first listing of importable files under `start`.
    fn walk(&self, git_ref: &str, start: &str) -> Result<Vec<String>, SyncError> {
        let mut files = Vec::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(dir) = queue.pop_front() {
            let entries =
                self.bulk_call("list_dir", || self.host.list_dir(&self.repo, git_ref, &dir))?;
            for entry in entries {
                match entry.kind {
                    EntryKind::Tree => queue.push_back(entry.path),
                    EntryKind::Blob if is_infrastructure(&entry.path) => {}
                    EntryKind::Blob => files.push(entry.path),
                }
            }
        }
        Ok(files)
    }
}

impl BackendSync for GitBackend {
    fn site(&self) -> &Site {
        &self.site
    }

    fn store(&self) -> &dyn ContentStore {
        self.store.as_ref()
    }

    fn backend_exists(&self) -> Result<bool, SyncError> {
        self.call("repository_exists", || self.host.repository_exists(&self.repo))
    }

    fn create_website_in_backend(&self) -> Result<(), SyncError> {
        let info = if self.backend_exists()? {
            self.call("get_repository", || self.host.get_repository(&self.repo))?
        } else {
            match self.call("create_repository", || self.host.create_repository(&self.repo)) {
                Ok(info) => {
                    tracing::info!("created repository {}", self.repo);
                    info
                }
                Err(e) if e.is_conflict() => {
                    let info = self.call("get_repository", || self.host.get_repository(&self.repo))?;
                    if !info.name.eq_ignore_ascii_case(&self.repo) {
                        return Err(SyncError::Fatal(format!(
                            "repository {} resolved to {} after conflict",
                            self.repo, info.name
                        )));
                    }
                    info
                }
                Err(e) => return Err(e),
            }
        };
        self.provision_branches(&info)
    }

    fn merge_draft(&self) -> Result<(), SyncError> {
        let report = self.sync_all_content(None)?;
        if !report.is_clean() {
            tracing::warn!(
                "{}: {} item(s) failed to sync before draft merge",
                self.site.name,
                report.failed.len()
            );
        }
        self.merge_into(&self.site.branches.draft)
    }

    fn merge_live(&self) -> Result<(), SyncError> {
        self.merge_draft()?;
        self.merge_into(&self.site.branches.live)
    }

    fn create_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError> {
        if state.is_synced() {
            return Ok(None);
        }
        match item_for_state(self, state)? {
            Some(item) if !item.is_deleted() => self.push_item(state, &item, "Create"),
            _ => self.delete_content(state),
        }
    }

    fn update_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError> {
        if state.is_synced() {
            return Ok(None);
        }
        match item_for_state(self, state)? {
            Some(item) if !item.is_deleted() => self.push_item(state, &item, "Update"),
            _ => self.delete_content(state),
        }
    }

    fn delete_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError> {
        if state.is_synced() {
            return Ok(None);
        }
        let item = item_for_state(self, state)?;
        if let Some(path) = state.backend_path() {
            self.remove_file(path, &Self::author_of(item.as_ref()))?;
        }
        let result = SyncResult {
            content_id: state.content_id.clone(),
            path: state.backend_path().map(str::to_string),
            checksum: state.current_checksum.clone(),
            deleted: true,
        };
        write_back(self.store.as_ref(), &self.site, std::slice::from_ref(&result))?;
        Ok(Some(result))
    }

    /// One tree and one commit per distinct author of the dirty states.
    fn sync_all_content(&self, filter: Option<&[ContentId]>) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let dirty: Vec<SyncState> = self
            .store
            .list_sync_states(&self.site.name)?
            .into_iter()
            .filter(|s| filter.map_or(true, |ids| ids.contains(&s.content_id)))
            .filter(|s| !s.is_synced())
            .collect();
        if dirty.is_empty() {
            return Ok(report);
        }

        let items: BTreeMap<ContentId, ContentItem> = self
            .store
            .list_items(&self.site.name)?
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        let all_items: Vec<ContentItem> = items.values().cloned().collect();
        let links = LinkMap::from_items(&self.site.config, &all_items);

        let mut batches: BTreeMap<CommitAuthor, AuthorBatch> = BTreeMap::new();
        for state in &dirty {
            let item = items.get(&state.content_id);
            let batch = batches.entry(Self::author_of(item)).or_default();
            match item {
                Some(item) if !item.is_deleted() => match self.render_item(item, &links) {
                    Ok((path, content)) => {
                        if let Some(previous) = state.backend_path().filter(|p| *p != path) {
                            batch.delete(previous);
                        }
                        batch.upsert(&path, content);
                        batch.results.push(SyncResult {
                            content_id: state.content_id.clone(),
                            path: Some(path),
                            checksum: state.current_checksum.clone(),
                            deleted: false,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            "skipping {}/{} (path {}): {e}",
                            self.site.name,
                            state.content_id,
                            state.backend_path().unwrap_or("-")
                        );
                        report.failed.push((state.content_id.clone(), e.to_string()));
                    }
                },
                _ => {
                    if let Some(previous) = state.backend_path() {
                        batch.delete(previous);
                    }
                    batch.results.push(SyncResult {
                        content_id: state.content_id.clone(),
                        path: state.backend_path().map(str::to_string),
                        checksum: state.current_checksum.clone(),
                        deleted: true,
                    });
                }
            }
        }

        // A path written by any batch must not be deleted by another.
        let written: BTreeSet<String> = batches
            .values()
            .flat_map(|b| b.changes.values())
            .filter(|c| !c.is_delete())
            .map(|c| c.path().to_string())
            .collect();

        let mut parent = self.bulk_call("branch_head", || {
            self.host.branch_head(&self.repo, self.main_branch())
        })?;
        let mut present: BTreeSet<String> = self
            .bulk_call("list_files", || self.host.list_files(&self.repo, &parent.sha))?
            .into_iter()
            .collect();

        for (author, batch) in batches {
            let changes: Vec<TreeChange> = batch
                .changes
                .into_values()
                .filter(|c| !c.is_delete() || (present.contains(c.path()) && !written.contains(c.path())))
                .collect();

            if !changes.is_empty() {
                let message = format!("Sync {} file(s) from sitesync", changes.len());
                match self.commit_changes(&parent, &changes, &message, &author) {
                    Ok(Some(next)) => {
                        parent = next;
                        report.commits += 1;
                    }
                    Ok(None) => {}
                    Err(e) if e.class() == ErrorClass::RateLimited => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            "{}: commit for {} failed, {} item(s) left dirty: {e}",
                            self.repo,
                            author.email,
                            batch.results.len()
                        );
                        for result in &batch.results {
                            report.failed.push((result.content_id.clone(), e.to_string()));
                        }
                        continue;
                    }
                }
                for change in &changes {
                    match change {
                        TreeChange::Upsert { path, .. } => present.insert(path.clone()),
                        TreeChange::Delete { path } => present.remove(path),
                    };
                }
            }

            write_back(self.store.as_ref(), &self.site, &batch.results)?;
            for result in &batch.results {
                report.record(result);
            }
        }

        tracing::info!(
            "{}: synced {}, deleted {}, failed {} in {} commit(s)",
            self.site.name,
            report.synced.len(),
            report.deleted.len(),
            report.failed.len(),
            report.commits
        );
        Ok(report)
    }

    fn delete_orphaned_content(&self) -> Result<Vec<String>, SyncError> {
        let config = &self.site.config;
        let mut expected: BTreeSet<String> = self
            .store
            .list_items(&self.site.name)?
            .iter()
            .filter(|item| !item.is_deleted())
            .filter_map(|item| resolve_path(config, item).ok())
            .collect();
        expected.extend(
            self.store
                .list_sync_states(&self.site.name)?
                .iter()
                .filter_map(|s| s.backend_path().map(str::to_string)),
        );

        let head = self.bulk_call("branch_head", || {
            self.host.branch_head(&self.repo, self.main_branch())
        })?;
        let orphans: Vec<String> = self
            .bulk_call("list_files", || self.host.list_files(&self.repo, &head.sha))?
            .into_iter()
            .filter(|path| under_root(config, path))
            .filter(|path| !is_infrastructure(path) && !expected.contains(path))
            .collect();
        if orphans.is_empty() {
            return Ok(orphans);
        }

        let changes: Vec<TreeChange> = orphans
            .iter()
            .map(|path| TreeChange::Delete { path: path.clone() })
            .collect();
        let message = format!("Remove {} orphaned file(s)", orphans.len());
        self.commit_changes(&head, &changes, &message, &CommitAuthor::default())?;
        tracing::info!("{}: removed {} orphaned file(s)", self.repo, orphans.len());
        Ok(orphans)
    }

    fn create_content_in_store(
        &self,
        file: &BackendFile,
        mode: ImportMode,
    ) -> Result<ContentId, SyncError> {
        Ok(self.import_file(file, mode, &self.links()?)?.0)
    }

    fn update_content_in_store(
        &self,
        file: &BackendFile,
        mode: ImportMode,
    ) -> Result<ContentId, SyncError> {
        Ok(self.import_file(file, mode, &self.links()?)?.0)
    }

    fn delete_content_in_store(&self, id: &ContentId) -> Result<bool, SyncError> {
        Ok(self.store.hard_delete_item(&self.site.name, id)?)
    }

    fn sync_all_content_to_store(
        &self,
        git_ref: Option<&str>,
        path: Option<&str>,
    ) -> Result<ImportReport, SyncError> {
        let mode = if git_ref.is_none() && path.is_none() {
            ImportMode::Authoritative
        } else {
            ImportMode::Scoped
        };
        let git_ref = git_ref.unwrap_or(self.main_branch());
        let start = path.map(|p| p.trim_matches('/')).unwrap_or("");

        let files: Vec<String> = self
            .walk(git_ref, start)?
            .into_iter()
            .filter(|p| self.classify_path(p).is_some())
            .collect();
        // pages first, so menu links can resolve against them
        let (data, pages): (Vec<String>, Vec<String>) = files
            .into_iter()
            .partition(|p| self.site.config.data_item_for_path(p).is_some());

        let mut report = ImportReport::default();
        let mut seen = BTreeSet::new();
        // files whose id is unknown because they could not be read
        let mut unread = 0usize;
        for group in [pages, data] {
            let links = self.links()?;
            for path in group {
                let file = match self.bulk_call("get_file", || self.host.get_file(&self.repo, git_ref, &path)) {
                    Ok(remote) => BackendFile { path: remote.path, content: remote.content },
                    Err(e) if e.class() == ErrorClass::RateLimited => return Err(e),
                    Err(e) => {
                        unread += 1;
                        report.skipped.push((path, e.to_string()));
                        continue;
                    }
                };
                match self.import_file(&file, mode, &links) {
                    Ok((id, created)) => {
                        seen.insert(id.clone());
                        if created {
                            report.created.push(id);
                        } else {
                            report.updated.push(id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("{}: not importing {}: {e}", self.site.name, file.path);
                        if !e.is_bad_content() {
                            unread += 1;
                        }
                        report.skipped.push((file.path, e.to_string()));
                    }
                }
            }
        }

        if mode == ImportMode::Authoritative {
            if unread == 0 {
                for item in self.store.list_items(&self.site.name)? {
                    if !seen.contains(&item.id) && self.delete_content_in_store(&item.id)? {
                        report.deleted.push(item.id);
                    }
                }
            } else {
                tracing::warn!(
                    "{}: {unread} file(s) could not be read, keeping unseen store items",
                    self.site.name
                );
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Builds [`GitBackend`]s sharing one host client and governor.
pub struct GitBackendProvider {
    host: Arc<dyn GitHost>,
    store: Arc<dyn ContentStore>,
    retry: RetryPolicy,
    governor: Arc<RateGovernor>,
}

impl GitBackendProvider {
    pub fn new(
        host: Arc<dyn GitHost>,
        store: Arc<dyn ContentStore>,
        retry: RetryPolicy,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self { host, store, retry, governor }
    }

    pub fn git_backend(&self, site: &Site) -> GitBackend {
        GitBackend::new(
            site.clone(),
            self.host.clone(),
            self.store.clone(),
            self.retry.clone(),
            self.governor.clone(),
        )
    }
}

impl BackendProvider for GitBackendProvider {
    fn backend_for(&self, site: &Site) -> Result<Box<dyn BackendSync>, SyncError> {
        Ok(Box::new(self.git_backend(site)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_wins_over_delete_at_same_path() {
        let mut batch = AuthorBatch::default();
        batch.upsert("content/a.md", "new".into());
        batch.delete("content/a.md");
        batch.delete("content/b.md");
        let changes: Vec<TreeChange> = batch.changes.into_values().collect();
        assert_eq!(
            changes,
            vec![
                TreeChange::Upsert { path: "content/a.md".into(), content: "new".into() },
                TreeChange::Delete { path: "content/b.md".into() },
            ]
        );
    }

    #[test]
    fn later_upsert_replaces_earlier_delete() {
        let mut batch = AuthorBatch::default();
        batch.delete("content/a.md");
        batch.upsert("content/a.md", "moved here".into());
        assert!(!batch.changes["content/a.md"].is_delete());
    }
}
