//! Backend sync protocol.
//!
//! A backend moves content between the store and one site's file backend.
//! Per-item pushes are no-ops (no backend call, `Ok(None)`) when the state is
//! already synced; on success they advance `synced_checksum` through
//! [`write_back`].

use serde::Serialize;

use sitesync_core::{ContentId, ContentItem, ContentStore, Site, SyncState};

use crate::error::{Classify, ErrorClass, SyncError};

/// Outcome of pushing one item. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub content_id: ContentId,
    /// Resolved backend path; `None` for a delete of a never-written item.
    pub path: Option<String>,
    /// Checksum the backend now reflects.
    pub checksum: String,
    pub deleted: bool,
}

/// Aggregate of a `sync_all_content` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: Vec<ContentId>,
    pub deleted: Vec<ContentId>,
    /// Items skipped after a per-item failure, with the error text.
    pub failed: Vec<(ContentId, String)>,
    pub commits: usize,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn record(&mut self, result: &SyncResult) {
        if result.deleted {
            self.deleted.push(result.content_id.clone());
        } else {
            self.synced.push(result.content_id.clone());
        }
    }
}

/// Aggregate of a backend → store walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub created: Vec<ContentId>,
    pub updated: Vec<ContentId>,
    pub deleted: Vec<ContentId>,
    /// Paths that were not imported, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// A file read from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFile {
    pub path: String,
    pub content: String,
}

/// How a reverse-synced file updates its sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Backend is authoritative: mark the item fully synced at this path.
    Authoritative,
    /// Only refresh `current_checksum`.
    Scoped,
}

/// Apply confirmed backend writes to the store: deletes are hard-deleted,
/// everything else gets its path and `synced_checksum` advanced.
pub fn write_back(
    store: &dyn ContentStore,
    site: &Site,
    results: &[SyncResult],
) -> Result<(), SyncError> {
    for result in results {
        if result.deleted {
            store.hard_delete_item(&site.name, &result.content_id)?;
            continue;
        }
        store.upsert_sync_state(&site.name, &result.content_id, &mut |state| {
            state.synced_checksum = Some(result.checksum.clone());
            if let Some(path) = &result.path {
                state.set_backend_path(path);
            }
        })?;
    }
    Ok(())
}

pub trait BackendSync: Send + Sync {
    fn site(&self) -> &Site;

    fn store(&self) -> &dyn ContentStore;

    fn backend_exists(&self) -> Result<bool, SyncError>;

    /// Idempotent; never recreates an existing backend.
    fn create_website_in_backend(&self) -> Result<(), SyncError>;

    /// Push all content, then promote main into the draft branch.
    fn merge_draft(&self) -> Result<(), SyncError>;

    /// Everything `merge_draft` does, then promote main into live.
    fn merge_live(&self) -> Result<(), SyncError>;

    fn create_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError>;

    fn update_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError>;

    fn delete_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError>;

    /// Never synced → create; soft-deleted (or gone) → delete; else update.
    fn sync_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError> {
        if state.never_synced() {
            return self.create_content(state);
        }
        let item = self.store().get_item(&self.site().name, &state.content_id)?;
        match item {
            Some(item) if !item.is_deleted() => self.update_content(state),
            _ => self.delete_content(state),
        }
    }

    /// Sync every state (or only `filter`). Per-item failures are logged and
    /// reported; rate limiting aborts the pass.
    fn sync_all_content(&self, filter: Option<&[ContentId]>) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        for state in self.store().list_sync_states(&self.site().name)? {
            if filter.is_some_and(|ids| !ids.contains(&state.content_id)) {
                continue;
            }
            match self.sync_content(&state) {
                Ok(Some(result)) => report.record(&result),
                Ok(None) => {}
                Err(e) if e.class() == ErrorClass::RateLimited => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "sync failed for {}/{}: {e}",
                        self.site().name,
                        state.content_id
                    );
                    report.failed.push((state.content_id.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Delete backend files no live item or recorded path accounts for.
    /// Returns the deleted paths.
    fn delete_orphaned_content(&self) -> Result<Vec<String>, SyncError>;

    fn create_content_in_store(
        &self,
        file: &BackendFile,
        mode: ImportMode,
    ) -> Result<ContentId, SyncError>;

    fn update_content_in_store(
        &self,
        file: &BackendFile,
        mode: ImportMode,
    ) -> Result<ContentId, SyncError>;

    /// Hard-delete the item. Returns `false` when it did not exist.
    fn delete_content_in_store(&self, id: &ContentId) -> Result<bool, SyncError>;

    /// Walk the backend (at `git_ref`, under `path`) into the store. Only an
    /// unscoped walk deletes unseen items and marks items synced.
    fn sync_all_content_to_store(
        &self,
        git_ref: Option<&str>,
        path: Option<&str>,
    ) -> Result<ImportReport, SyncError>;
}

/// Constructs a backend for a site; selected once from configuration.
pub trait BackendProvider: Send + Sync {
    fn backend_for(&self, site: &Site) -> Result<Box<dyn BackendSync>, SyncError>;
}

/// Load the item a state belongs to.
pub(crate) fn item_for_state(
    backend: &dyn BackendSync,
    state: &SyncState,
) -> Result<Option<ContentItem>, SyncError> {
    Ok(backend.store().get_item(&backend.site().name, &state.content_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use sitesync_core::{MemoryStore, SiteConfig};

    use crate::checksum::ChecksumTracker;

    /// Records which protocol operation each dispatch chose.
    struct Recorder {
        site: Site,
        store: Arc<MemoryStore>,
        calls: Mutex<Vec<(&'static str, ContentId)>>,
        fail: Option<ErrorClass>,
    }

    impl Recorder {
        fn push(&self, op: &'static str, state: &SyncState) -> Result<Option<SyncResult>, SyncError> {
            self.calls.lock().unwrap().push((op, state.content_id.clone()));
            if let Some(class) = self.fail {
                return Err(SyncError::of_class(class, op));
            }
            Ok(Some(SyncResult {
                content_id: state.content_id.clone(),
                path: None,
                checksum: state.current_checksum.clone(),
                deleted: op == "delete",
            }))
        }
    }

    impl BackendSync for Recorder {
        fn site(&self) -> &Site {
            &self.site
        }
        fn store(&self) -> &dyn ContentStore {
            self.store.as_ref()
        }
        fn backend_exists(&self) -> Result<bool, SyncError> {
            Ok(true)
        }
        fn create_website_in_backend(&self) -> Result<(), SyncError> {
            Ok(())
        }
        fn merge_draft(&self) -> Result<(), SyncError> {
            Ok(())
        }
        fn merge_live(&self) -> Result<(), SyncError> {
            Ok(())
        }
        fn create_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError> {
            self.push("create", state)
        }
        fn update_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError> {
            self.push("update", state)
        }
        fn delete_content(&self, state: &SyncState) -> Result<Option<SyncResult>, SyncError> {
            self.push("delete", state)
        }
        fn delete_orphaned_content(&self) -> Result<Vec<String>, SyncError> {
            Ok(vec![])
        }
        fn create_content_in_store(&self, _: &BackendFile, _: ImportMode) -> Result<ContentId, SyncError> {
            unimplemented!()
        }
        fn update_content_in_store(&self, _: &BackendFile, _: ImportMode) -> Result<ContentId, SyncError> {
            unimplemented!()
        }
        fn delete_content_in_store(&self, _: &ContentId) -> Result<bool, SyncError> {
            unimplemented!()
        }
        fn sync_all_content_to_store(&self, _: Option<&str>, _: Option<&str>) -> Result<ImportReport, SyncError> {
            unimplemented!()
        }
    }

    fn recorder(fail: Option<ErrorClass>) -> Recorder {
        let store = Arc::new(MemoryStore::new());
        let site = store.insert_site(Site::new("agency", SiteConfig::default())).unwrap();
        Recorder { site, store, calls: Mutex::new(vec![]), fail }
    }

    fn tracked(rec: &Recorder, id: &str, synced: bool, deleted: bool) -> SyncState {
        let mut item = ContentItem::new(rec.site.name.clone(), id, "page");
        item.filename = id.into();
        if deleted {
            item.status = sitesync_core::ContentStatus::SoftDeleted;
        }
        let tracker = ChecksumTracker::new(rec.store.clone());
        let mut state = tracker.save(&item).unwrap().value;
        if synced {
            state = rec
                .store
                .upsert_sync_state(&rec.site.name, &item.id, &mut |s| {
                    s.synced_checksum = Some("older".into())
                })
                .unwrap()
                .value;
        }
        state
    }

    #[test]
    fn dispatch_picks_exactly_one_operation() {
        let rec = recorder(None);
        let never = tracked(&rec, "a", false, false);
        let deleted = tracked(&rec, "b", true, true);
        let changed = tracked(&rec, "c", true, false);

        rec.sync_content(&never).unwrap();
        rec.sync_content(&deleted).unwrap();
        rec.sync_content(&changed).unwrap();

        let calls = rec.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("create", ContentId::from("a")),
                ("delete", ContentId::from("b")),
                ("update", ContentId::from("c")),
            ]
        );
    }

    #[test]
    fn sync_all_honours_filter() {
        let rec = recorder(None);
        tracked(&rec, "a", false, false);
        tracked(&rec, "b", false, false);
        let report = rec.sync_all_content(Some(&[ContentId::from("b")])).unwrap();
        assert_eq!(report.synced, vec![ContentId::from("b")]);
    }

    #[test]
    fn sync_all_collects_item_failures() {
        let rec = recorder(Some(ErrorClass::Fatal));
        tracked(&rec, "a", false, false);
        tracked(&rec, "b", false, false);
        let report = rec.sync_all_content(None).unwrap();
        assert_eq!(report.failed.len(), 2);
        assert!(!report.is_clean());
    }

    #[test]
    fn sync_all_aborts_on_rate_limit() {
        let rec = recorder(Some(ErrorClass::RateLimited));
        tracked(&rec, "a", false, false);
        tracked(&rec, "b", false, false);
        assert!(matches!(rec.sync_all_content(None), Err(SyncError::RateLimited { .. })));
        assert_eq!(rec.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn write_back_advances_and_hard_deletes() {
        let rec = recorder(None);
        let kept = tracked(&rec, "a", false, false);
        tracked(&rec, "b", false, true);
        write_back(
            rec.store.as_ref(),
            &rec.site,
            &[
                SyncResult {
                    content_id: ContentId::from("a"),
                    path: Some("content/a.md".into()),
                    checksum: kept.current_checksum.clone(),
                    deleted: false,
                },
                SyncResult {
                    content_id: ContentId::from("b"),
                    path: None,
                    checksum: String::new(),
                    deleted: true,
                },
            ],
        )
        .unwrap();

        let state = rec.store.get_sync_state(&rec.site.name, &ContentId::from("a")).unwrap().unwrap();
        assert!(state.is_synced());
        assert_eq!(state.backend_path(), Some("content/a.md"));
        assert!(rec.store.get_item(&rec.site.name, &ContentId::from("b")).unwrap().is_none());
    }
}
