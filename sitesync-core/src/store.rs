//! Content store boundary.
//!
//! The relational content store is an external collaborator; the engine only
//! needs the narrow surface in [`ContentStore`]. [`MemoryStore`] backs tests
//! and single-process runs, [`crate::file_store::FileStore`] persists to disk.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::types::{ContentId, ContentItem, Site, SiteName, SyncState};

/// Result of an upsert: the stored value and whether anything was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert<T> {
    pub value: T,
    pub changed: bool,
}

/// Store operations used by the sync and publish engine.
///
/// Mutations that read-modify-write take a closure so implementations can
/// apply them atomically, keyed by the unique (site, id) pair.
pub trait ContentStore: Send + Sync {
    fn list_sites(&self) -> Result<Vec<Site>, StoreError>;

    /// Returns [`StoreError::SiteNotFound`] when absent.
    fn get_site(&self, name: &SiteName) -> Result<Site, StoreError>;

    /// Insert a site. Idempotent: an existing site with the same name is
    /// returned unchanged.
    fn insert_site(&self, site: Site) -> Result<Site, StoreError>;

    /// Atomically modify a site record and return the new value.
    fn update_site(
        &self,
        name: &SiteName,
        apply: &mut dyn FnMut(&mut Site),
    ) -> Result<Site, StoreError>;

    /// All items of a site, soft-deleted included, ordered by id.
    fn list_items(&self, site: &SiteName) -> Result<Vec<ContentItem>, StoreError>;

    fn get_item(&self, site: &SiteName, id: &ContentId) -> Result<Option<ContentItem>, StoreError>;

    /// Create or replace an item keyed by (site, id).
    fn save_item(&self, item: &ContentItem) -> Result<(), StoreError>;

    /// Physically remove an item together with its sync state.
    /// Returns `false` when nothing existed.
    fn hard_delete_item(&self, site: &SiteName, id: &ContentId) -> Result<bool, StoreError>;

    /// All sync states of a site, ordered by content id.
    fn list_sync_states(&self, site: &SiteName) -> Result<Vec<SyncState>, StoreError>;

    fn get_sync_state(
        &self,
        site: &SiteName,
        id: &ContentId,
    ) -> Result<Option<SyncState>, StoreError>;

    /// Atomically create-or-modify the sync state for (site, id). A missing
    /// state starts as [`SyncState::new`]. Nothing is written when `apply`
    /// leaves an existing state unchanged.
    fn upsert_sync_state(
        &self,
        site: &SiteName,
        id: &ContentId,
        apply: &mut dyn FnMut(&mut SyncState),
    ) -> Result<Upsert<SyncState>, StoreError>;
}

type Key = (SiteName, ContentId);

#[derive(Debug, Default)]
struct MemoryInner {
    sites: BTreeMap<SiteName, Site>,
    items: BTreeMap<Key, ContentItem>,
    states: BTreeMap<Key, SyncState>,
    state_writes: usize,
}

/// Thread-safe in-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sync-state writes performed so far.
    pub fn state_writes(&self) -> usize {
        self.lock().map(|inner| inner.state_writes).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn key(site: &SiteName, id: &ContentId) -> Key {
    (site.clone(), id.clone())
}

impl ContentStore for MemoryStore {
    fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        Ok(self.lock()?.sites.values().cloned().collect())
    }

    fn get_site(&self, name: &SiteName) -> Result<Site, StoreError> {
        self.lock()?
            .sites
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::SiteNotFound { site: name.0.clone() })
    }

    fn insert_site(&self, site: Site) -> Result<Site, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.sites.entry(site.name.clone()).or_insert(site).clone())
    }

    fn update_site(
        &self,
        name: &SiteName,
        apply: &mut dyn FnMut(&mut Site),
    ) -> Result<Site, StoreError> {
        let mut inner = self.lock()?;
        let site = inner
            .sites
            .get_mut(name)
            .ok_or_else(|| StoreError::SiteNotFound { site: name.0.clone() })?;
        apply(site);
        Ok(site.clone())
    }

    fn list_items(&self, site: &SiteName) -> Result<Vec<ContentItem>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .items
            .iter()
            .filter(|((s, _), _)| s == site)
            .map(|(_, item)| item.clone())
            .collect())
    }

    fn get_item(&self, site: &SiteName, id: &ContentId) -> Result<Option<ContentItem>, StoreError> {
        Ok(self.lock()?.items.get(&key(site, id)).cloned())
    }

    fn save_item(&self, item: &ContentItem) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if !inner.sites.contains_key(&item.site) {
            return Err(StoreError::SiteNotFound { site: item.site.0.clone() });
        }
        inner.items.insert(key(&item.site, &item.id), item.clone());
        Ok(())
    }

    fn hard_delete_item(&self, site: &SiteName, id: &ContentId) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let k = key(site, id);
        let removed_item = inner.items.remove(&k).is_some();
        let removed_state = inner.states.remove(&k).is_some();
        Ok(removed_item || removed_state)
    }

    fn list_sync_states(&self, site: &SiteName) -> Result<Vec<SyncState>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .states
            .iter()
            .filter(|((s, _), _)| s == site)
            .map(|(_, state)| state.clone())
            .collect())
    }

    fn get_sync_state(
        &self,
        site: &SiteName,
        id: &ContentId,
    ) -> Result<Option<SyncState>, StoreError> {
        Ok(self.lock()?.states.get(&key(site, id)).cloned())
    }

    fn upsert_sync_state(
        &self,
        site: &SiteName,
        id: &ContentId,
        apply: &mut dyn FnMut(&mut SyncState),
    ) -> Result<Upsert<SyncState>, StoreError> {
        let mut inner = self.lock()?;
        let k = key(site, id);
        let existing = inner.states.get(&k).cloned();
        let mut state = existing.clone().unwrap_or_else(|| SyncState::new(id.clone()));
        apply(&mut state);

        if existing.as_ref() == Some(&state) {
            return Ok(Upsert { value: state, changed: false });
        }
        inner.states.insert(k, state.clone());
        inner.state_writes += 1;
        Ok(Upsert { value: state, changed: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site_config::SiteConfig;

    fn store_with_site() -> (MemoryStore, SiteName) {
        let store = MemoryStore::new();
        let site = store.insert_site(Site::new("agency", SiteConfig::default())).unwrap();
        (store, site.name)
    }

    #[test]
    fn insert_site_is_idempotent() {
        let (store, name) = store_with_site();
        let original = store.get_site(&name).unwrap();
        let again = store.insert_site(Site::new("agency", SiteConfig::default())).unwrap();
        assert_eq!(again.uid, original.uid);
        assert_eq!(store.list_sites().unwrap().len(), 1);
    }

    #[test]
    fn save_item_requires_site() {
        let store = MemoryStore::new();
        let err = store.save_item(&ContentItem::new("ghost", "a", "page")).unwrap_err();
        assert!(matches!(err, StoreError::SiteNotFound { .. }));
    }

    #[test]
    fn upsert_sync_state_skips_unchanged_writes() {
        let (store, site) = store_with_site();
        let id = ContentId::from("a");
        let first = store
            .upsert_sync_state(&site, &id, &mut |s| s.current_checksum = "x".into())
            .unwrap();
        assert!(first.changed);
        let second = store
            .upsert_sync_state(&site, &id, &mut |s| s.current_checksum = "x".into())
            .unwrap();
        assert!(!second.changed);
        assert_eq!(store.state_writes(), 1);
    }

    #[test]
    fn hard_delete_removes_item_and_state() {
        let (store, site) = store_with_site();
        let item = ContentItem::new(site.clone(), "a", "page");
        store.save_item(&item).unwrap();
        store
            .upsert_sync_state(&site, &item.id, &mut |s| s.current_checksum = "x".into())
            .unwrap();

        assert!(store.hard_delete_item(&site, &item.id).unwrap());
        assert!(store.get_item(&site, &item.id).unwrap().is_none());
        assert!(store.get_sync_state(&site, &item.id).unwrap().is_none());
        assert!(!store.hard_delete_item(&site, &item.id).unwrap());
    }

    #[test]
    fn list_items_is_scoped_and_ordered() {
        let (store, site) = store_with_site();
        store.insert_site(Site::new("other", SiteConfig::default())).unwrap();
        for id in ["b", "a", "c"] {
            store.save_item(&ContentItem::new(site.clone(), id, "page")).unwrap();
        }
        store.save_item(&ContentItem::new("other", "z", "page")).unwrap();

        let ids: Vec<_> = store
            .list_items(&site)
            .unwrap()
            .into_iter()
            .map(|item| item.id.0)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
