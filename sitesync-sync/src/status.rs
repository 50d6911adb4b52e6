//! Per-site sync and publish status.
//!
//! Item classification, first match wins:
//! 1. `Synced` (backend reflects the current checksum)
//! 2. `PendingDelete` (item soft-deleted or gone, backend not yet updated)
//! 3. `NeverSynced` (no synced checksum recorded)
//! 4. `Dirty`

use chrono::{DateTime, Utc};
use serde::Serialize;

use sitesync_core::{BuildStatus, ContentStore, Site, SiteName, SyncState, Version};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSyncStatus {
    Synced,
    PendingDelete,
    NeverSynced,
    Dirty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentCounts {
    pub never_synced: usize,
    pub dirty: usize,
    pub pending_delete: usize,
    pub synced: usize,
}

impl ContentCounts {
    pub fn pending(&self) -> usize {
        self.never_synced + self.dirty + self.pending_delete
    }

    fn add(&mut self, status: ItemSyncStatus) {
        match status {
            ItemSyncStatus::Synced => self.synced += 1,
            ItemSyncStatus::PendingDelete => self.pending_delete += 1,
            ItemSyncStatus::NeverSynced => self.never_synced += 1,
            ItemSyncStatus::Dirty => self.dirty += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionStatus {
    pub version: Version,
    pub status: BuildStatus,
    pub build_id: Option<String>,
    pub status_updated_at: Option<DateTime<Utc>>,
    pub has_unpublished_changes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteStatus {
    pub site: SiteName,
    pub repo: String,
    pub counts: ContentCounts,
    pub versions: Vec<VersionStatus>,
    pub last_published_at: Option<DateTime<Utc>>,
}

/// Classify one state; `item_active` is whether its item exists and is not
/// soft-deleted.
pub fn classify(state: &SyncState, item_active: bool) -> ItemSyncStatus {
    if state.is_synced() {
        ItemSyncStatus::Synced
    } else if !item_active {
        ItemSyncStatus::PendingDelete
    } else if state.never_synced() {
        ItemSyncStatus::NeverSynced
    } else {
        ItemSyncStatus::Dirty
    }
}

pub fn site_status(store: &dyn ContentStore, site: &Site) -> Result<SiteStatus, SyncError> {
    let active: std::collections::BTreeSet<_> = store
        .list_items(&site.name)?
        .into_iter()
        .filter(|item| !item.is_deleted())
        .map(|item| item.id)
        .collect();

    let mut counts = ContentCounts::default();
    for state in store.list_sync_states(&site.name)? {
        counts.add(classify(&state, active.contains(&state.content_id)));
    }

    let versions = Version::all()
        .iter()
        .map(|version| {
            let state = site.version(*version);
            VersionStatus {
                version: *version,
                status: state.status,
                build_id: state.build_id.clone(),
                status_updated_at: state.status_updated_at,
                has_unpublished_changes: state.has_unpublished_changes,
            }
        })
        .collect();

    Ok(SiteStatus {
        site: site.name.clone(),
        repo: site.repo_name(),
        counts,
        versions,
        last_published_at: site.last_published_at,
    })
}

/// Status of every site, in store order.
pub fn all_site_statuses(store: &dyn ContentStore) -> Result<Vec<SiteStatus>, SyncError> {
    store
        .list_sites()?
        .iter()
        .map(|site| site_status(store, site))
        .collect()
}

/// Compact age such as `45s`, `12m`, `3h`, `2d`.
pub fn format_age(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = now.signed_duration_since(timestamp).num_seconds().max(0) as u64;
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use sitesync_core::{ContentItem, ContentStatus, MemoryStore, SiteConfig};

    use crate::checksum::ChecksumTracker;

    fn setup() -> (Arc<MemoryStore>, Site, ChecksumTracker) {
        let store = Arc::new(MemoryStore::new());
        let site = store.insert_site(Site::new("agency", SiteConfig::default())).unwrap();
        let tracker = ChecksumTracker::new(store.clone());
        (store, site, tracker)
    }

    fn page(site: &Site, id: &str) -> ContentItem {
        let mut item = ContentItem::new(site.name.clone(), id, "page");
        item.filename = id.to_string();
        item
    }

    #[test]
    fn counts_each_classification() {
        let (store, site, tracker) = setup();
        for id in ["fresh", "edited", "clean", "removed"] {
            tracker.save(&page(&site, id)).unwrap();
        }
        for id in ["edited", "clean", "removed"] {
            store
                .upsert_sync_state(&site.name, &id.into(), &mut |s| {
                    s.synced_checksum = Some(s.current_checksum.clone())
                })
                .unwrap();
        }
        let mut edited = page(&site, "edited");
        edited.body = "changed".into();
        tracker.save(&edited).unwrap();
        let mut removed = page(&site, "removed");
        removed.status = ContentStatus::SoftDeleted;
        tracker.save(&removed).unwrap();

        let status = site_status(store.as_ref(), &site).unwrap();
        assert_eq!(
            status.counts,
            ContentCounts { never_synced: 1, dirty: 1, pending_delete: 1, synced: 1 }
        );
        assert_eq!(status.counts.pending(), 3);
        assert_eq!(status.versions.len(), 2);
        assert_eq!(status.versions[0].status, BuildStatus::NotStarted);
    }

    #[test]
    fn synced_wins_over_pending_delete() {
        let mut state = SyncState::new("a".into());
        state.current_checksum = "c".into();
        state.synced_checksum = Some("c".into());
        assert_eq!(classify(&state, false), ItemSyncStatus::Synced);
        state.synced_checksum = None;
        assert_eq!(classify(&state, false), ItemSyncStatus::PendingDelete);
        assert_eq!(classify(&state, true), ItemSyncStatus::NeverSynced);
    }

    #[test]
    fn ages_are_compact() {
        let now = Utc::now();
        assert_eq!(format_age(now - Duration::seconds(42), now), "42s");
        assert_eq!(format_age(now - Duration::minutes(5), now), "5m");
        assert_eq!(format_age(now - Duration::hours(7), now), "7h");
        assert_eq!(format_age(now - Duration::days(3), now), "3d");
        assert_eq!(format_age(now + Duration::seconds(9), now), "0s");
    }
}
