//! Content fingerprints and the sync-state bookkeeping built on them.
//!
//! The fingerprint is SHA-256 over canonical JSON of the fields that end up
//! in the backend file, so two items that serialize identically always hash
//! identically regardless of map insertion order. Menu files carry page URLs,
//! so a menu's fingerprint covers its links as resolved URLs.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use sitesync_core::{
    ConfigItem, ContentItem, ContentStore, FileFormat, SiteConfig, SiteName, SyncState, Upsert,
};

use crate::error::SyncError;
use crate::format::LinkMap;

/// Hex SHA-256 of the item's serialization-relevant fields.
pub fn fingerprint(item: &ContentItem) -> String {
    digest(item, Value::Object(item.metadata.clone().into_iter().collect()))
}

/// [`fingerprint`] of a menu item, with page links resolved through `links`.
pub fn menu_fingerprint(item: &ContentItem, links: &LinkMap) -> String {
    let mut metadata = Value::Object(item.metadata.clone().into_iter().collect());
    links.to_urls(&mut metadata);
    digest(item, metadata)
}

fn digest(item: &ContentItem, metadata: Value) -> String {
    let payload = json!({
        "body": item.body.replace("\r\n", "\n"),
        "content_type": item.content_type,
        "dirpath": item.dirpath,
        "filename": item.filename,
        "metadata": canonical(&metadata),
        "status": item.status,
        "title": item.title,
    });
    let canonical_payload = canonical(&payload).to_string();
    hex::encode(Sha256::digest(canonical_payload.as_bytes()))
}

fn is_menu(config: &SiteConfig, item: &ContentItem) -> bool {
    config.item_for(&item.content_type).and_then(ConfigItem::format) == Some(FileFormat::YamlMenu)
}

fn is_page(config: &SiteConfig, item: &ContentItem) -> bool {
    matches!(config.item_for(&item.content_type), Some(ConfigItem::Page { .. }))
}

fn has_menus(config: &SiteConfig) -> bool {
    config
        .items
        .iter()
        .any(|item| item.format() == Some(FileFormat::YamlMenu))
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Keeps `SyncState.current_checksum` equal to the item's fingerprint.
#[derive(Clone)]
pub struct ChecksumTracker {
    store: Arc<dyn ContentStore>,
}

impl ChecksumTracker {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Recompute the fingerprint and store it. `synced_checksum` and
    /// `backend_data` are never touched; unchanged content writes nothing.
    /// A page whose fingerprint changed re-tracks the site's menus, since
    /// its URL may have moved.
    pub fn upsert(&self, item: &ContentItem) -> Result<Upsert<SyncState>, SyncError> {
        let config = self.store.get_site(&item.site)?.config;
        if !has_menus(&config) {
            return self.track(item, fingerprint(item));
        }
        let items = self.store.list_items(&item.site)?;
        let links = LinkMap::from_items(&config, &items);
        let result = self.track(item, checksum_for(&config, item, &links))?;
        if result.changed && is_page(&config, item) {
            for menu in items.iter().filter(|i| is_menu(&config, i)) {
                self.track(menu, menu_fingerprint(menu, &links))?;
            }
        }
        Ok(result)
    }

    /// Save the item, then track it.
    pub fn save(&self, item: &ContentItem) -> Result<Upsert<SyncState>, SyncError> {
        self.store.save_item(item)?;
        self.upsert(item)
    }

    /// Track every item of a site. Returns how many states changed.
    pub fn upsert_site(&self, site: &SiteName) -> Result<usize, SyncError> {
        let config = self.store.get_site(site)?.config;
        let items = self.store.list_items(site)?;
        let links = LinkMap::from_items(&config, &items);
        let mut changed = 0;
        for item in &items {
            if self.track(item, checksum_for(&config, item, &links))?.changed {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn track(&self, item: &ContentItem, checksum: String) -> Result<Upsert<SyncState>, SyncError> {
        let result = self
            .store
            .upsert_sync_state(&item.site, &item.id, &mut |state| {
                state.current_checksum = checksum.clone();
            })?;
        if result.changed {
            tracing::debug!("checksum updated: {}/{}", item.site, item.id);
        }
        Ok(result)
    }
}

fn checksum_for(config: &SiteConfig, item: &ContentItem, links: &LinkMap) -> String {
    if is_menu(config, item) {
        menu_fingerprint(item, links)
    } else {
        fingerprint(item)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
