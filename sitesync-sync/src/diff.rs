//! Dry-run unified diff of pending items against the backend.

use similar::TextDiff;

use sitesync_core::ContentId;

use crate::backend::BackendSync;
use crate::error::SyncError;
use crate::format::LinkMap;
use crate::git::backend::GitBackend;

/// What pushing one dirty item would change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDiff {
    pub content_id: ContentId,
    pub path: String,
    pub unified_diff: String,
}

/// Serialize every dirty item and compare it with the file on main.
/// Pending deletes show as removal of the recorded file. Nothing is written.
pub fn diff_pending(backend: &GitBackend) -> Result<Vec<ItemDiff>, SyncError> {
    let site = backend.site();
    let store = backend.store();
    let items = store.list_items(&site.name)?;
    let links = LinkMap::from_items(&site.config, &items);

    let mut diffs = Vec::new();
    for state in store.list_sync_states(&site.name)? {
        if state.is_synced() {
            continue;
        }
        let item = items.iter().find(|i| i.id == state.content_id && !i.is_deleted());
        let (path, rendered) = match item {
            Some(item) => backend.render_item(item, &links)?,
            None => match state.backend_path() {
                Some(path) => (path.to_string(), String::new()),
                None => continue,
            },
        };
        let existing = read_existing_or_empty(backend, &path)?;
        if existing == rendered {
            continue;
        }

        let old_header = format!("a/{path}");
        let new_header = format!("b/{path}");
        let unified = TextDiff::from_lines(&existing, &rendered)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string();
        diffs.push(ItemDiff {
            content_id: state.content_id.clone(),
            path,
            unified_diff: unified,
        });
    }
    Ok(diffs)
}

fn read_existing_or_empty(backend: &GitBackend, path: &str) -> Result<String, SyncError> {
    let main = &backend.site().branches.main;
    match backend.host().get_file(backend.repo(), main, path) {
        Ok(file) => Ok(file.content.replace("\r\n", "\n")),
        Err(e) if e.is_not_found() => Ok(String::new()),
        Err(e) => Err(e),
    }
}
