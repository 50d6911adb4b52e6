//! Backend path resolution for content items.

use sitesync_core::{ConfigItem, ContentItem, SiteConfig};

use crate::error::SyncError;

/// Files the reverse walk never imports and orphan cleanup never deletes.
const INFRASTRUCTURE_FILES: &[&str] = &["readme.md", ".gitignore", ".gitkeep", ".ds_store"];

pub fn is_infrastructure(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    INFRASTRUCTURE_FILES.contains(&name.as_str())
}

/// Join path segments with single slashes, dropping empty segments.
pub fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn unresolvable(item: &ContentItem, reason: impl Into<String>) -> SyncError {
    SyncError::Unresolvable {
        content_id: item.id.0.clone(),
        reason: reason.into(),
    }
}

/// page → `{content_root}/{dirpath}/{filename}.{ext}`, data → its fixed file.
pub fn resolve_path(config: &SiteConfig, item: &ContentItem) -> Result<String, SyncError> {
    let path = match config.item_for(&item.content_type) {
        None => {
            return Err(unresolvable(
                item,
                format!("no config item for content type {:?}", item.content_type),
            ))
        }
        Some(ConfigItem::Page { extension, .. }) => {
            let filename = item.filename.trim_matches('/');
            if filename.is_empty() {
                return Err(unresolvable(item, "page has no filename"));
            }
            join(&[
                config.root(),
                item.dirpath.as_str(),
                format!("{filename}.{extension}").as_str(),
            ])
        }
        Some(ConfigItem::Data { file, .. }) => join(&[file.as_str()]),
    };
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(unresolvable(item, format!("relative segment in {path}")));
    }
    Ok(path)
}

/// Public URL of a page: `/dirpath/filename/`.
pub fn page_url(item: &ContentItem) -> String {
    let inner = join(&[item.dirpath.as_str(), item.filename.as_str()]);
    if inner.is_empty() {
        "/".to_string()
    } else {
        format!("/{inner}/")
    }
}

/// Split a page path under the content root into `(dirpath, filename)`.
pub fn split_page_path(config: &SiteConfig, path: &str) -> Option<(String, String)> {
    let root = config.root();
    let path = path.trim_start_matches('/');
    let rel = if root.is_empty() {
        path
    } else {
        path.strip_prefix(root)?.strip_prefix('/')?
    };
    let (dirpath, file) = match rel.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", rel),
    };
    let filename = file.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(file);
    if filename.is_empty() {
        return None;
    }
    Some((dirpath.to_string(), filename.to_string()))
}

/// Whether `path` lies under the site's content root.
pub fn under_root(config: &SiteConfig, path: &str) -> bool {
    let root = config.root();
    root.is_empty() || path.trim_start_matches('/').starts_with(&format!("{root}/"))
}
