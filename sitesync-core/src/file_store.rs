//! YAML-on-disk content store.
//!
//! # Storage layout
//!
//! ```text
//! ~/.sitesync/
//!   sites/
//!     <site-slug>/
//!       site.yaml            (site record with the display name — mode 0600)
//!       content/<id>.yaml    (one file per content item)
//!       state/<id>.yaml      (one file per sync state)
//! ```
//!
//! # API pattern
//!
//! Path helpers come in `fn_at(home: &Path, …)` form; [`FileStore::open`]
//! derives home from `dirs::home_dir()`. Tests always use the `_at` forms.
//!
//! Site directories are keyed by [`slugify`]d name, so site names are free
//! form and `Agency Site` and `agency-site` resolve to the same site.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{io_err, StoreError};
use crate::store::{ContentStore, Upsert};
use crate::types::{slugify, ContentId, ContentItem, Site, SiteName, SyncState};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.sitesync`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".sitesync")
}

/// `<home>/.sitesync/sites`
pub fn sites_root_at(home: &Path) -> PathBuf {
    root_at(home).join("sites")
}

/// `<home>/.sitesync/sites/<site-slug>/`
pub fn site_dir_at(home: &Path, site: &SiteName) -> PathBuf {
    sites_root_at(home).join(slugify(&site.0))
}

/// `<home>/.sitesync/sites/<site>/site.yaml` — pure, no I/O.
pub fn site_path_at(home: &Path, site: &SiteName) -> PathBuf {
    site_dir_at(home, site).join("site.yaml")
}

/// `<home>/.sitesync/sites/<site>/content/<id>.yaml`
pub fn content_path_at(home: &Path, site: &SiteName, id: &ContentId) -> PathBuf {
    site_dir_at(home, site).join("content").join(format!("{}.yaml", id.0))
}

/// `<home>/.sitesync/sites/<site>/state/<id>.yaml`
pub fn state_path_at(home: &Path, site: &SiteName, id: &ContentId) -> PathBuf {
    site_dir_at(home, site).join("state").join(format!("{}.yaml", id.0))
}

/// Parse `(site, id)` back out of a content file path, if it is one. The
/// site is the directory slug, which the store resolves like the full name.
pub fn content_key_for_path(home: &Path, path: &Path) -> Option<(SiteName, ContentId)> {
    let rel = path.strip_prefix(sites_root_at(home)).ok()?;
    let mut parts = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned());
    let site = parts.next()?;
    if parts.next()?.as_str() != "content" {
        return None;
    }
    let file = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let id = file.strip_suffix(".yaml")?;
    Some((SiteName::from(site), ContentId::from(id)))
}

/// A site name must slug to a non-empty directory name.
pub fn validate_site_name(site: &SiteName) -> Result<(), StoreError> {
    if slugify(&site.0).is_empty() {
        return Err(StoreError::InvalidSiteName { name: site.0.clone() });
    }
    Ok(())
}

/// Content ids become file names; keep them to a portable alphabet.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey { key: key.to_string() })
    }
}

// ---------------------------------------------------------------------------
// 2. FileStore
// ---------------------------------------------------------------------------

/// [`ContentStore`] persisted as YAML files under `<home>/.sitesync/sites`.
///
/// Writes use serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
/// Read-modify-write operations are serialized by an in-process mutex.
#[derive(Debug)]
pub struct FileStore {
    home: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open_at(home: &Path) -> Result<Self, StoreError> {
        ensure_dir(&sites_root_at(home))?;
        Ok(Self {
            home: home.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// `open_at` convenience wrapper.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(&home()?)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }

    fn require_site(&self, site: &SiteName) -> Result<(), StoreError> {
        validate_site_name(site)?;
        if site_path_at(&self.home, site).exists() {
            Ok(())
        } else {
            Err(StoreError::SiteNotFound { site: site.0.clone() })
        }
    }
}

impl ContentStore for FileStore {
    fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        let root = sites_root_at(&self.home);
        if !root.exists() {
            return Ok(vec![]);
        }
        let mut entries: Vec<_> = std::fs::read_dir(&root)
            .map_err(|e| io_err(&root, e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .collect();
        entries.sort_by_key(|e| e.file_name());

        let mut sites = Vec::new();
        for entry in entries {
            let path = entry.path().join("site.yaml");
            if path.exists() {
                sites.push(read_yaml(&path)?);
            }
        }
        Ok(sites)
    }

    fn get_site(&self, name: &SiteName) -> Result<Site, StoreError> {
        self.require_site(name)?;
        read_yaml(&site_path_at(&self.home, name))
    }

    /// A site whose slug is already taken is returned as stored.
    fn insert_site(&self, site: Site) -> Result<Site, StoreError> {
        validate_site_name(&site.name)?;
        let _guard = self.guard()?;
        let path = site_path_at(&self.home, &site.name);
        if path.exists() {
            return read_yaml(&path);
        }
        ensure_dir(&site_dir_at(&self.home, &site.name))?;
        write_yaml(&path, &site)?;
        Ok(site)
    }

    fn update_site(
        &self,
        name: &SiteName,
        apply: &mut dyn FnMut(&mut Site),
    ) -> Result<Site, StoreError> {
        let _guard = self.guard()?;
        let mut site = self.get_site(name)?;
        apply(&mut site);
        write_yaml(&site_path_at(&self.home, name), &site)?;
        Ok(site)
    }

    fn list_items(&self, site: &SiteName) -> Result<Vec<ContentItem>, StoreError> {
        self.require_site(site)?;
        read_dir_yaml(&site_dir_at(&self.home, site).join("content"))
    }

    fn get_item(&self, site: &SiteName, id: &ContentId) -> Result<Option<ContentItem>, StoreError> {
        validate_site_name(site)?;
        validate_key(&id.0)?;
        read_yaml_opt(&content_path_at(&self.home, site, id))
    }

    fn save_item(&self, item: &ContentItem) -> Result<(), StoreError> {
        self.require_site(&item.site)?;
        validate_key(&item.id.0)?;
        let _guard = self.guard()?;
        write_yaml(&content_path_at(&self.home, &item.site, &item.id), item)
    }

    fn hard_delete_item(&self, site: &SiteName, id: &ContentId) -> Result<bool, StoreError> {
        validate_site_name(site)?;
        validate_key(&id.0)?;
        let _guard = self.guard()?;
        let item = remove_if_exists(&content_path_at(&self.home, site, id))?;
        let state = remove_if_exists(&state_path_at(&self.home, site, id))?;
        Ok(item || state)
    }

    fn list_sync_states(&self, site: &SiteName) -> Result<Vec<SyncState>, StoreError> {
        self.require_site(site)?;
        read_dir_yaml(&site_dir_at(&self.home, site).join("state"))
    }

    fn get_sync_state(
        &self,
        site: &SiteName,
        id: &ContentId,
    ) -> Result<Option<SyncState>, StoreError> {
        validate_site_name(site)?;
        validate_key(&id.0)?;
        read_yaml_opt(&state_path_at(&self.home, site, id))
    }

    fn upsert_sync_state(
        &self,
        site: &SiteName,
        id: &ContentId,
        apply: &mut dyn FnMut(&mut SyncState),
    ) -> Result<Upsert<SyncState>, StoreError> {
        self.require_site(site)?;
        validate_key(&id.0)?;
        let _guard = self.guard()?;
        let path = state_path_at(&self.home, site, id);
        let existing: Option<SyncState> = read_yaml_opt(&path)?;
        let mut state = existing.clone().unwrap_or_else(|| SyncState::new(id.clone()));
        apply(&mut state);
        if existing.as_ref() == Some(&state) {
            return Ok(Upsert { value: state, changed: false });
        }
        write_yaml(&path, &state)?;
        Ok(Upsert { value: state, changed: true })
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_yaml_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    read_yaml(path).map(Some)
}

/// Every `*.yaml` file in `dir`, sorted by file name.
fn read_dir_yaml<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| io_err(dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".yaml"))
        .collect();
    entries.sort_by_key(|e| e.file_name());
    entries.iter().map(|e| read_yaml(&e.path())).collect()
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        ensure_dir(dir)?;
    }
    let yaml = serde_yaml::to_string(value)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site_config::SiteConfig;
    use tempfile::TempDir;

    #[test]
    fn paths_are_correct() {
        let home = TempDir::new().expect("tempdir");
        let site = SiteName::from("agency");
        let id = ContentId::from("about");
        assert!(site_path_at(home.path(), &site).ends_with(".sitesync/sites/agency/site.yaml"));
        assert!(content_path_at(home.path(), &site, &id)
            .ends_with(".sitesync/sites/agency/content/about.yaml"));
        assert!(state_path_at(home.path(), &site, &id)
            .ends_with(".sitesync/sites/agency/state/about.yaml"));
        assert!(site_path_at(home.path(), &SiteName::from("Agency Site"))
            .ends_with(".sitesync/sites/agency-site/site.yaml"));
    }

    #[test]
    fn content_key_for_path_parses_only_content_files() {
        let home = TempDir::new().expect("tempdir");
        let site = SiteName::from("agency");
        let id = ContentId::from("about");
        let path = content_path_at(home.path(), &site, &id);
        assert_eq!(content_key_for_path(home.path(), &path), Some((site.clone(), id.clone())));
        assert_eq!(content_key_for_path(home.path(), &state_path_at(home.path(), &site, &id)), None);
        assert_eq!(content_key_for_path(home.path(), &site_path_at(home.path(), &site)), None);
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert!(validate_key("about-us_2.v1").is_ok());
        assert!(validate_key("../etc").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = TempDir::new().expect("tempdir");
        let store = FileStore::open_at(home.path()).expect("open");
        let site = store.insert_site(Site::new("agency", SiteConfig::default())).expect("insert");
        let tmp = site_path_at(home.path(), &site.name).with_extension("yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    #[cfg(unix)]
    fn site_file_created_with_perms() {
        use std::os::unix::fs::PermissionsExt;
        let home = TempDir::new().expect("tempdir");
        let store = FileStore::open_at(home.path()).expect("open");
        let site = store.insert_site(Site::new("agency", SiteConfig::default())).expect("insert");
        let mode = std::fs::metadata(site_path_at(home.path(), &site.name))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn missing_site_returns_not_found() {
        let home = TempDir::new().expect("tempdir");
        let store = FileStore::open_at(home.path()).expect("open");
        let err = store.get_site(&SiteName::from("ghost")).unwrap_err();
        assert!(matches!(err, StoreError::SiteNotFound { .. }));
    }
}
