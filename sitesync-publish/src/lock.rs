//! Non-blocking advisory locks with a bounded lease.
//!
//! A held lock is released when its [`LockGuard`] drops, and only if the
//! guard's acquisition still owns it. An expired lease is treated as free, so
//! a crashed holder cannot block a site forever.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sitesync_core::file_store::root_at;
use sitesync_core::types::slugify;
use sitesync_core::{SiteName, Version};

use crate::error::{io_err, PublishError};

/// `{site-slug}-publish-{version}`
pub fn publish_lock_key(site: &SiteName, version: Version) -> String {
    format!("{}-publish-{version}", slugify(&site.0))
}

/// `{site-slug}-sync`. Held by anything that commits to the site's branches.
pub fn sync_lock_key(site: &SiteName) -> String {
    format!("{}-sync", slugify(&site.0))
}

/// Take the site's sync lock or fail fast with [`PublishError::Locked`].
pub fn hold_sync_lock(
    locks: &dyn PublishLocks,
    site: &SiteName,
    lease: Duration,
) -> Result<LockGuard, PublishError> {
    let key = sync_lock_key(site);
    match locks.try_acquire(&key, lease)? {
        Some(guard) => Ok(guard),
        None => {
            tracing::warn!(site = %site, "sync already in progress");
            Err(PublishError::Locked { key })
        }
    }
}

pub struct LockGuard {
    key: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(key: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key: key.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

pub trait PublishLocks: Send + Sync {
    /// `None` when another holder's lease is still live.
    fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<LockGuard>, PublishError>;
}

fn expiry(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1))
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: Uuid,
    until: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLocks {
    held: Arc<Mutex<HashMap<String, Holder>>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.get(key).is_some_and(|h| h.until > Utc::now()))
            .unwrap_or(false)
    }
}

impl PublishLocks for MemoryLocks {
    fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<LockGuard>, PublishError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| PublishError::Poisoned)?;
        if held.get(key).is_some_and(|h| h.until > Utc::now()) {
            return Ok(None);
        }
        let token = Uuid::new_v4();
        held.insert(key.to_string(), Holder { token, until: expiry(lease) });

        let table = self.held.clone();
        let owned = key.to_string();
        Ok(Some(LockGuard::new(key, move || {
            if let Ok(mut held) = table.lock() {
                // a successor may hold the key after our lease expired
                if held.get(&owned).is_some_and(|h| h.token == token) {
                    held.remove(&owned);
                }
            }
        })))
    }
}

// ---------------------------------------------------------------------------
// Lock files
// ---------------------------------------------------------------------------

/// How long an unreadable lock file is respected before it may be broken.
pub const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    pid: u32,
    token: Uuid,
    expires_at: DateTime<Utc>,
}

fn read_lock(path: &Path) -> Option<LockFile> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Lock files under `<home>/.sitesync/locks/`, created exclusively so the
/// lock holds across processes.
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
    grace: Duration,
}

pub fn locks_dir_at(home: &Path) -> PathBuf {
    root_at(home).join("locks")
}

impl FileLocks {
    pub fn open_at(home: &Path) -> Result<Self, PublishError> {
        let dir = locks_dir_at(home);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(Self {
            dir,
            grace: UNREADABLE_LOCK_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", slugify(key)))
    }

    /// Writes the lock body to a private file, then links it into place, so
    /// the lock path never exists without its contents.
    fn create(&self, path: &Path, token: Uuid, lease: Duration) -> Result<bool, PublishError> {
        let body = serde_json::to_string(&LockFile {
            pid: std::process::id(),
            token,
            expires_at: expiry(lease),
        })
        .map_err(|e| io_err(path, std::io::Error::new(ErrorKind::InvalidData, e)))?;

        let staged = path.with_extension(format!("{}.tmp", token.simple()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged)
            .map_err(|e| io_err(&staged, e))?;
        let linked = file
            .write_all(body.as_bytes())
            .and_then(|()| file.sync_all())
            .and_then(|()| std::fs::hard_link(&staged, path));
        let _ = std::fs::remove_file(&staged);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_err(path, e)),
        }
    }

    /// The token of an expired holder, or `None` while the lock is live.
    /// A lock file that cannot be parsed is live until it is older than the
    /// grace period.
    fn expired_holder(&self, path: &Path) -> Option<Option<Uuid>> {
        if let Some(lock) = read_lock(path) {
            return (lock.expires_at <= Utc::now()).then_some(Some(lock.token));
        }
        let age = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(|modified| {
                SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO)
            });
        match age {
            Some(age) if age < self.grace => None,
            _ => Some(None),
        }
    }

    fn break_expired(&self, key: &str, path: &Path) -> Result<bool, PublishError> {
        let Some(stale) = self.expired_holder(path) else {
            return Ok(false);
        };
        // re-check right before removing: another process may have broken
        // and re-created the lock since we looked
        if read_lock(path).map(|lock| lock.token) != stale {
            return Ok(false);
        }
        tracing::warn!(key, path = %path.display(), "breaking expired lock");
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(io_err(path, e)),
        }
    }
}

impl PublishLocks for FileLocks {
    fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<LockGuard>, PublishError> {
        let path = self.path_for(key);
        let token = Uuid::new_v4();
        let mut acquired = self.create(&path, token, lease)?;
        if !acquired && self.break_expired(key, &path)? {
            acquired = self.create(&path, token, lease)?;
        }
        if !acquired {
            return Ok(None);
        }
        Ok(Some(LockGuard::new(key, move || {
            if read_lock(&path).is_some_and(|lock| lock.token == token) {
                let _ = std::fs::remove_file(&path);
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LEASE: Duration = Duration::from_secs(60);

    #[test]
    fn memory_lock_is_single_flight() {
        let locks = MemoryLocks::new();
        let guard = locks.try_acquire("a", LEASE).unwrap().expect("first");
        assert!(locks.try_acquire("a", LEASE).unwrap().is_none());
        assert!(locks.try_acquire("b", LEASE).unwrap().is_some());
        drop(guard);
        assert!(!locks.is_held("a"));
        assert!(locks.try_acquire("a", LEASE).unwrap().is_some());
    }

    #[test]
    fn memory_lease_expires() {
        let locks = MemoryLocks::new();
        let _stale = locks.try_acquire("a", Duration::ZERO).unwrap().expect("first");
        assert!(locks.try_acquire("a", LEASE).unwrap().is_some());
    }

    #[test]
    fn file_lock_released_on_drop() {
        let home = TempDir::new().unwrap();
        let locks = FileLocks::open_at(home.path()).unwrap();
        let guard = locks.try_acquire("agency-publish-draft", LEASE).unwrap().expect("first");
        assert!(locks.path_for(guard.key()).exists());

        let other = FileLocks::open_at(home.path()).unwrap();
        assert!(other.try_acquire("agency-publish-draft", LEASE).unwrap().is_none());
        drop(guard);
        assert!(other.try_acquire("agency-publish-draft", LEASE).unwrap().is_some());
    }

    #[test]
    fn memory_stale_guard_does_not_release_successor() {
        let locks = MemoryLocks::new();
        let stale = locks.try_acquire("k", Duration::ZERO).unwrap().expect("stale");
        let _second = locks.try_acquire("k", LEASE).unwrap().expect("second");
        drop(stale);
        assert!(locks.is_held("k"));
        assert!(locks.try_acquire("k", LEASE).unwrap().is_none());
    }

    #[test]
    fn file_stale_guard_does_not_release_successor() {
        let home = TempDir::new().unwrap();
        let locks = FileLocks::open_at(home.path()).unwrap();
        let stale = locks.try_acquire("k", Duration::ZERO).unwrap().expect("stale");
        let _second = locks.try_acquire("k", LEASE).unwrap().expect("second");
        drop(stale);
        assert!(locks.path_for("k").exists());
        assert!(locks.try_acquire("k", LEASE).unwrap().is_none());
    }

    #[test]
    fn fresh_unreadable_lock_file_is_respected() {
        let home = TempDir::new().unwrap();
        let locks = FileLocks::open_at(home.path()).unwrap();
        std::fs::write(locks.path_for("k"), "").unwrap();
        assert!(locks.try_acquire("k", LEASE).unwrap().is_none());
        assert!(locks.path_for("k").exists());
    }

    #[test]
    fn unreadable_lock_file_is_broken_after_grace() {
        let home = TempDir::new().unwrap();
        let locks = FileLocks::open_at(home.path()).unwrap().with_grace(Duration::ZERO);
        std::fs::write(locks.path_for("k"), "not json").unwrap();
        let guard = locks.try_acquire("k", LEASE).unwrap();
        assert!(guard.is_some());
        assert!(read_lock(&locks.path_for("k")).is_some());
    }

    #[test]
    fn lock_files_leave_no_staging_files() {
        let home = TempDir::new().unwrap();
        let locks = FileLocks::open_at(home.path()).unwrap();
        let _guard = locks.try_acquire("k", LEASE).unwrap().expect("first");
        assert!(locks.try_acquire("k", LEASE).unwrap().is_none());
        let names: Vec<_> = std::fs::read_dir(&locks.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["k.lock".to_string()]);
    }

    #[test]
    fn lock_keys_are_per_site_and_version() {
        let site = SiteName::from("Agency Site");
        assert_eq!(publish_lock_key(&site, Version::Draft), "agency-site-publish-draft");
        assert_ne!(
            publish_lock_key(&site, Version::Draft),
            publish_lock_key(&site, Version::Live)
        );
        assert_eq!(sync_lock_key(&site), "agency-site-sync");
    }
}
