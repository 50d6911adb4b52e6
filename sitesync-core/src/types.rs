//! Domain types for sites, content items and their sync bookkeeping.
//!
//! All types are serializable via serde so both the in-memory and the YAML
//! file store can persist them unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::site_config::SiteConfig;

/// Hosting APIs cap repository names at 100 characters.
pub const REPO_NAME_MAX: usize = 100;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed site name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteName(pub String);

impl fmt::Display for SiteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SiteName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SiteName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Stable text identifier of a content item, unique within its site.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentId(pub String);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// Lifecycle status of a content item. Physical removal is a separate store
/// operation gated on backend confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    #[default]
    Active,
    SoftDeleted,
}

/// Who last edited an item; commits are attributed per author.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// A unit of website content owned by the editing subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentId,
    pub site: SiteName,
    /// Type tag; selects the [`crate::site_config::ConfigItem`] for this item.
    pub content_type: String,
    #[serde(default)]
    pub dirpath: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default)]
    pub status: ContentStatus,
    pub updated_at: DateTime<Utc>,
}

impl ContentItem {
    pub fn new(site: impl Into<SiteName>, id: impl Into<ContentId>, content_type: &str) -> Self {
        Self {
            id: id.into(),
            site: site.into(),
            content_type: content_type.to_string(),
            dirpath: String::new(),
            filename: String::new(),
            title: String::new(),
            metadata: BTreeMap::new(),
            body: String::new(),
            author: None,
            status: ContentStatus::Active,
            updated_at: Utc::now(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ContentStatus::SoftDeleted
    }
}

/// Opaque per-backend bookkeeping stored next to a [`SyncState`].
pub type BackendData = BTreeMap<String, serde_json::Value>;

/// `backend_data` key holding the last path the item was written to.
pub const BACKEND_PATH_KEY: &str = "path";

/// Checksum pair for one content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub content_id: ContentId,
    pub current_checksum: String,
    #[serde(default)]
    pub synced_checksum: Option<String>,
    #[serde(default)]
    pub backend_data: Option<BackendData>,
}

impl SyncState {
    pub fn new(content_id: ContentId) -> Self {
        Self {
            content_id,
            current_checksum: String::new(),
            synced_checksum: None,
            backend_data: None,
        }
    }

    /// `true` only when both checksums are present and equal.
    pub fn is_synced(&self) -> bool {
        !self.current_checksum.is_empty()
            && self.synced_checksum.as_deref() == Some(self.current_checksum.as_str())
    }

    pub fn never_synced(&self) -> bool {
        self.synced_checksum.is_none()
    }

    /// Last path recorded by a backend write, if any.
    pub fn backend_path(&self) -> Option<&str> {
        self.backend_data
            .as_ref()
            .and_then(|data| data.get(BACKEND_PATH_KEY))
            .and_then(|value| value.as_str())
    }

    pub fn set_backend_path(&mut self, path: &str) {
        self.backend_data
            .get_or_insert_with(BTreeMap::new)
            .insert(BACKEND_PATH_KEY.to_string(), serde_json::Value::from(path));
    }
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Publishable version of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Version {
    Draft,
    Live,
}

impl Version {
    pub fn all() -> &'static [Version] {
        &[Version::Draft, Version::Live]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Draft => "draft",
            Version::Live => "live",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" | "preview" => Ok(Version::Draft),
            "live" | "release" => Ok(Version::Live),
            other => Err(format!("unknown version '{other}'; expected: draft, live")),
        }
    }
}

/// Status of a publish attempt and of the build it triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    /// Final statuses are never polled again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Errored | BuildStatus::Aborted
        )
    }

    /// `NotStarted` is neither in flight nor final.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, BuildStatus::Running)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::NotStarted => "not_started",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Publish bookkeeping for one version of a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VersionState {
    #[serde(default)]
    pub status: BuildStatus,
    #[serde(default)]
    pub status_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub build_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_unpublished_changes: bool,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl VersionState {
    pub fn set_status(&mut self, status: BuildStatus, at: DateTime<Utc>) {
        self.status = status;
        self.status_updated_at = Some(at);
    }
}

/// Branch names of a site repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branches {
    pub main: String,
    pub draft: String,
    pub live: String,
}

impl Default for Branches {
    fn default() -> Self {
        Self {
            main: "main".to_string(),
            draft: "preview".to_string(),
            live: "release".to_string(),
        }
    }
}

impl Branches {
    pub fn for_version(&self, version: Version) -> &str {
        match version {
            Version::Draft => &self.draft,
            Version::Live => &self.live,
        }
    }
}

/// One website backed by one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub name: SiteName,
    /// Stable unique id; part of the repository name.
    pub uid: Uuid,
    #[serde(default)]
    pub branches: Branches,
    #[serde(default)]
    pub config: SiteConfig,
    #[serde(default)]
    pub draft: VersionState,
    #[serde(default)]
    pub live: VersionState,
    #[serde(default)]
    pub first_published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Site {
    pub fn new(name: impl Into<SiteName>, config: SiteConfig) -> Self {
        Self {
            name: name.into(),
            uid: Uuid::new_v4(),
            branches: Branches::default(),
            config,
            draft: VersionState::default(),
            live: VersionState::default(),
            first_published_at: None,
            last_published_at: None,
            created_at: Utc::now(),
        }
    }

    /// Deterministic repository name: slugged site name, truncated so the
    /// whole name fits [`REPO_NAME_MAX`], then `-` and the uid in hex.
    pub fn repo_name(&self) -> String {
        let uid = self.uid.simple().to_string();
        let budget = REPO_NAME_MAX - uid.len() - 1;
        let slug = slugify(&self.name.0);
        let truncated: String = slug.chars().take(budget).collect();
        let truncated = truncated.trim_end_matches('-');
        if truncated.is_empty() {
            uid
        } else {
            format!("{truncated}-{uid}")
        }
    }

    pub fn version(&self, version: Version) -> &VersionState {
        match version {
            Version::Draft => &self.draft,
            Version::Live => &self.live,
        }
    }

    pub fn version_mut(&mut self, version: Version) -> &mut VersionState {
        match version {
            Version::Draft => &mut self.draft,
            Version::Live => &mut self.live,
        }
    }
}

/// Lowercase ASCII alphanumerics separated by single dashes.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
