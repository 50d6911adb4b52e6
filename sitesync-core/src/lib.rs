//! sitesync core library — domain types, site config, content stores, errors.
//!
//! - [`types`] — sites, content items, sync states, publish bookkeeping
//! - [`site_config`] — content-type → file mapping
//! - [`store`] — [`ContentStore`] boundary and [`MemoryStore`]
//! - [`file_store`] — YAML-on-disk [`FileStore`]
//! - [`config`] — [`EngineConfig`] loading

pub mod config;
pub mod error;
pub mod file_store;
pub mod site_config;
pub mod store;
pub mod types;

pub use config::{EngineConfig, FeatureFlags};
pub use error::StoreError;
pub use file_store::FileStore;
pub use site_config::{ConfigItem, FileFormat, SiteConfig};
pub use store::{ContentStore, MemoryStore, Upsert};
pub use types::{
    Author, BackendData, Branches, BuildStatus, ContentId, ContentItem, ContentStatus, Site,
    SiteName, SyncState, Version, VersionState,
};
