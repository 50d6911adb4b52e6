//! Task entry points.
//!
//! Everything a daemon job or CLI command can ask for, keyed by primitive
//! identifiers. Feature flags are applied here: a disabled concern returns
//! `Ok(None)` without touching the external service.

use std::path::Path;
use std::sync::Arc;

use sitesync_core::config::when_enabled;
use sitesync_core::{
    ContentId, ContentStore, EngineConfig, FileStore, Site, SiteConfig, SiteName, Version,
};
use sitesync_renderer::PipelineRenderer;
use sitesync_sync::{
    all_site_statuses, diff_pending, BackendSync, ChecksumTracker, GitBackendProvider, GitHost,
    GitHubClient, ImportReport, ItemDiff, RateGovernor, RetryPolicy, SiteStatus, SyncError,
    SyncReport, SyncResult,
};

use crate::batch::{publish_batch, upsert_pipelines_batch, BatchReport, BatchScheduler};
use crate::error::{PipelineError, PublishError};
use crate::lock::{hold_sync_lock, FileLocks, LockGuard, PublishLocks};
use crate::orchestrator::{NoHooks, PublishHooks, PublishOrchestrator, PublishOutcome, PublishRequest};
use crate::pipeline::{upsert_site_pipelines, HttpPipelineService, PipelineService};
use crate::reconcile::{BuildStatusReconciler, ReconcileReport};

/// External collaborators of an [`Engine`].
pub struct EngineParts {
    pub store: Arc<dyn ContentStore>,
    pub host: Arc<dyn GitHost>,
    pub governor: Arc<RateGovernor>,
    pub pipelines: Arc<dyn PipelineService>,
    pub locks: Arc<dyn PublishLocks>,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn ContentStore>,
    backends: Arc<GitBackendProvider>,
    pipelines: Arc<dyn PipelineService>,
    locks: Arc<dyn PublishLocks>,
    renderer: Arc<PipelineRenderer>,
    hooks: Arc<dyn PublishHooks>,
    retry: RetryPolicy,
}

impl Engine {
    /// Production wiring: YAML store and lock files under `home`, GitHub and
    /// the pipeline service over HTTP.
    pub fn from_config(home: &Path, config: EngineConfig) -> Result<Self, PublishError> {
        let governor = Arc::new(RateGovernor::from_config(&config.sync));
        let host = GitHubClient::new(&config.github, governor.clone())?;
        let parts = EngineParts {
            store: Arc::new(FileStore::open_at(home)?),
            host: Arc::new(host),
            governor,
            pipelines: Arc::new(HttpPipelineService::new(&config.pipelines)),
            locks: Arc::new(FileLocks::open_at(home)?),
        };
        Self::assemble(config, parts)
    }

    pub fn assemble(config: EngineConfig, parts: EngineParts) -> Result<Self, PublishError> {
        let renderer = PipelineRenderer::new(config.pipelines.template_dir.as_deref())
            .map_err(PipelineError::from)?;
        let retry = RetryPolicy::from_config(&config.sync);
        let backends = GitBackendProvider::new(
            parts.host,
            parts.store.clone(),
            retry.clone(),
            parts.governor,
        );
        Ok(Self {
            config: Arc::new(config),
            store: parts.store,
            backends: Arc::new(backends),
            pipelines: parts.pipelines,
            locks: parts.locks,
            renderer: Arc::new(renderer),
            hooks: Arc::new(NoHooks),
            retry,
        })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PublishHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    fn site(&self, name: &str) -> Result<Site, PublishError> {
        Ok(self.store.get_site(&SiteName::from(name))?)
    }

    fn sync_lock(&self, site: &Site) -> Result<LockGuard, PublishError> {
        hold_sync_lock(self.locks.as_ref(), &site.name, self.config.publish.lock_lease())
    }

    fn orchestrator(&self) -> PublishOrchestrator {
        PublishOrchestrator::new(
            self.store.clone(),
            self.backends.clone(),
            self.pipelines.clone(),
            self.locks.clone(),
        )
        .with_hooks(self.hooks.clone())
        .with_retry(self.retry.clone())
        .with_config(self.config.publish.clone())
        .with_features(self.config.features)
    }

    fn scheduler(&self) -> BatchScheduler {
        BatchScheduler::from_config(&self.config.publish)
    }

    // -- sites --------------------------------------------------------------

    /// Register a site. Existing sites are returned unchanged.
    pub fn add_site(&self, name: &str) -> Result<Site, PublishError> {
        Ok(self.store.insert_site(Site::new(name, SiteConfig::default()))?)
    }

    pub fn site_names(&self) -> Result<Vec<String>, PublishError> {
        Ok(self.store.list_sites()?.into_iter().map(|s| s.name.0).collect())
    }

    // -- sync ---------------------------------------------------------------

    /// Re-track one item and push it. A confirmed write marks both versions
    /// as having unpublished changes.
    pub fn sync_content_item(
        &self,
        site: &str,
        content_id: &str,
    ) -> Result<Option<SyncResult>, PublishError> {
        let site = self.site(site)?;
        let id = ContentId::from(content_id);
        if let Some(item) = self.store.get_item(&site.name, &id)? {
            ChecksumTracker::new(self.store.clone()).upsert(&item)?;
        }
        // tracked before locking: a concurrent sync still sees the item dirty
        let _sync = self.sync_lock(&site)?;
        let synced = when_enabled(self.config.features.backend_sync, || -> Result<_, SyncError> {
            let Some(state) = self.store.get_sync_state(&site.name, &id)? else {
                return Ok(None);
            };
            self.backends.git_backend(&site).sync_content(&state)
        })
        .transpose()?
        .flatten();

        if let Some(result) = &synced {
            self.store.update_site(&site.name, &mut |site| {
                for version in Version::all() {
                    site.version_mut(*version).has_unpublished_changes = true;
                }
            })?;
            tracing::info!(site = %site.name, content_id = %result.content_id, deleted = result.deleted, "content synced");
        }
        Ok(synced)
    }

    pub fn create_backend(&self, site: &str) -> Result<Option<()>, PublishError> {
        let site = self.site(site)?;
        let _sync = self.sync_lock(&site)?;
        let created = when_enabled(self.config.features.backend_sync, || {
            self.backends.git_backend(&site).create_website_in_backend()
        });
        Ok(created.transpose()?)
    }

    /// Re-track every item of the site, then push the dirty ones in batched
    /// commits.
    pub fn sync_site(&self, site: &str) -> Result<Option<SyncReport>, PublishError> {
        let site = self.site(site)?;
        let _sync = self.sync_lock(&site)?;
        ChecksumTracker::new(self.store.clone()).upsert_site(&site.name)?;
        let report = when_enabled(self.config.features.backend_sync, || {
            self.backends.git_backend(&site).sync_all_content(None)
        });
        Ok(report.transpose()?)
    }

    pub fn import_site(
        &self,
        site: &str,
        git_ref: Option<&str>,
        path: Option<&str>,
    ) -> Result<Option<ImportReport>, PublishError> {
        let site = self.site(site)?;
        let _sync = self.sync_lock(&site)?;
        let report = when_enabled(self.config.features.backend_sync, || {
            self.backends
                .git_backend(&site)
                .sync_all_content_to_store(git_ref, path)
        });
        Ok(report.transpose()?)
    }

    /// Delete orphaned backend files. Returns the removed paths.
    pub fn cleanup_site(&self, site: &str) -> Result<Option<Vec<String>>, PublishError> {
        let site = self.site(site)?;
        let _sync = self.sync_lock(&site)?;
        let removed = when_enabled(self.config.features.backend_sync, || {
            self.backends.git_backend(&site).delete_orphaned_content()
        });
        Ok(removed.transpose()?)
    }

    // -- publish ------------------------------------------------------------

    pub fn publish(
        &self,
        site: &str,
        version: &str,
        triggered_by: Option<&str>,
    ) -> Result<PublishOutcome, PublishError> {
        let version: Version = version.parse().map_err(PublishError::InvalidVersion)?;
        let request = PublishRequest {
            triggered_by: triggered_by.map(str::to_string),
            ..PublishRequest::default()
        };
        self.orchestrator()
            .publish(&SiteName::from(site), version, &request)
    }

    pub async fn publish_batch(
        &self,
        sites: &[String],
        version: &str,
        mass_build: bool,
        triggered_by: Option<&str>,
    ) -> Result<BatchReport, PublishError> {
        let version: Version = version.parse().map_err(PublishError::InvalidVersion)?;
        publish_batch(
            Arc::new(self.orchestrator()),
            &self.scheduler(),
            sites.iter().map(|s| SiteName::from(s.as_str())).collect(),
            version,
            mass_build,
            triggered_by.map(str::to_string),
        )
        .await
    }

    pub fn upsert_site_pipelines(&self, site: &str) -> Result<Option<Vec<String>>, PublishError> {
        let site = self.site(site)?;
        let names = when_enabled(self.config.features.pipelines, || {
            upsert_site_pipelines(
                self.pipelines.as_ref(),
                &self.renderer,
                &self.retry,
                &site,
                &self.config.github.organization,
            )
        });
        Ok(names.transpose()?)
    }

    pub async fn upsert_pipelines(
        &self,
        sites: &[String],
    ) -> Result<Option<BatchReport>, PublishError> {
        if !self.config.features.pipelines {
            tracing::info!("pipelines disabled; skipping upsert");
            return Ok(None);
        }
        let report = upsert_pipelines_batch(
            self.store.clone(),
            self.pipelines.clone(),
            self.renderer.clone(),
            self.retry.clone(),
            self.config.github.organization.clone(),
            &self.scheduler(),
            sites.iter().map(|s| SiteName::from(s.as_str())).collect(),
        )
        .await?;
        Ok(Some(report))
    }

    pub fn reconcile(&self) -> Result<ReconcileReport, PublishError> {
        BuildStatusReconciler::from_config(
            self.store.clone(),
            self.pipelines.clone(),
            &self.config.publish,
        )
        .reconcile()
    }

    // -- reports ------------------------------------------------------------

    pub fn status(&self) -> Result<Vec<SiteStatus>, PublishError> {
        Ok(all_site_statuses(self.store.as_ref())?)
    }

    pub fn diff(&self, site: &str) -> Result<Vec<ItemDiff>, PublishError> {
        let site = self.site(site)?;
        Ok(diff_pending(&self.backends.git_backend(&site))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLocks;
    use crate::pipeline::MemoryPipelines;
    use sitesync_core::{BuildStatus, ContentItem, FeatureFlags, MemoryStore};
    use sitesync_sync::MemoryGitHost;
    use std::time::Duration;

    struct Fixture {
        engine: Engine,
        store: Arc<MemoryStore>,
        host: Arc<MemoryGitHost>,
        pipelines: Arc<MemoryPipelines>,
    }

    fn fixture(features: FeatureFlags) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(MemoryGitHost::new());
        let pipelines = Arc::new(MemoryPipelines::new());
        let mut config = EngineConfig::default();
        config.github.organization = "agency-sites".into();
        config.features = features;
        let engine = Engine::assemble(
            config,
            EngineParts {
                store: store.clone(),
                host: host.clone(),
                governor: Arc::new(RateGovernor::new(0, Duration::ZERO)),
                pipelines: pipelines.clone(),
                locks: Arc::new(MemoryLocks::new()),
            },
        )
        .unwrap()
        .with_retry(RetryPolicy::none());
        Fixture { engine, store, host, pipelines }
    }

    fn seed(f: &Fixture) -> Site {
        let site = f.engine.add_site("agency").unwrap();
        let mut item = ContentItem::new("agency", "about", "page");
        item.filename = "about".into();
        item.title = "About".into();
        item.body = "Who we are.\n".into();
        f.store.save_item(&item).unwrap();
        site
    }

    #[test]
    fn sync_content_item_pushes_and_marks_unpublished() {
        let f = fixture(FeatureFlags::default());
        let site = seed(&f);
        f.engine.create_backend("agency").unwrap();

        let result = f.engine.sync_content_item("agency", "about").unwrap().unwrap();
        assert!(!result.deleted);
        assert_eq!(f.host.commits(&site.repo_name()).len(), 1);
        let site = f.store.get_site(&site.name).unwrap();
        assert!(site.draft.has_unpublished_changes);
        assert!(site.live.has_unpublished_changes);

        assert!(f.engine.sync_content_item("agency", "about").unwrap().is_none());
    }

    #[test]
    fn disabled_backend_sync_still_tracks_checksums() {
        let f = fixture(FeatureFlags { backend_sync: false, pipelines: true });
        let site = seed(&f);

        assert!(f.engine.sync_content_item("agency", "about").unwrap().is_none());
        assert!(f.engine.create_backend("agency").unwrap().is_none());
        assert_eq!(f.host.call_count(), 0);
        let state = f
            .store
            .get_sync_state(&site.name, &ContentId::from("about"))
            .unwrap()
            .unwrap();
        assert!(state.never_synced());
    }

    #[test]
    fn publish_rejects_unknown_version() {
        let f = fixture(FeatureFlags::default());
        seed(&f);
        let err = f.engine.publish("agency", "staging", None).unwrap_err();
        assert!(matches!(err, PublishError::InvalidVersion(_)));
    }

    #[test]
    fn publish_accepts_branch_aliases() {
        let f = fixture(FeatureFlags::default());
        seed(&f);
        f.engine.create_backend("agency").unwrap();
        let outcome = f.engine.publish("agency", "preview", Some("editor")).unwrap();
        assert_eq!(outcome.version, Version::Draft);
        assert_eq!(outcome.build_status, BuildStatus::Running);
    }

    #[test]
    fn pipelines_flag_gates_upserts() {
        let f = fixture(FeatureFlags { backend_sync: true, pipelines: false });
        seed(&f);
        assert!(f.engine.upsert_site_pipelines("agency").unwrap().is_none());
        assert!(f.pipelines.calls().is_empty());
    }

    #[test]
    fn site_pipelines_upserted_for_both_versions() {
        let f = fixture(FeatureFlags::default());
        seed(&f);
        let names = f.engine.upsert_site_pipelines("agency").unwrap().unwrap();
        assert_eq!(names, vec!["agency-draft".to_string(), "agency-live".to_string()]);
        assert!(!f.pipelines.pipeline("agency-live").unwrap().paused);
    }
}
