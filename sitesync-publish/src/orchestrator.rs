//! Per-(site, version) publish state machine.
//!
//! `NotStarted → Running → {Succeeded, Errored, Aborted}`. A publish that
//! triggers a build stays `Running` until the reconciler observes the build's
//! final status; one that skips the trigger ends `Succeeded`. Any failure is
//! recorded as `Errored` with the unpublished flag set before it is returned.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use sitesync_core::config::{when_enabled, PublishConfig};
use sitesync_core::{BuildStatus, ContentStore, FeatureFlags, Site, SiteName, Version};
use sitesync_renderer::context::pipeline_name;
use sitesync_sync::{BackendProvider, RetryPolicy};

use crate::error::PublishError;
use crate::lock::{hold_sync_lock, publish_lock_key, PublishLocks};
use crate::pipeline::{job_name, PipelineService};

/// Extension points around a publish attempt.
pub trait PublishHooks: Send + Sync {
    /// Runs after the site is marked `Running`, before any sync. An error
    /// fails the attempt.
    fn pre_publish(&self, _site: &Site, _version: Version) -> Result<(), PublishError> {
        Ok(())
    }

    /// Runs after every attempt, successful or not.
    fn post_publish(
        &self,
        _site: &Site,
        _version: Version,
        _outcome: Result<&PublishOutcome, &PublishError>,
    ) {
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl PublishHooks for NoHooks {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub triggered_by: Option<String>,
    /// `false` when a batch replaces per-site builds with one mass build.
    pub trigger_build: bool,
}

impl Default for PublishRequest {
    fn default() -> Self {
        Self {
            triggered_by: None,
            trigger_build: true,
        }
    }
}

impl PublishRequest {
    pub fn by(user: impl Into<String>) -> Self {
        Self {
            triggered_by: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn without_build(mut self) -> Self {
        self.trigger_build = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub site: SiteName,
    pub version: Version,
    pub build_id: Option<String>,
    /// Status persisted for the version after the attempt.
    pub build_status: BuildStatus,
}

pub struct PublishOrchestrator {
    store: Arc<dyn ContentStore>,
    backends: Arc<dyn BackendProvider>,
    pipelines: Arc<dyn PipelineService>,
    locks: Arc<dyn PublishLocks>,
    hooks: Arc<dyn PublishHooks>,
    retry: RetryPolicy,
    config: PublishConfig,
    features: FeatureFlags,
}

impl PublishOrchestrator {
    pub fn new(
        store: Arc<dyn ContentStore>,
        backends: Arc<dyn BackendProvider>,
        pipelines: Arc<dyn PipelineService>,
        locks: Arc<dyn PublishLocks>,
    ) -> Self {
        Self {
            store,
            backends,
            pipelines,
            locks,
            hooks: Arc::new(NoHooks),
            retry: RetryPolicy::none(),
            config: PublishConfig::default(),
            features: FeatureFlags::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PublishHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: PublishConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn pipelines(&self) -> &Arc<dyn PipelineService> {
        &self.pipelines
    }

    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    /// Publish one site at one version. Fails fast with
    /// [`PublishError::Locked`] while another attempt holds the lock.
    pub fn publish(
        &self,
        name: &SiteName,
        version: Version,
        request: &PublishRequest,
    ) -> Result<PublishOutcome, PublishError> {
        let key = publish_lock_key(name, version);
        let Some(_guard) = self.locks.try_acquire(&key, self.config.lock_lease())? else {
            tracing::warn!(site = %name, %version, "publish already in progress");
            return Err(PublishError::Locked { key });
        };

        let started = Utc::now();
        let site = self.store.update_site(name, &mut |site| {
            let state = site.version_mut(version);
            state.has_unpublished_changes = false;
            state.build_id = None;
            state.triggered_by = request.triggered_by.clone();
            state.set_status(BuildStatus::Running, started);
        })?;
        tracing::info!(site = %name, %version, triggered_by = ?request.triggered_by, "publish started");

        let result = self
            .attempt(&site, version, request)
            .and_then(|build_id| self.record_success(&site, version, build_id));
        if let Err(err) = &result {
            tracing::error!(site = %name, %version, error = %err, "publish failed");
            self.record_failure(name, version);
        }
        self.hooks.post_publish(&site, version, result.as_ref());
        result
    }

    fn attempt(
        &self,
        site: &Site,
        version: Version,
        request: &PublishRequest,
    ) -> Result<Option<String>, PublishError> {
        self.hooks.pre_publish(site, version)?;

        when_enabled(self.features.backend_sync, || self.sync_and_merge(site, version))
            .transpose()?;

        let pipeline = pipeline_name(site, version);
        let job = job_name(version);
        let build_id = when_enabled(self.features.pipelines && request.trigger_build, || {
            self.retry
                .run("trigger_build", || self.pipelines.trigger_build(&pipeline, &job))
        })
        .transpose()?;
        if let Some(id) = &build_id {
            tracing::info!(site = %site.name, %version, build_id = %id, "build triggered");
        }
        Ok(build_id)
    }

    fn sync_and_merge(&self, site: &Site, version: Version) -> Result<(), PublishError> {
        let _sync = hold_sync_lock(self.locks.as_ref(), &site.name, self.config.lock_lease())?;
        let backend = self.backends.backend_for(site)?;
        let report = backend.sync_all_content(None)?;
        tracing::debug!(
            site = %site.name,
            synced = report.synced.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "content synced before merge"
        );
        match version {
            Version::Draft => backend.merge_draft()?,
            Version::Live => backend.merge_live()?,
        }
        Ok(())
    }

    fn record_success(
        &self,
        site: &Site,
        version: Version,
        build_id: Option<String>,
    ) -> Result<PublishOutcome, PublishError> {
        let now = Utc::now();
        let status = if build_id.is_some() {
            BuildStatus::Running
        } else {
            BuildStatus::Succeeded
        };
        self.store.update_site(&site.name, &mut |site| {
            let state = site.version_mut(version);
            state.has_unpublished_changes = false;
            state.build_id = build_id.clone();
            if build_id.is_some() {
                state.build_date = Some(now);
            }
            state.set_status(status, now);
            site.first_published_at.get_or_insert(now);
            site.last_published_at = Some(now);
        })?;
        Ok(PublishOutcome {
            site: site.name.clone(),
            version,
            build_id,
            build_status: status,
        })
    }

    /// Errors here are logged, never returned: the attempt's own error wins.
    fn record_failure(&self, name: &SiteName, version: Version) {
        let now = Utc::now();
        let recorded = self.store.update_site(name, &mut |site| {
            let state = site.version_mut(version);
            state.set_status(BuildStatus::Errored, now);
            state.has_unpublished_changes = true;
        });
        if let Err(err) = recorded {
            tracing::error!(site = %name, %version, error = %err, "could not record publish failure");
        }
    }
}
