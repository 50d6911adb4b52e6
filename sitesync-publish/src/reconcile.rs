//! Build-status reconciliation.
//!
//! Polls the pipeline service for versions still `Running` once they are
//! older than `wait`; aborts builds still unfinished past `cutoff`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use sitesync_core::config::PublishConfig;
use sitesync_core::{BuildStatus, ContentStore, Site, SiteName, Version, VersionState};

use crate::error::{PipelineError, PublishError};
use crate::pipeline::PipelineService;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Versions polled this pass.
    pub checked: usize,
    /// Versions whose status changed (aborts and errors included).
    pub updated: usize,
    pub aborted: usize,
    pub errored: usize,
    /// Polls that failed and will be retried next pass.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Keep,
    Set(BuildStatus),
}

pub struct BuildStatusReconciler {
    store: Arc<dyn ContentStore>,
    pipelines: Arc<dyn PipelineService>,
    wait: Duration,
    cutoff: Duration,
}

impl BuildStatusReconciler {
    pub fn new(
        store: Arc<dyn ContentStore>,
        pipelines: Arc<dyn PipelineService>,
        wait: Duration,
        cutoff: Duration,
    ) -> Self {
        Self {
            store,
            pipelines,
            wait,
            cutoff,
        }
    }

    pub fn from_config(
        store: Arc<dyn ContentStore>,
        pipelines: Arc<dyn PipelineService>,
        config: &PublishConfig,
    ) -> Self {
        Self::new(store, pipelines, config.status_wait(), config.status_cutoff())
    }

    pub fn reconcile(&self) -> Result<ReconcileReport, PublishError> {
        self.reconcile_at(Utc::now())
    }

    pub fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport, PublishError> {
        let mut report = ReconcileReport::default();
        for site in self.store.list_sites()? {
            for version in Version::all() {
                let state = site.version(*version).clone();
                if !state.status.is_in_flight() {
                    continue;
                }
                let age = age_of(&state, now);
                if age.is_some_and(|age| age < self.wait) {
                    continue;
                }
                let past_cutoff = age.map_or(true, |age| age >= self.cutoff);
                self.reconcile_version(&site, *version, &state, past_cutoff, now, &mut report)?;
            }
        }
        if report.checked > 0 {
            tracing::info!(
                checked = report.checked,
                updated = report.updated,
                aborted = report.aborted,
                errored = report.errored,
                failed = report.failed,
                "reconcile pass finished"
            );
        }
        Ok(report)
    }

    fn reconcile_version(
        &self,
        site: &Site,
        version: Version,
        state: &VersionState,
        past_cutoff: bool,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), PublishError> {
        let Some(build_id) = state.build_id.as_deref() else {
            if past_cutoff {
                tracing::warn!(site = %site.name, %version, "running without a build id past cutoff");
                report.checked += 1;
                self.persist(&site.name, version, None, BuildStatus::Errored, now, report)?;
            }
            return Ok(());
        };

        report.checked += 1;
        let verdict = match self.pipelines.build_status(build_id) {
            Ok(status) if !status.is_final() && past_cutoff => self.abort(site, version, build_id),
            Ok(status) if status != state.status => Verdict::Set(status),
            Ok(_) => Verdict::Keep,
            Err(PipelineError::NotFound { .. }) => {
                tracing::warn!(site = %site.name, %version, build_id, "build not found");
                Verdict::Set(BuildStatus::Errored)
            }
            Err(err) => {
                tracing::warn!(site = %site.name, %version, build_id, error = %err, "status poll failed");
                report.failed += 1;
                Verdict::Keep
            }
        };

        if let Verdict::Set(status) = verdict {
            self.persist(&site.name, version, Some(build_id), status, now, report)?;
        }
        Ok(())
    }

    fn abort(&self, site: &Site, version: Version, build_id: &str) -> Verdict {
        match self.pipelines.abort_build(build_id) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                tracing::warn!(site = %site.name, %version, build_id, error = %err, "abort failed");
                return Verdict::Keep;
            }
        }
        tracing::info!(site = %site.name, %version, build_id, "build aborted past cutoff");
        Verdict::Set(BuildStatus::Aborted)
    }

    /// Applies `status` only if the version still points at `build_id`; a
    /// publish started since the poll owns the state now.
    fn persist(
        &self,
        name: &SiteName,
        version: Version,
        build_id: Option<&str>,
        status: BuildStatus,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), PublishError> {
        let mut applied = false;
        self.store.update_site(name, &mut |site| {
            let state = site.version_mut(version);
            if state.build_id.as_deref() != build_id || !state.status.is_in_flight() {
                return;
            }
            state.set_status(status, now);
            if matches!(
                status,
                BuildStatus::Failed | BuildStatus::Errored | BuildStatus::Aborted
            ) {
                state.has_unpublished_changes = true;
            }
            applied = true;
        })?;
        if applied {
            report.updated += 1;
            match status {
                BuildStatus::Aborted => report.aborted += 1,
                BuildStatus::Errored => report.errored += 1,
                _ => {}
            }
            tracing::debug!(site = %name, %version, %status, "build status updated");
        }
        Ok(())
    }
}

/// Age since the build started, or since the status last changed.
fn age_of(state: &VersionState, now: DateTime<Utc>) -> Option<Duration> {
    let since = state.build_date.or(state.status_updated_at)?;
    Some((now - since).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MemoryPipelines;
    use chrono::Duration as Span;
    use sitesync_core::{MemoryStore, SiteConfig};

    const WAIT: Duration = Duration::from_secs(60);
    const CUTOFF: Duration = Duration::from_secs(3600);

    struct Fixture {
        store: Arc<MemoryStore>,
        pipelines: Arc<MemoryPipelines>,
        reconciler: BuildStatusReconciler,
        site: SiteName,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let pipelines = Arc::new(MemoryPipelines::new());
        let site = store
            .insert_site(Site::new("Docs", SiteConfig::default()))
            .unwrap()
            .name;
        let reconciler =
            BuildStatusReconciler::new(store.clone(), pipelines.clone(), WAIT, CUTOFF);
        Fixture {
            store,
            pipelines,
            reconciler,
            site,
        }
    }

    impl Fixture {
        fn start_build(&self, version: Version, started: DateTime<Utc>) -> String {
            let id = self
                .pipelines
                .trigger_build("docs-draft", "build-draft")
                .unwrap();
            let build_id = id.clone();
            self.store
                .update_site(&self.site, &mut |site| {
                    let state = site.version_mut(version);
                    state.set_status(BuildStatus::Running, started);
                    state.build_id = Some(build_id.clone());
                    state.build_date = Some(started);
                })
                .unwrap();
            id
        }

        fn state(&self, version: Version) -> VersionState {
            self.store.get_site(&self.site).unwrap().version(version).clone()
        }
    }

    #[test]
    fn young_builds_are_not_polled() {
        let f = fixture();
        let now = Utc::now();
        f.start_build(Version::Draft, now - Span::seconds(10));
        let report = f.reconciler.reconcile_at(now).unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(f.state(Version::Draft).status, BuildStatus::Running);
    }

    #[test]
    fn finished_build_is_recorded() {
        let f = fixture();
        let now = Utc::now();
        let id = f.start_build(Version::Draft, now - Span::minutes(5));
        f.pipelines.set_build_status(&id, BuildStatus::Succeeded);

        let report = f.reconciler.reconcile_at(now).unwrap();
        assert_eq!(report.updated, 1);
        let state = f.state(Version::Draft);
        assert_eq!(state.status, BuildStatus::Succeeded);
        assert_eq!(state.status_updated_at, Some(now));
        assert!(!state.has_unpublished_changes);
    }

    #[test]
    fn failed_build_marks_unpublished() {
        let f = fixture();
        let now = Utc::now();
        let id = f.start_build(Version::Live, now - Span::minutes(5));
        f.pipelines.set_build_status(&id, BuildStatus::Failed);

        f.reconciler.reconcile_at(now).unwrap();
        let state = f.state(Version::Live);
        assert_eq!(state.status, BuildStatus::Failed);
        assert!(state.has_unpublished_changes);
    }

    #[test]
    fn still_running_within_cutoff_is_untouched() {
        let f = fixture();
        let now = Utc::now();
        f.start_build(Version::Draft, now - Span::minutes(5));
        let report = f.reconciler.reconcile_at(now).unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(f.state(Version::Draft).status, BuildStatus::Running);
    }

    #[test]
    fn running_past_cutoff_is_aborted() {
        let f = fixture();
        let now = Utc::now();
        let id = f.start_build(Version::Draft, now - Span::hours(2));

        let report = f.reconciler.reconcile_at(now).unwrap();
        assert_eq!(report.aborted, 1);
        assert_eq!(f.pipelines.build(&id).unwrap().status, BuildStatus::Aborted);
        let state = f.state(Version::Draft);
        assert_eq!(state.status, BuildStatus::Aborted);
        assert!(state.has_unpublished_changes);
        assert!(f.pipelines.calls().iter().any(|c| c == "abort_build"));
    }

    #[test]
    fn vanished_build_is_errored() {
        let f = fixture();
        let now = Utc::now();
        let id = f.start_build(Version::Draft, now - Span::minutes(5));
        f.pipelines.forget_build(&id);

        let report = f.reconciler.reconcile_at(now).unwrap();
        assert_eq!(report.errored, 1);
        assert_eq!(f.state(Version::Draft).status, BuildStatus::Errored);
    }

    #[test]
    fn transient_poll_failure_is_retried_later() {
        let f = fixture();
        let now = Utc::now();
        f.start_build(Version::Draft, now - Span::minutes(5));
        f.pipelines
            .fail_next("build_status", sitesync_sync::ErrorClass::Transient);

        let report = f.reconciler.reconcile_at(now).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(f.state(Version::Draft).status, BuildStatus::Running);
    }
}
