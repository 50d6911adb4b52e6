use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sitesync_core::{
    BuildStatus, ContentItem, ContentStore, EngineConfig, MemoryStore, Site, SiteName, Version,
    VersionState,
};
use sitesync_publish::{
    sync_lock_key, BatchOutcome, Engine, EngineParts, MemoryLocks, MemoryPipelines, PublishError,
    PublishHooks, PublishLocks, PublishOutcome,
};
use sitesync_sync::{ErrorClass, MemoryGitHost, RateGovernor, RetryPolicy};

struct Harness {
    engine: Engine,
    store: Arc<MemoryStore>,
    host: Arc<MemoryGitHost>,
    pipelines: Arc<MemoryPipelines>,
    locks: Arc<MemoryLocks>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let host = Arc::new(MemoryGitHost::new());
    let pipelines = Arc::new(MemoryPipelines::new());
    let locks = Arc::new(MemoryLocks::new());
    let mut config = EngineConfig::default();
    config.github.organization = "agency-sites".into();
    config.publish.batch_chunk_size = 2;
    let engine = Engine::assemble(
        config,
        EngineParts {
            store: store.clone(),
            host: host.clone(),
            governor: Arc::new(RateGovernor::new(0, Duration::ZERO)),
            pipelines: pipelines.clone(),
            locks: locks.clone(),
        },
    )
    .unwrap()
    .with_retry(RetryPolicy::none());
    Harness { engine, store, host, pipelines, locks }
}

fn add_site(h: &Harness, name: &str) -> Site {
    let site = h.engine.add_site(name).unwrap();
    let mut item = ContentItem::new(name, "home", "page");
    item.filename = "home".into();
    item.title = "Home".into();
    item.body = format!("Welcome to {name}.\n");
    h.store.save_item(&item).unwrap();
    h.engine.create_backend(name).unwrap();
    site
}

fn version_state(h: &Harness, site: &str, version: Version) -> VersionState {
    h.store
        .get_site(&SiteName::from(site))
        .unwrap()
        .version(version)
        .clone()
}

#[test]
fn publish_live_syncs_merges_and_triggers() {
    let h = harness();
    let site = add_site(&h, "agency");

    let outcome = h.engine.publish("agency", "live", Some("editor")).unwrap();
    assert_eq!(outcome.build_status, BuildStatus::Running);
    let build_id = outcome.build_id.unwrap();
    assert_eq!(h.pipelines.build(&build_id).unwrap().job, "build-live");

    let release = h.host.files(&site.repo_name(), "release").unwrap();
    assert!(release.contains_key("content/home.md"));

    let state = version_state(&h, "agency", Version::Live);
    assert_eq!(state.triggered_by.as_deref(), Some("editor"));
    assert!(!state.has_unpublished_changes);
    assert!(h.store.get_site(&site.name).unwrap().first_published_at.is_some());
}

#[test]
fn publish_error_restores_unpublished_flag() {
    let h = harness();
    add_site(&h, "agency");
    h.store
        .update_site(&SiteName::from("agency"), &mut |site| {
            site.draft.has_unpublished_changes = true;
        })
        .unwrap();
    h.pipelines.fail_next("trigger_build", ErrorClass::Fatal);

    let err = h.engine.publish("agency", "draft", None).unwrap_err();
    assert!(matches!(err, PublishError::Pipeline(_)));

    let state = version_state(&h, "agency", Version::Draft);
    assert_eq!(state.status, BuildStatus::Errored);
    assert!(state.has_unpublished_changes);
    assert!(state.status_updated_at.is_some());
}

/// Blocks the first pre-publish until released, so a second attempt runs
/// while the first holds the lock.
struct Gate {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl PublishHooks for Gate {
    fn pre_publish(&self, _site: &Site, _version: Version) -> Result<(), PublishError> {
        let entered = self.entered.lock().unwrap().take();
        if let Some(entered) = entered {
            entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        Ok(())
    }
}

#[test]
fn concurrent_publish_is_single_flight() {
    let h = harness();
    add_site(&h, "agency");
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let engine = h.engine.clone().with_hooks(Arc::new(Gate {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    }));

    let first_engine = engine.clone();
    let first = thread::spawn(move || first_engine.publish("agency", "draft", None));
    entered_rx.recv().unwrap();

    let err = engine.publish("agency", "draft", None).unwrap_err();
    assert!(matches!(err, PublishError::Locked { .. }));
    // The other version has its own lock.
    engine.publish("agency", "live", None).unwrap();

    release_tx.send(()).unwrap();
    let outcome: PublishOutcome = first.join().unwrap().unwrap();
    assert_eq!(outcome.build_status, BuildStatus::Running);

    // Lock released on completion.
    engine.publish("agency", "draft", None).unwrap();
}

#[test]
fn site_sync_is_single_flight_across_tasks() {
    let h = harness();
    add_site(&h, "agency");
    let held = h
        .locks
        .try_acquire(&sync_lock_key(&SiteName::from("agency")), Duration::from_secs(60))
        .unwrap()
        .expect("sync lock");

    let err = h.engine.sync_site("agency").unwrap_err();
    assert!(matches!(err, PublishError::Locked { key } if key == "agency-sync"));
    assert!(matches!(
        h.engine.sync_content_item("agency", "home").unwrap_err(),
        PublishError::Locked { .. }
    ));
    assert!(matches!(
        h.engine.publish("agency", "live", None).unwrap_err(),
        PublishError::Locked { .. }
    ));
    let live = version_state(&h, "agency", Version::Live);
    assert_eq!(live.status, BuildStatus::Errored);
    assert!(live.has_unpublished_changes);
    assert!(h.pipelines.builds().is_empty());

    drop(held);
    h.engine.sync_site("agency").unwrap();
    h.engine.publish("agency", "live", None).unwrap();
}

/// Fails the pre-publish step for one site.
struct FailFor(&'static str);

impl PublishHooks for FailFor {
    fn pre_publish(&self, site: &Site, _version: Version) -> Result<(), PublishError> {
        if site.name.0 == self.0 {
            return Err(PublishError::Hook(format!("{} is frozen", self.0)));
        }
        Ok(())
    }
}

#[tokio::test]
async fn batch_reports_partial_failure_and_continues() {
    let h = harness();
    for name in ["alpha", "beta", "gamma"] {
        add_site(&h, name);
    }
    let engine = h.engine.clone().with_hooks(Arc::new(FailFor("beta")));

    let sites = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
    let report = engine.publish_batch(&sites, "draft", false, None).await.unwrap();

    assert_eq!(report.chunks, 2);
    assert_eq!(report.outcome(), BatchOutcome::PartialFailure);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].site, SiteName::from("beta"));
    assert!(report.failed[0].error.contains("frozen"));
    assert_eq!(
        report.succeeded,
        vec![SiteName::from("alpha"), SiteName::from("gamma")]
    );
    let beta = version_state(&h, "beta", Version::Draft);
    assert_eq!(beta.status, BuildStatus::Errored);
    assert!(beta.has_unpublished_changes);
    assert_eq!(version_state(&h, "gamma", Version::Draft).status, BuildStatus::Running);
    assert!(report.mass_build.is_none());
}

#[tokio::test]
async fn mass_build_replaces_per_site_triggers() {
    let h = harness();
    add_site(&h, "alpha");
    add_site(&h, "gamma");

    let sites = vec!["alpha".to_string(), "gamma".to_string()];
    let report = h.engine.publish_batch(&sites, "live", true, None).await.unwrap();

    assert!(report.is_success());
    let builds = h.pipelines.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].1.pipeline, "all-sites-live");
    assert_eq!(Some(builds[0].0.clone()), report.mass_build);
    assert_eq!(version_state(&h, "alpha", Version::Live).status, BuildStatus::Succeeded);
}

#[tokio::test]
async fn batch_pipeline_upsert_covers_every_site() {
    let h = harness();
    add_site(&h, "alpha");
    add_site(&h, "gamma");

    let sites = h.engine.site_names().unwrap();
    let report = h.engine.upsert_pipelines(&sites).await.unwrap().unwrap();
    assert!(report.is_success());
    for name in ["alpha-draft", "alpha-live", "gamma-draft", "gamma-live"] {
        assert!(h.pipelines.pipeline(name).is_some(), "{name} missing");
    }
}

#[test]
fn reconcile_leaves_fresh_builds_alone() {
    let h = harness();
    add_site(&h, "agency");
    let outcome = h.engine.publish("agency", "draft", None).unwrap();
    let build_id = outcome.build_id.unwrap();
    h.pipelines.set_build_status(&build_id, BuildStatus::Succeeded);

    // Younger than the wait threshold: untouched.
    let report = h.engine.reconcile().unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(version_state(&h, "agency", Version::Draft).status, BuildStatus::Running);
}
