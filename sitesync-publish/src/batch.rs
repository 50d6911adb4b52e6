//! Chunked fan-out over many sites.
//!
//! Sites are split into fixed-size chunks; chunks run concurrently (bounded
//! by a semaphore) on the blocking pool, sites within a chunk run in order.
//! A site's failure, including a panic, is logged and recorded, never
//! propagated.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use sitesync_core::config::PublishConfig;
use sitesync_core::{ContentStore, SiteName, Version};
use sitesync_renderer::PipelineRenderer;
use sitesync_sync::RetryPolicy;

use crate::error::PublishError;
use crate::orchestrator::{PublishOrchestrator, PublishRequest};
use crate::pipeline::{upsert_site_pipelines, PipelineService};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteFailure {
    pub site: SiteName,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Success,
    PartialFailure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub chunks: usize,
    pub succeeded: Vec<SiteName>,
    pub failed: Vec<SiteFailure>,
    /// Build id of the consolidated build, when one ran.
    pub mass_build: Option<String>,
    pub mass_build_error: Option<String>,
}

impl BatchReport {
    pub fn outcome(&self) -> BatchOutcome {
        if self.failed.is_empty() && self.mass_build_error.is_none() {
            BatchOutcome::Success
        } else {
            BatchOutcome::PartialFailure
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == BatchOutcome::Success
    }
}

#[derive(Debug, Default)]
struct ChunkReport {
    succeeded: Vec<SiteName>,
    failed: Vec<SiteFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    chunk_size: usize,
    max_parallel: usize,
}

impl BatchScheduler {
    pub fn new(chunk_size: usize, max_parallel: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn from_config(config: &PublishConfig) -> Self {
        Self::new(config.batch_chunk_size, config.max_parallel_chunks)
    }

    /// Order-preserving split into chunks of at most `chunk_size`.
    pub fn chunks(&self, sites: &[SiteName]) -> Vec<Vec<SiteName>> {
        sites.chunks(self.chunk_size).map(<[SiteName]>::to_vec).collect()
    }

    /// Run `unit` for every site. Completes only after every chunk has.
    pub async fn run<F>(&self, sites: Vec<SiteName>, unit: F) -> Result<BatchReport, PublishError>
    where
        F: Fn(&SiteName) -> Result<(), PublishError> + Send + Sync + 'static,
    {
        let unit = Arc::new(unit);
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let chunks = self.chunks(&sites);

        let mut handles = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            let unit = unit.clone();
            let semaphore = semaphore.clone();
            let sites = chunk.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PublishError::Join(e.to_string()))?;
                tokio::task::spawn_blocking(move || run_chunk(index, &chunk, unit.as_ref()))
                    .await
                    .map_err(|e| PublishError::Join(e.to_string()))
            });
            handles.push((index, sites, handle));
        }

        let mut report = BatchReport {
            chunks: handles.len(),
            ..BatchReport::default()
        };
        for (index, sites, handle) in handles {
            let joined = handle
                .await
                .map_err(|e| PublishError::Join(e.to_string()))
                .and_then(|chunk| chunk);
            match joined {
                Ok(chunk) => {
                    report.succeeded.extend(chunk.succeeded);
                    report.failed.extend(chunk.failed);
                }
                // outcomes inside the chunk are unknown
                Err(err) => {
                    tracing::error!(chunk = index, error = %err, "batch chunk aborted");
                    report.failed.extend(sites.into_iter().map(|site| SiteFailure {
                        site,
                        error: format!("chunk {index} aborted: {err}"),
                    }));
                }
            }
        }
        tracing::info!(
            chunks = report.chunks,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch finished"
        );
        Ok(report)
    }
}

fn run_chunk<F>(index: usize, sites: &[SiteName], unit: &F) -> ChunkReport
where
    F: Fn(&SiteName) -> Result<(), PublishError>,
{
    let mut report = ChunkReport::default();
    for site in sites {
        let outcome = catch_unwind(AssertUnwindSafe(|| unit(site)))
            .unwrap_or_else(|panic| Err(PublishError::Join(panic_message(panic.as_ref()))));
        match outcome {
            Ok(()) => report.succeeded.push(site.clone()),
            Err(err) => {
                tracing::error!(chunk = index, site = %site, error = %err, "site failed in batch");
                report.failed.push(SiteFailure {
                    site: site.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("panicked: {message}")
}

/// Publish every site at `version`. With `mass_build`, per-site triggers are
/// suppressed and one consolidated build runs after all chunks complete.
pub async fn publish_batch(
    orchestrator: Arc<PublishOrchestrator>,
    scheduler: &BatchScheduler,
    sites: Vec<SiteName>,
    version: Version,
    mass_build: bool,
    triggered_by: Option<String>,
) -> Result<BatchReport, PublishError> {
    let request = PublishRequest {
        triggered_by,
        trigger_build: !mass_build,
    };
    let unit_orchestrator = orchestrator.clone();
    let mut report = scheduler
        .run(sites, move |site| {
            unit_orchestrator.publish(site, version, &request).map(|_| ())
        })
        .await?;

    if mass_build && orchestrator.features().pipelines {
        let pipelines = orchestrator.pipelines().clone();
        let triggered = tokio::task::spawn_blocking(move || pipelines.trigger_mass_build(version))
            .await
            .map_err(|e| PublishError::Join(e.to_string()))?;
        match triggered {
            Ok(id) => {
                tracing::info!(%version, build_id = %id, "mass build triggered");
                report.mass_build = Some(id);
            }
            Err(err) => {
                tracing::error!(%version, error = %err, "mass build failed");
                report.mass_build_error = Some(err.to_string());
            }
        }
    }
    Ok(report)
}

/// Render and upsert both version pipelines for every site.
pub async fn upsert_pipelines_batch(
    store: Arc<dyn ContentStore>,
    pipelines: Arc<dyn PipelineService>,
    renderer: Arc<PipelineRenderer>,
    retry: RetryPolicy,
    organization: String,
    scheduler: &BatchScheduler,
    sites: Vec<SiteName>,
) -> Result<BatchReport, PublishError> {
    scheduler
        .run(sites, move |name| {
            let site = store.get_site(name)?;
            upsert_site_pipelines(pipelines.as_ref(), &renderer, &retry, &site, &organization)?;
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<SiteName> {
        list.iter().map(|s| SiteName::from(*s)).collect()
    }

    #[test]
    fn chunks_preserve_order() {
        let scheduler = BatchScheduler::new(2, 4);
        let chunks = scheduler.chunks(&names(&["a", "b", "c", "d", "e"]));
        assert_eq!(chunks, vec![names(&["a", "b"]), names(&["c", "d"]), names(&["e"])]);
    }

    #[test]
    fn zero_chunk_size_is_clamped() {
        let scheduler = BatchScheduler::new(0, 0);
        assert_eq!(scheduler.chunks(&names(&["a", "b"])).len(), 2);
    }

    #[tokio::test]
    async fn failures_do_not_abort_siblings() {
        let scheduler = BatchScheduler::new(2, 2);
        let report = scheduler
            .run(names(&["a", "b", "c", "d"]), |site| {
                if site.0 == "b" {
                    Err(PublishError::Hook("boom".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(report.chunks, 2);
        assert_eq!(report.succeeded, names(&["a", "c", "d"]));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].site, SiteName::from("b"));
        assert_eq!(report.outcome(), BatchOutcome::PartialFailure);
    }

    #[tokio::test]
    async fn panicking_unit_fails_only_its_site() {
        let scheduler = BatchScheduler::new(2, 2);
        let report = scheduler
            .run(names(&["a", "b", "c", "d"]), |site| {
                if site.0 == "a" {
                    panic!("lost connection");
                }
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(report.succeeded, names(&["b", "c", "d"]));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].site, SiteName::from("a"));
        assert!(report.failed[0].error.contains("lost connection"));
        assert_eq!(report.outcome(), BatchOutcome::PartialFailure);
    }

    #[tokio::test]
    async fn empty_batch_is_success() {
        let report = BatchScheduler::new(500, 4).run(Vec::new(), |_| Ok(())).await.unwrap();
        assert_eq!(report.chunks, 0);
        assert!(report.is_success());
    }
}
