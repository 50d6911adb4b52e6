//! Build-pipeline service boundary.
//!
//! One pipeline per (site, version), named by
//! [`pipeline_name`](sitesync_renderer::context::pipeline_name), each with a
//! single `build-{version}` job. A mass build covers every site of a version
//! through one consolidated pipeline.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;

use sitesync_core::config::PipelineConfig;
use sitesync_core::{BuildStatus, Site, Version};
use sitesync_renderer::context::pipeline_name;
use sitesync_renderer::{PipelineContext, PipelineRenderer};
use sitesync_sync::{ErrorClass, RetryPolicy};

use crate::error::PipelineError;

const USER_AGENT: &str = concat!("sitesync/", env!("CARGO_PKG_VERSION"));

/// Job triggered inside a site pipeline.
pub fn job_name(version: Version) -> String {
    format!("build-{version}")
}

/// Pipeline holding the consolidated build of every site at `version`.
pub fn mass_pipeline_name(version: Version) -> String {
    format!("all-sites-{version}")
}

pub trait PipelineService: Send + Sync {
    /// Create or replace a pipeline definition.
    fn upsert_pipeline(&self, name: &str, definition: &str) -> Result<(), PipelineError>;

    /// Start a build of `job`; returns the build id.
    fn trigger_build(&self, pipeline: &str, job: &str) -> Result<String, PipelineError>;

    fn build_status(&self, build_id: &str) -> Result<BuildStatus, PipelineError>;

    fn abort_build(&self, build_id: &str) -> Result<(), PipelineError>;

    fn pause(&self, pipeline: &str) -> Result<(), PipelineError>;

    fn unpause(&self, pipeline: &str) -> Result<(), PipelineError>;

    /// Missing pipelines are skipped. Returns how many were deleted.
    fn delete_pipelines(&self, names: &[String]) -> Result<usize, PipelineError>;

    /// One build covering every site of `version`.
    fn trigger_mass_build(&self, version: Version) -> Result<String, PipelineError> {
        self.trigger_build(&mass_pipeline_name(version), "build-all")
    }
}

/// Render and upsert both version pipelines of a site, then unpause them.
/// Returns the pipeline names.
pub fn upsert_site_pipelines(
    service: &dyn PipelineService,
    renderer: &PipelineRenderer,
    retry: &RetryPolicy,
    site: &Site,
    organization: &str,
) -> Result<Vec<String>, PipelineError> {
    let mut names = Vec::new();
    for version in Version::all() {
        let ctx = PipelineContext::new(site, *version, organization);
        let definition = renderer.render(&ctx)?;
        let name = pipeline_name(site, *version);
        retry.run("upsert_pipeline", || service.upsert_pipeline(&name, &definition))?;
        retry.run("unpause", || service.unpause(&name))?;
        tracing::debug!(site = %site.name, pipeline = %name, "pipeline upserted");
        names.push(name);
    }
    Ok(names)
}

/// Concourse build status → publish status. Unknown values are `Errored`.
pub fn map_build_status(status: &str) -> BuildStatus {
    match status {
        "pending" | "started" => BuildStatus::Running,
        "succeeded" => BuildStatus::Succeeded,
        "failed" => BuildStatus::Failed,
        "aborted" => BuildStatus::Aborted,
        _ => BuildStatus::Errored,
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Concourse-style REST client scoped to one team.
pub struct HttpPipelineService {
    agent: ureq::Agent,
    api_url: String,
    team: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuildBody {
    id: serde_json::Value,
    #[serde(default)]
    status: String,
}

fn classify_status(code: u16, body: &str, what: &str) -> PipelineError {
    let what = format!("{what} ({code}): {}", body.trim());
    match code {
        404 => PipelineError::NotFound { what },
        409 => PipelineError::Conflict { what },
        429 | 500..=599 => PipelineError::Transient(what),
        _ => PipelineError::Fatal(what),
    }
}

impl HttpPipelineService {
    pub fn new(config: &PipelineConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build();
        Self {
            agent,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            team: config.team.clone(),
            token: config.token.clone(),
        }
    }

    fn pipeline_url(&self, pipeline: &str, rest: &str) -> String {
        format!(
            "{}/api/v1/teams/{}/pipelines/{}{}",
            self.api_url, self.team, pipeline, rest
        )
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let req = self.agent.request(method, url);
        match &self.token {
            Some(token) => req.set("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }

    fn send(
        &self,
        req: ureq::Request,
        body: Option<(&str, &str)>,
        what: &str,
    ) -> Result<ureq::Response, PipelineError> {
        let result = match body {
            Some((content_type, body)) => req.set("Content-Type", content_type).send_string(body),
            None => req.call(),
        };
        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(classify_status(code, &body, what))
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(PipelineError::Transient(format!("{what}: {transport}")))
            }
        }
    }

    fn build_body(response: ureq::Response, what: &str) -> Result<BuildBody, PipelineError> {
        response
            .into_json::<BuildBody>()
            .map_err(|e| PipelineError::Transient(format!("{what}: unreadable response: {e}")))
    }
}

impl PipelineService for HttpPipelineService {
    fn upsert_pipeline(&self, name: &str, definition: &str) -> Result<(), PipelineError> {
        let url = self.pipeline_url(name, "/config");
        self.send(
            self.request("PUT", &url),
            Some(("application/x-yaml", definition)),
            "upsert pipeline",
        )?;
        Ok(())
    }

    fn trigger_build(&self, pipeline: &str, job: &str) -> Result<String, PipelineError> {
        let url = self.pipeline_url(pipeline, &format!("/jobs/{job}/builds"));
        let response = self.send(self.request("POST", &url), None, "trigger build")?;
        let body = Self::build_body(response, "trigger build")?;
        Ok(match body.id {
            serde_json::Value::String(id) => id,
            other => other.to_string(),
        })
    }

    fn build_status(&self, build_id: &str) -> Result<BuildStatus, PipelineError> {
        let url = format!("{}/api/v1/builds/{build_id}", self.api_url);
        let response = self.send(self.request("GET", &url), None, "build status")?;
        let body = Self::build_body(response, "build status")?;
        Ok(map_build_status(&body.status))
    }

    fn abort_build(&self, build_id: &str) -> Result<(), PipelineError> {
        let url = format!("{}/api/v1/builds/{build_id}/abort", self.api_url);
        self.send(self.request("PUT", &url), None, "abort build")?;
        Ok(())
    }

    fn pause(&self, pipeline: &str) -> Result<(), PipelineError> {
        let url = self.pipeline_url(pipeline, "/pause");
        self.send(self.request("PUT", &url), None, "pause pipeline")?;
        Ok(())
    }

    fn unpause(&self, pipeline: &str) -> Result<(), PipelineError> {
        let url = self.pipeline_url(pipeline, "/unpause");
        self.send(self.request("PUT", &url), None, "unpause pipeline")?;
        Ok(())
    }

    fn delete_pipelines(&self, names: &[String]) -> Result<usize, PipelineError> {
        let mut deleted = 0;
        for name in names {
            let url = self.pipeline_url(name, "");
            match self.send(self.request("DELETE", &url), None, "delete pipeline") {
                Ok(_) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// In-memory double
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRecord {
    pub definition: String,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub pipeline: String,
    pub job: String,
    pub status: BuildStatus,
}

#[derive(Debug, Default)]
struct MemoryInner {
    pipelines: BTreeMap<String, PipelineRecord>,
    builds: BTreeMap<String, BuildRecord>,
    calls: Vec<String>,
    faults: Vec<(String, ErrorClass)>,
    counter: u64,
}

/// In-process [`PipelineService`]. Triggered builds start `Running`; missing
/// pipelines are created on trigger so tests need not upsert first.
#[derive(Debug, Default)]
pub struct MemoryPipelines {
    inner: Mutex<MemoryInner>,
}

impl MemoryPipelines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call to `op` with an error of `class`.
    pub fn fail_next(&self, op: &str, class: ErrorClass) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.push((op.to_string(), class));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().map(|i| i.calls.clone()).unwrap_or_default()
    }

    pub fn pipeline(&self, name: &str) -> Option<PipelineRecord> {
        self.inner.lock().ok()?.pipelines.get(name).cloned()
    }

    pub fn build(&self, id: &str) -> Option<BuildRecord> {
        self.inner.lock().ok()?.builds.get(id).cloned()
    }

    pub fn builds(&self) -> Vec<(String, BuildRecord)> {
        self.inner
            .lock()
            .map(|i| i.builds.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn set_build_status(&self, id: &str, status: BuildStatus) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(build) = inner.builds.get_mut(id) {
                build.status = status;
            }
        }
    }

    /// Forget a build, as if the service had purged it.
    pub fn forget_build(&self, id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.builds.remove(id);
        }
    }

    fn enter(&self, op: &str) -> Result<std::sync::MutexGuard<'_, MemoryInner>, PipelineError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PipelineError::Fatal("memory pipelines poisoned".to_string()))?;
        inner.calls.push(op.to_string());
        if let Some(pos) = inner.faults.iter().position(|(o, _)| o == op) {
            let (_, class) = inner.faults.remove(pos);
            return Err(PipelineError::of_class(class, format!("injected {op} failure")));
        }
        Ok(inner)
    }

    fn set_paused(&self, op: &str, pipeline: &str, paused: bool) -> Result<(), PipelineError> {
        let mut inner = self.enter(op)?;
        let record = inner
            .pipelines
            .get_mut(pipeline)
            .ok_or_else(|| PipelineError::not_found(format!("pipeline {pipeline}")))?;
        record.paused = paused;
        Ok(())
    }
}

impl PipelineService for MemoryPipelines {
    fn upsert_pipeline(&self, name: &str, definition: &str) -> Result<(), PipelineError> {
        let mut inner = self.enter("upsert_pipeline")?;
        let paused = inner.pipelines.get(name).map_or(true, |p| p.paused);
        inner.pipelines.insert(
            name.to_string(),
            PipelineRecord { definition: definition.to_string(), paused },
        );
        Ok(())
    }

    fn trigger_build(&self, pipeline: &str, job: &str) -> Result<String, PipelineError> {
        let mut inner = self.enter("trigger_build")?;
        inner.counter += 1;
        let id = inner.counter.to_string();
        inner.builds.insert(
            id.clone(),
            BuildRecord {
                pipeline: pipeline.to_string(),
                job: job.to_string(),
                status: BuildStatus::Running,
            },
        );
        Ok(id)
    }

    fn build_status(&self, build_id: &str) -> Result<BuildStatus, PipelineError> {
        let inner = self.enter("build_status")?;
        inner
            .builds
            .get(build_id)
            .map(|b| b.status)
            .ok_or_else(|| PipelineError::not_found(format!("build {build_id}")))
    }

    fn abort_build(&self, build_id: &str) -> Result<(), PipelineError> {
        let mut inner = self.enter("abort_build")?;
        let build = inner
            .builds
            .get_mut(build_id)
            .ok_or_else(|| PipelineError::not_found(format!("build {build_id}")))?;
        build.status = BuildStatus::Aborted;
        Ok(())
    }

    fn pause(&self, pipeline: &str) -> Result<(), PipelineError> {
        self.set_paused("pause", pipeline, true)
    }

    fn unpause(&self, pipeline: &str) -> Result<(), PipelineError> {
        self.set_paused("unpause", pipeline, false)
    }

    fn delete_pipelines(&self, names: &[String]) -> Result<usize, PipelineError> {
        let mut inner = self.enter("delete_pipelines")?;
        Ok(names
            .iter()
            .filter(|name| inner.pipelines.remove(name.as_str()).is_some())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_core::SiteConfig;

    #[test]
    fn concourse_statuses_map_to_publish_statuses() {
        assert_eq!(map_build_status("started"), BuildStatus::Running);
        assert_eq!(map_build_status("pending"), BuildStatus::Running);
        assert_eq!(map_build_status("succeeded"), BuildStatus::Succeeded);
        assert_eq!(map_build_status("failed"), BuildStatus::Failed);
        assert_eq!(map_build_status("aborted"), BuildStatus::Aborted);
        assert_eq!(map_build_status("exploded"), BuildStatus::Errored);
    }

    #[test]
    fn http_status_classes() {
        assert!(classify_status(404, "", "x").is_not_found());
        assert!(matches!(classify_status(409, "", "x"), PipelineError::Conflict { .. }));
        assert!(matches!(classify_status(502, "", "x"), PipelineError::Transient(_)));
        assert!(matches!(classify_status(400, "bad", "x"), PipelineError::Fatal(_)));
    }

    #[test]
    fn site_pipelines_are_upserted_and_unpaused() {
        let service = MemoryPipelines::new();
        let renderer = PipelineRenderer::new(None).unwrap();
        let site = Site::new("Agency Site", SiteConfig::default());

        let names =
            upsert_site_pipelines(&service, &renderer, &RetryPolicy::none(), &site, "org").unwrap();
        assert_eq!(names, vec!["agency-site-draft", "agency-site-live"]);
        for name in &names {
            let record = service.pipeline(name).unwrap();
            assert!(!record.paused);
            assert!(record.definition.contains("jobs:"));
        }
    }

    #[test]
    fn transient_upsert_is_retried() {
        let service = MemoryPipelines::new();
        let renderer = PipelineRenderer::new(None).unwrap();
        let site = Site::new("agency", SiteConfig::default());
        service.fail_next("upsert_pipeline", ErrorClass::Transient);

        let retry = RetryPolicy::new(3, Duration::ZERO);
        upsert_site_pipelines(&service, &renderer, &retry, &site, "org").unwrap();
        let upserts = service.calls().iter().filter(|c| *c == "upsert_pipeline").count();
        assert_eq!(upserts, 3);
    }

    #[test]
    fn delete_skips_missing_pipelines() {
        let service = MemoryPipelines::new();
        service.upsert_pipeline("a", "jobs: []").unwrap();
        let deleted = service
            .delete_pipelines(&["a".to_string(), "ghost".to_string()])
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
