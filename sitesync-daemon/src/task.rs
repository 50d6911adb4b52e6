//! Jobs the worker pool runs, one per engine entry point.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sitesync_publish::{Engine, PublishError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    SyncContentItem {
        site: String,
        content_id: String,
    },
    CreateBackend {
        site: String,
    },
    SyncSite {
        site: String,
    },
    ImportSite {
        site: String,
        #[serde(default)]
        git_ref: Option<String>,
        #[serde(default)]
        path: Option<String>,
    },
    CleanupSite {
        site: String,
    },
    Publish {
        site: String,
        version: String,
        #[serde(default)]
        triggered_by: Option<String>,
    },
    /// An empty `sites` list means every registered site.
    PublishBatch {
        #[serde(default)]
        sites: Vec<String>,
        version: String,
        #[serde(default)]
        mass_build: bool,
        #[serde(default)]
        triggered_by: Option<String>,
    },
    UpsertPipelines {
        #[serde(default)]
        sites: Vec<String>,
    },
    Reconcile,
}

impl Task {
    pub fn label(&self) -> String {
        match self {
            Task::SyncContentItem { site, content_id } => format!("sync_content_item {site}/{content_id}"),
            Task::CreateBackend { site } => format!("create_backend {site}"),
            Task::SyncSite { site } => format!("sync_site {site}"),
            Task::ImportSite { site, .. } => format!("import_site {site}"),
            Task::CleanupSite { site } => format!("cleanup_site {site}"),
            Task::Publish { site, version, .. } => format!("publish {site} {version}"),
            Task::PublishBatch { sites, version, .. } => {
                format!("publish_batch {version} ({} sites)", sites.len())
            }
            Task::UpsertPipelines { sites } => format!("upsert_pipelines ({} sites)", sites.len()),
            Task::Reconcile => "reconcile".to_string(),
        }
    }

    /// Run against `engine`. Blocking entry points go to the blocking pool.
    pub async fn run(self, engine: Engine) -> Result<Value, PublishError> {
        match self {
            Task::PublishBatch { sites, version, mass_build, triggered_by } => {
                let sites = resolve_sites(&engine, sites).await?;
                let report = engine
                    .publish_batch(&sites, &version, mass_build, triggered_by.as_deref())
                    .await?;
                Ok(json!(report))
            }
            Task::UpsertPipelines { sites } => {
                let sites = resolve_sites(&engine, sites).await?;
                Ok(json!(engine.upsert_pipelines(&sites).await?))
            }
            blocking => tokio::task::spawn_blocking(move || blocking.run_blocking(&engine))
                .await
                .map_err(|e| PublishError::Join(e.to_string()))?,
        }
    }

    fn run_blocking(self, engine: &Engine) -> Result<Value, PublishError> {
        let value = match self {
            Task::SyncContentItem { site, content_id } => {
                json!(engine.sync_content_item(&site, &content_id)?)
            }
            Task::CreateBackend { site } => json!({ "created": engine.create_backend(&site)?.is_some() }),
            Task::SyncSite { site } => json!(engine.sync_site(&site)?),
            Task::ImportSite { site, git_ref, path } => {
                json!(engine.import_site(&site, git_ref.as_deref(), path.as_deref())?)
            }
            Task::CleanupSite { site } => json!(engine.cleanup_site(&site)?),
            Task::Publish { site, version, triggered_by } => {
                json!(engine.publish(&site, &version, triggered_by.as_deref())?)
            }
            Task::Reconcile => json!(engine.reconcile()?),
            Task::PublishBatch { .. } | Task::UpsertPipelines { .. } => {
                return Err(PublishError::Join("batch task on the blocking path".to_string()))
            }
        };
        Ok(value)
    }
}

async fn resolve_sites(engine: &Engine, sites: Vec<String>) -> Result<Vec<String>, PublishError> {
    if !sites.is_empty() {
        return Ok(sites);
    }
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || engine.site_names())
        .await
        .map_err(|e| PublishError::Join(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_decode_from_tagged_json() {
        let task: Task =
            serde_json::from_str(r#"{"kind":"publish","site":"agency","version":"live"}"#).unwrap();
        assert_eq!(
            task,
            Task::Publish {
                site: "agency".into(),
                version: "live".into(),
                triggered_by: None,
            }
        );

        let task: Task = serde_json::from_str(r#"{"kind":"reconcile"}"#).unwrap();
        assert_eq!(task, Task::Reconcile);

        let task: Task =
            serde_json::from_str(r#"{"kind":"publish_batch","version":"draft","mass_build":true}"#)
                .unwrap();
        assert_eq!(task.label(), "publish_batch draft (0 sites)");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(serde_json::from_str::<Task>(r#"{"kind":"rebuild_world"}"#).is_err());
    }
}
