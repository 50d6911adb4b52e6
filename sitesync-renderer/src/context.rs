//! Rendering payload for one (site, version) pipeline definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sitesync_core::types::slugify;
use sitesync_core::{Site, Version};

use crate::error::RenderError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Pipeline name as registered with the pipeline service.
    pub pipeline_name: String,
    pub site: SiteCtx,
    pub repo: RepoCtx,
    pub version: String,
    /// Branch the pipeline watches for this version.
    pub branch: String,
    pub meta: MetaCtx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteCtx {
    pub name: String,
    pub uid: String,
    pub content_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCtx {
    pub organization: String,
    pub name: String,
    /// `organization/name`
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaCtx {
    pub sitesync_version: String,
    pub rendered_at: DateTime<Utc>,
}

/// `{slug(site)}-{version}`, the name both the upsert and the trigger refer to.
pub fn pipeline_name(site: &Site, version: Version) -> String {
    format!("{}-{}", slugify(&site.name.0), version)
}

impl PipelineContext {
    pub fn new(site: &Site, version: Version, organization: &str) -> Self {
        let repo_name = site.repo_name();
        PipelineContext {
            pipeline_name: pipeline_name(site, version),
            site: SiteCtx {
                name: site.name.0.clone(),
                uid: site.uid.simple().to_string(),
                content_root: site.config.root().to_string(),
            },
            repo: RepoCtx {
                organization: organization.to_string(),
                full_name: format!("{organization}/{repo_name}"),
                name: repo_name,
            },
            version: version.to_string(),
            branch: site.branches.for_version(version).to_string(),
            meta: MetaCtx {
                sitesync_version: env!("CARGO_PKG_VERSION").to_string(),
                rendered_at: Utc::now(),
            },
        }
    }

    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        Ok(tera::Context::from_serialize(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_core::SiteConfig;

    #[test]
    fn context_tracks_version_branch() {
        let site = Site::new("Agency Site", SiteConfig::default());
        let draft = PipelineContext::new(&site, Version::Draft, "org");
        let live = PipelineContext::new(&site, Version::Live, "org");
        assert_eq!(draft.branch, "preview");
        assert_eq!(live.branch, "release");
        assert_eq!(draft.pipeline_name, "agency-site-draft");
        assert_eq!(draft.repo.full_name, format!("org/{}", site.repo_name()));
    }

    #[test]
    fn tera_context_builds() {
        let site = Site::new("agency", SiteConfig::default());
        let ctx = PipelineContext::new(&site, Version::Live, "org");
        assert!(ctx.to_tera_context().is_ok());
    }
}
