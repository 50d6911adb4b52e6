//! Tera rendering engine for pipeline definitions.
//!
//! | Template                   | Purpose                                   |
//! |----------------------------|-------------------------------------------|
//! | `pipeline.yml.tera`        | full definition for one (site, version)   |
//! | `shared/_header.tera`      | provenance comment block                  |
//! | `shared/_resources.tera`   | source repo + artifact bucket resources   |

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tera::Tera;

use crate::context::PipelineContext;
use crate::error::RenderError;

pub const PIPELINE_TEMPLATE: &str = "pipeline.yml.tera";

// ---------------------------------------------------------------------------
// Embedded templates
// ---------------------------------------------------------------------------

const TPLS: &[(&str, &str)] = &[
    ("shared/_header.tera", include_str!("templates/_partials/header.tera")),
    ("shared/_resources.tera", include_str!("templates/_partials/resources.tera")),
    (PIPELINE_TEMPLATE, include_str!("templates/pipeline.yml.tera")),
];

// ---------------------------------------------------------------------------
// Template loading helpers
// ---------------------------------------------------------------------------

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RenderError {
    RenderError::Io { path: path.into(), source }
}

fn normalize_template_name(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

fn collect_template_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RenderError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| io_err(&path, e))?;
        if meta.is_dir() {
            collect_template_files(&path, out)?;
        } else if meta.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn load_user_templates(dir: &Path) -> Result<Vec<(String, String)>, RenderError> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut files = Vec::new();
    collect_template_files(dir, &mut files)?;
    let mut templates = Vec::new();
    for path in files {
        if path.extension().and_then(|s| s.to_str()) != Some("tera") {
            continue;
        }
        let rel = path.strip_prefix(dir).unwrap_or(path.as_path());
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        templates.push((normalize_template_name(rel), contents));
    }
    Ok(templates)
}

fn build_tera(user_template_dir: Option<&Path>) -> Result<Tera, RenderError> {
    let mut templates: HashMap<String, String> = HashMap::new();
    for (name, content) in TPLS {
        templates.insert(normalize_template_name(Path::new(name)), (*content).to_string());
    }
    if let Some(dir) = user_template_dir {
        templates.extend(load_user_templates(dir)?);
    }

    let mut tera = Tera::default();
    tera.register_filter("slugify", slugify_filter);
    tera.add_raw_templates(templates.into_iter().collect::<Vec<_>>())?;
    Ok(tera)
}

fn slugify_filter(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let s = tera::try_get_value!("slugify", "value", String, value);
    Ok(tera::Value::String(sitesync_core::types::slugify(&s)))
}

// ---------------------------------------------------------------------------
// PipelineRenderer
// ---------------------------------------------------------------------------

/// Renders pipeline definitions. Create once and reuse.
///
/// `user_template_dir` may contain `.tera` files overriding the embedded
/// defaults; names are lowercase paths relative to that directory, so
/// `pipeline.yml.tera` replaces the whole definition and
/// `shared/_resources.tera` only the resources block.
pub struct PipelineRenderer {
    tera: Tera,
}

impl PipelineRenderer {
    pub fn new(user_template_dir: Option<&Path>) -> Result<Self, RenderError> {
        Ok(PipelineRenderer { tera: build_tera(user_template_dir)? })
    }

    /// Render the definition; line endings are normalised to `\n`.
    pub fn render(&self, ctx: &PipelineContext) -> Result<String, RenderError> {
        let rendered = self.tera.render(PIPELINE_TEMPLATE, &ctx.to_tera_context()?)?;
        Ok(rendered.replace("\r\n", "\n"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
