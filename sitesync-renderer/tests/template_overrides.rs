use sitesync_core::{Site, SiteConfig, Version};
use sitesync_renderer::{PipelineContext, PipelineRenderer};
use tempfile::TempDir;

fn site() -> Site {
    Site::new("county-news", SiteConfig::default())
}

#[test]
fn user_partial_overrides_embedded_resources() {
    let dir = TempDir::new().expect("templates");
    let shared = dir.path().join("shared");
    std::fs::create_dir_all(&shared).unwrap();
    std::fs::write(
        shared.join("_resources.tera"),
        "resources:\n  - name: mirror-{{ branch }}\n    type: git\n",
    )
    .unwrap();

    let renderer = PipelineRenderer::new(Some(dir.path())).unwrap();
    let out = renderer
        .render(&PipelineContext::new(&site(), Version::Draft, "org"))
        .unwrap();
    assert!(out.contains("mirror-preview"));
    assert!(!out.contains("site-bucket\n    type: s3"));
    // the rest of the embedded definition is untouched
    assert!(out.contains("name: build-draft"));
}

#[test]
fn user_pipeline_replaces_definition() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("Pipeline.yml.tera"),
        "custom: {{ pipeline_name }}\n",
    )
    .unwrap();

    let renderer = PipelineRenderer::new(Some(dir.path())).unwrap();
    let out = renderer
        .render(&PipelineContext::new(&site(), Version::Live, "org"))
        .unwrap();
    assert_eq!(out.trim(), "custom: county-news-live");
}

#[test]
fn non_tera_files_are_ignored() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("pipeline.yml"), "{{ broken").unwrap();
    assert!(PipelineRenderer::new(Some(dir.path())).is_ok());
}

#[test]
fn missing_override_dir_falls_back_to_embedded() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope");
    let renderer = PipelineRenderer::new(Some(&missing)).unwrap();
    let out = renderer
        .render(&PipelineContext::new(&site(), Version::Draft, "org"))
        .unwrap();
    assert!(out.contains("county-news"));
}
