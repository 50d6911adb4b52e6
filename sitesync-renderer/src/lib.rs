//! # sitesync-renderer
//!
//! Tera engine that renders the build-pipeline definition for one site at
//! one version. Built-in templates are embedded; a user directory of
//! `.tera` files may override any of them by name.
//!
//! ```rust,no_run
//! use sitesync_core::{Site, SiteConfig, Version};
//! use sitesync_renderer::{PipelineContext, PipelineRenderer};
//!
//! fn render(site: &Site) {
//!     if let Ok(renderer) = PipelineRenderer::new(None) {
//!         let ctx = PipelineContext::new(site, Version::Draft, "agency-sites");
//!         if let Ok(yaml) = renderer.render(&ctx) {
//!             println!("{yaml}");
//!         }
//!     }
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;

pub use context::PipelineContext;
pub use engine::PipelineRenderer;
pub use error::RenderError;
