//! # sitesync-publish
//!
//! Publishing on top of the sync layer: the per-(site, version)
//! [`PublishOrchestrator`], chunked many-site runs through the
//! [`BatchScheduler`], and the [`BuildStatusReconciler`] that finalizes
//! triggered builds. [`Engine`] wires it all from configuration and exposes
//! the task entry points used by the daemon and the CLI.

pub mod batch;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod tasks;

pub use batch::{BatchOutcome, BatchReport, BatchScheduler, SiteFailure};
pub use error::{PipelineError, PublishError};
pub use lock::{sync_lock_key, FileLocks, LockGuard, MemoryLocks, PublishLocks};
pub use orchestrator::{NoHooks, PublishHooks, PublishOrchestrator, PublishOutcome, PublishRequest};
pub use pipeline::{HttpPipelineService, MemoryPipelines, PipelineService};
pub use reconcile::{BuildStatusReconciler, ReconcileReport};
pub use tasks::{Engine, EngineParts};
