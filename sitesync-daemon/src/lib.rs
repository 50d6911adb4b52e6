//! Long-running worker: a job queue drained by a small worker pool, fed by a
//! content-file watcher, a periodic reconcile timer and a unix-socket
//! protocol.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod task;

pub use error::DaemonError;
pub use protocol::{request_run, request_status, request_stop, send_request, DaemonRequest, DaemonResponse};
pub use runtime::{init_tracing, run, serve, start_blocking, JobStats};
pub use task::Task;
