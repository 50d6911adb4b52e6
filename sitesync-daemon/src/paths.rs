use std::path::{Path, PathBuf};
use std::time::Duration;

use sitesync_core::file_store::root_at;

pub const DAEMON_LABEL: &str = "dev.sitesync.daemon";
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
pub const WORKER_COUNT: usize = 4;
pub const QUEUE_DEPTH: usize = 256;

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn run_dir(home: &Path) -> PathBuf {
    root_at(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}
