pub mod backend;
pub mod daemon;
pub mod diff;
pub mod publish;
pub mod site;
pub mod status;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use sitesync_core::config;
use sitesync_publish::Engine;

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Engine wired from `<home>/.sitesync/config.yaml`.
pub fn engine() -> Result<Engine> {
    let home = home()?;
    let config = config::load_at(&home).with_context(|| {
        format!("failed to load {}", config::config_path_at(&home).display())
    })?;
    Engine::from_config(&home, config).context("failed to initialize engine")
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON")?
    );
    Ok(())
}
