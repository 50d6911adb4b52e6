//! Engine configuration, read from `<home>/.sitesync/config.yaml`.
//!
//! Every section is optional; missing keys fall back to defaults. Tokens may
//! be supplied through `SITESYNC_GITHUB_TOKEN` / `SITESYNC_PIPELINE_TOKEN`
//! instead of the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::file_store::root_at;

pub const GITHUB_TOKEN_ENV: &str = "SITESYNC_GITHUB_TOKEN";
pub const PIPELINE_TOKEN_ENV: &str = "SITESYNC_PIPELINE_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub github: GitHubConfig,
    pub pipelines: PipelineConfig,
    pub sync: SyncConfig,
    pub publish: PublishConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_url: String,
    pub organization: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            organization: String::new(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub api_url: String,
    pub team: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Directory of `.tera` files overriding the built-in pipeline templates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            team: "main".to_string(),
            token: None,
            template_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Below this many remaining API calls the governor sleeps until reset.
    pub rate_limit_cutoff: u32,
    /// Fixed pause between bulk API calls.
    pub call_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 2_000,
            rate_limit_cutoff: 100,
            call_delay_ms: 50,
        }
    }
}

impl SyncConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub lock_lease_secs: u64,
    pub batch_chunk_size: usize,
    pub max_parallel_chunks: usize,
    /// Builds younger than this are not polled.
    pub status_wait_secs: u64,
    /// Builds still running after this are aborted.
    pub status_cutoff_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            lock_lease_secs: 15 * 60,
            batch_chunk_size: 500,
            max_parallel_chunks: 4,
            status_wait_secs: 5 * 60,
            status_cutoff_secs: 60 * 60,
            reconcile_interval_secs: 2 * 60,
        }
    }
}

impl PublishConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn status_wait(&self) -> Duration {
        Duration::from_secs(self.status_wait_secs)
    }

    pub fn status_cutoff(&self) -> Duration {
        Duration::from_secs(self.status_cutoff_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Switches that skip whole classes of external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub backend_sync: bool,
    pub pipelines: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            backend_sync: true,
            pipelines: true,
        }
    }
}

/// Run `call` only when `enabled`; `None` means the call was skipped.
pub fn when_enabled<T>(enabled: bool, call: impl FnOnce() -> T) -> Option<T> {
    if enabled {
        Some(call())
    } else {
        None
    }
}

/// `<home>/.sitesync/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    root_at(home).join("config.yaml")
}

/// Load the config file (defaults when absent), then apply env overrides.
pub fn load_at(home: &Path) -> Result<EngineConfig, StoreError> {
    let path = config_path_at(home);
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse { path, source: e })?
    } else {
        EngineConfig::default()
    };
    apply_env(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<EngineConfig, StoreError> {
    load_at(&dirs::home_dir().ok_or(StoreError::HomeNotFound)?)
}

fn apply_env(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(token) = lookup(GITHUB_TOKEN_ENV).filter(|t| !t.is_empty()) {
        config.github.token = Some(token);
    }
    if let Some(token) = lookup(PIPELINE_TOKEN_ENV).filter(|t| !t.is_empty()) {
        config.pipelines.token = Some(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_file_missing() {
        let home = TempDir::new().unwrap();
        let config = load_at(home.path()).unwrap();
        assert_eq!(config.publish.batch_chunk_size, 500);
        assert!(config.features.pipelines);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().unwrap();
        let path = config_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "github:\n  organization: agency-sites\nfeatures:\n  pipelines: false\n",
        )
        .unwrap();

        let config = load_at(home.path()).unwrap();
        assert_eq!(config.github.organization, "agency-sites");
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert!(!config.features.pipelines);
        assert!(config.features.backend_sync);
        assert_eq!(config.sync.retry_attempts, 3);
    }

    #[test]
    fn env_overrides_tokens() {
        let mut config = EngineConfig::default();
        apply_env(&mut config, |key| match key {
            GITHUB_TOKEN_ENV => Some("gh-token".to_string()),
            _ => Some(String::new()),
        });
        assert_eq!(config.github.token.as_deref(), Some("gh-token"));
        assert_eq!(config.pipelines.token, None);
    }

    #[test]
    fn when_enabled_skips_disabled_calls() {
        let mut called = false;
        assert_eq!(when_enabled(false, || called = true), None);
        assert!(!called);
        assert_eq!(when_enabled(true, || 7), Some(7));
    }
}
