use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Runtime configuration.  Every field has a default, so the proxy runs
/// with no config file at all.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:4873`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds granted to in-flight strip tasks and the synchronizer to
    /// finish writes on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:4873".to_string()
}

fn default_shutdown_grace() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of the upstream registry.
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    /// URL of the upstream changes feed.
    #[serde(default = "default_changes_url")]
    pub changes_url: String,
    /// Per-request timeout for metadata fetches, in seconds.
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
    /// Per-request timeout for passthrough traffic (tarballs can be
    /// large), in seconds.
    #[serde(default = "default_passthrough_timeout")]
    pub passthrough_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            changes_url: default_changes_url(),
            metadata_timeout_secs: default_metadata_timeout(),
            passthrough_timeout_secs: default_passthrough_timeout(),
        }
    }
}

fn default_registry_url() -> String {
    "https://registry.npmjs.org".to_string()
}

fn default_changes_url() -> String {
    "https://replicate.npmjs.com/_changes".to_string()
}

fn default_metadata_timeout() -> u64 {
    30
}

fn default_passthrough_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Prefetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefetchConfig {
    /// Whether a metadata miss triggers a dependency-tree prefetch.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Maximum concurrent upstream fetches across all prefetch walks.
    #[serde(default = "default_prefetch_concurrent")]
    pub max_concurrent: usize,
    /// Maximum packages fetched per prefetch walk.
    #[serde(default = "default_prefetch_budget")]
    pub max_packages: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: bool_true(),
            max_concurrent: default_prefetch_concurrent(),
            max_packages: default_prefetch_budget(),
        }
    }
}

fn default_prefetch_concurrent() -> usize {
    5
}

fn default_prefetch_budget() -> usize {
    200
}

// ---------------------------------------------------------------------------
// Change synchronizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Whether the changes-feed synchronizer runs.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Seconds between polls when the feed is drained.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Page size requested from the changes feed.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    /// Ceiling for the rate-limit backoff, in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: bool_true(),
            poll_interval_secs: default_poll_interval(),
            page_limit: default_page_limit(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_page_limit() -> usize {
    1000
}

fn default_max_backoff() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory for cached metadata documents.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Directory for the sync cursor and the stats event log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from an optional YAML file.  No file means all
/// defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.prefetch.max_concurrent >= 1,
        "prefetch.max_concurrent must be at least 1"
    );
    anyhow::ensure!(
        config.sync.page_limit >= 1,
        "sync.page_limit must be at least 1"
    );
    anyhow::ensure!(
        config.sync.poll_interval_secs >= 1,
        "sync.poll_interval_secs must be at least 1"
    );
    anyhow::ensure!(
        config.sync.max_backoff_secs >= config.sync.poll_interval_secs,
        "sync.max_backoff_secs must not be below sync.poll_interval_secs"
    );
    Ok(())
}
