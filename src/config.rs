//! Configuration file loading
//!
//! Everything has a default, so an empty or missing file is valid. Values
//! are layered: built-in defaults, then the TOML file, then environment
//! variable overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::activity_tracker::TrackerConfig;
use crate::report_uploader::{RetryPolicy, UploaderConfig, UploaderConfigBuilder};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "SPOTWIRE_CONFIG";
/// Config file used when nothing else is specified, if it exists
pub const DEFAULT_CONFIG_FILE: &str = "./spotwire.toml";

/// Top-level configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpotwireConfig {
    pub tracker: TrackerConfig,
    pub uploader: UploaderSection,
    pub monitor: MonitorSection,
    /// Serve Prometheus metrics on this port when set
    pub metrics_port: Option<u16>,
}

/// `[uploader]` table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploaderSection {
    pub server: String,
    pub port: u16,
    pub host_header: Option<String>,
    pub reporter_grid: String,
    pub client_version: Option<String>,
    pub send_attempts: u32,
    pub write_retry_delay_ms: u64,
    pub read_attempts: u32,
    pub read_retry_delay_ms: u64,
    pub read_buffer_size: usize,
    pub stats_interval_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for UploaderSection {
    fn default() -> Self {
        let uploader = UploaderConfig::default();
        let retry = uploader.retry;
        Self {
            server: uploader.server,
            port: uploader.port,
            host_header: None,
            reporter_grid: uploader.reporter_grid,
            client_version: None,
            send_attempts: retry.send_attempts,
            write_retry_delay_ms: retry.write_retry_delay.as_millis() as u64,
            read_attempts: retry.read_attempts,
            read_retry_delay_ms: retry.read_retry_delay.as_millis() as u64,
            read_buffer_size: retry.read_buffer_size,
            stats_interval_seconds: uploader.stats_interval.as_secs(),
            shutdown_timeout_seconds: uploader.shutdown_timeout.as_secs(),
        }
    }
}

impl UploaderSection {
    pub fn to_uploader_config(&self) -> UploaderConfig {
        let mut builder = UploaderConfigBuilder::new()
            .server(&self.server)
            .port(self.port)
            .host_header(self.host_header.as_deref())
            .reporter_grid(&self.reporter_grid)
            .retry(RetryPolicy {
                send_attempts: self.send_attempts,
                write_retry_delay: Duration::from_millis(self.write_retry_delay_ms),
                read_attempts: self.read_attempts,
                read_retry_delay: Duration::from_millis(self.read_retry_delay_ms),
                read_buffer_size: self.read_buffer_size,
            })
            .stats_interval(Duration::from_secs(self.stats_interval_seconds))
            .shutdown_timeout(Duration::from_secs(self.shutdown_timeout_seconds));
        if let Some(version) = &self.client_version {
            builder = builder.client_version(version);
        }
        builder.build()
    }
}

/// `[monitor]` table: how `run` reports decode activity
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSection {
    /// Query window for the periodic activity summary
    pub window_seconds: u32,
    /// How often the summary is logged
    pub interval_seconds: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            window_seconds: 900,
            interval_seconds: 60,
        }
    }
}

impl SpotwireConfig {
    /// Parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: SpotwireConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Load the effective configuration
    ///
    /// An explicitly requested file must exist. Without one, the default file
    /// is used if present. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(explicit) {
            Some(path) => {
                info!("Loading configuration from {:?}", path);
                Self::from_file(&path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `SPOTWIRE_GRID`, `SPOTWIRE_COLLECTOR_HOST` and
    /// `SPOTWIRE_COLLECTOR_PORT`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(grid) = std::env::var("SPOTWIRE_GRID") {
            self.uploader.reporter_grid = grid;
        }
        if let Ok(host) = std::env::var("SPOTWIRE_COLLECTOR_HOST") {
            self.uploader.server = host;
        }
        if let Ok(port) = std::env::var("SPOTWIRE_COLLECTOR_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.uploader.port = p,
                Err(_) => warn!("Ignoring invalid SPOTWIRE_COLLECTOR_PORT {:?}", port),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracker.source_count == 0 {
            anyhow::bail!("tracker.source_count must be at least 1");
        }
        if self.uploader.reporter_grid.trim().is_empty() {
            anyhow::bail!("uploader.reporter_grid must not be empty");
        }
        Ok(())
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `--config` argument
/// 2. `SPOTWIRE_CONFIG` env var
/// 3. `./spotwire.toml` if it exists
fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    fallback.exists().then_some(fallback)
}
