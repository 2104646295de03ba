//! Typed configuration.
//!
//! [`Config`] comes from environment variables, loaded once at startup,
//! failing fast if required vars are missing. Worker tuning lives in an
//! optional TOML file ([`WorkerSettings`]).
//! Sensitive values are wrapped in secrecy::SecretString to prevent log leaks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{DEFAULT_BASE_URL, normalize_base_url};
use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug)]
pub struct Config {
    pub data_root: PathBuf,
    pub comfyui_url: String,
    pub comfyui_api_token: Option<SecretString>,
    /// Path of the worker TOML file, if any.
    pub worker_config: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            data_root: PathBuf::from(required_var("ASSETGEN_DATA_ROOT")?),
            comfyui_url: normalize_base_url(
                &optional_var("COMFYUI_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            ),
            comfyui_api_token: optional_var("COMFYUI_API_TOKEN").map(SecretString::from),
            worker_config: optional_var("ASSETGEN_WORKER_CONFIG").map(PathBuf::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and blank are the same thing.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Worker loop tuning.
///
/// ```toml
/// poll_interval_ms = 1500
/// project_concurrency = 2
/// workflows_dir = "pipeline/comfyui/workflows"
///
/// [adapters]
/// bg_remove_command = "tools/bg_remove"
/// atlas_pack_command = "tools/atlas_pack"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Renewed every third of the TTL while the project's jobs run.
    pub lease_ttl_ms: u64,
    /// Jobs run concurrently per project per cycle.
    pub project_concurrency: usize,
    /// Minutes a job may stay running before the sweep requeues it.
    pub stuck_threshold_minutes: i64,
    pub generate_poll_ms: u64,
    pub generate_timeout_ms: u64,
    /// Directory holding `<templateId>.json` and `<templateId>.bindings.json`.
    pub workflows_dir: PathBuf,
    pub adapters: AdapterSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub bg_remove_command: Option<PathBuf>,
    pub atlas_pack_command: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_500,
            heartbeat_interval_ms: 5_000,
            lease_ttl_ms: 30_000,
            project_concurrency: 1,
            stuck_threshold_minutes: 15,
            generate_poll_ms: 750,
            generate_timeout_ms: 10 * 60 * 1_000,
            workflows_dir: PathBuf::from("pipeline/comfyui/workflows"),
            adapters: AdapterSettings::default(),
        }
    }
}

impl WorkerSettings {
    /// Defaults when `path` is `None`; a missing or malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad worker config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// How often a held project lease is pushed forward while jobs run.
    pub fn lease_renew_interval(&self) -> Duration {
        (self.lease_ttl() / 3).max(Duration::from_millis(10))
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stuck_threshold_minutes)
    }

    pub fn generate_poll(&self) -> Duration {
        Duration::from_millis(self.generate_poll_ms)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_millis(self.generate_timeout_ms)
    }
}
