//! Service configuration
//!
//! Defaults, optionally overlaid by a TOML file. The binary applies CLI flags
//! and environment variables on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST base, e.g. `http://localhost:5000/api`
    pub api_base_url: String,
    /// Live feed endpoint
    pub ws_url: String,
    /// Entity whose ledger the session follows
    pub entity_id: Option<String>,
    /// Sent verbatim as the `Authorization` header
    pub auth_token: Option<String>,
    pub bind_addr: String,
    pub request_timeout_secs: u64,
    /// Cap for the live feed reconnect backoff
    pub max_reconnect_backoff_secs: u64,
    /// Per-entity broadcast capacity
    pub update_capacity: usize,
    /// Periodic bulk refresh; disabled when unset or zero
    pub refresh_interval_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".to_string(),
            ws_url: "ws://localhost:5000/ws".to_string(),
            entity_id: None,
            auth_token: None,
            bind_addr: "127.0.0.1:3100".to_string(),
            request_timeout_secs: 10,
            max_reconnect_backoff_secs: 60,
            update_capacity: 256,
            refresh_interval_secs: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid config TOML")
    }

    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("In {}", path.display()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_backoff_secs.max(1))
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
