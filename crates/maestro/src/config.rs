//! Operator configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::MaestroError;

/// Configuration consumed by the topology layer. Every field has a working
/// default so a config file only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How often (seconds) an instance is due for a fresh probe.
    pub instance_poll_seconds: u32,
    /// Instances not seen for this many hours are swept from the store.
    pub unseen_instance_forget_hours: u32,
    /// Grace sleep after `start slave` before re-probing, in milliseconds.
    pub slave_start_post_wait_milliseconds: u64,
    /// Prefer `SHOW SLAVE HOSTS` over processlist scanning for slave discovery.
    pub discover_by_show_slave_hosts: bool,
    /// Operator-supplied replacement for `Seconds_Behind_Master`; empty means
    /// use the value reported by `SHOW SLAVE STATUS`.
    pub slave_lag_query: String,
    /// Gate for the host-agent enrichment of read results.
    pub serve_agents_http: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_poll_seconds: 60,
            unseen_instance_forget_hours: 240,
            slave_start_post_wait_milliseconds: 1000,
            discover_by_show_slave_hosts: false,
            slave_lag_query: String::new(),
            serve_agents_http: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MaestroError> {
        let path_display = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MaestroError::from_io_error(e, &path_display))?;
        serde_json::from_str(&content).map_err(|e| MaestroError::ConfigParse {
            path: path_display,
            reason: e.to_string(),
        })
    }
}
