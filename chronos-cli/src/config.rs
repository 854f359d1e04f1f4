use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chronos_core::cluster::config::{ClusterConfig, ResyncConfig};
use chronos_core::{NodeAddr, ViewSnapshot};
use serde::{Deserialize, Serialize};

/// Full configuration of a Chronos node, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP listener settings.
    pub http: HttpConfig,
    /// Cluster membership.
    pub cluster: ClusterConfig,
    /// Resync tuning.
    pub resync: ResyncConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to bind.
    pub bind_address: String,
    /// Port to bind.
    pub bind_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 7253,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter, overridable with `--log-level`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        if config.cluster.localhost.is_empty() {
            anyhow::bail!("[cluster] localhost must be set to this node's host:port");
        }
        Ok(config)
    }

    /// Builds the cluster view snapshot this configuration describes.
    #[must_use]
    pub fn view_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            staying: self.cluster.staying_addrs(),
            leaving: self.cluster.leaving_addrs(),
            joining: self.cluster.joining_addrs(),
            view_id: self.cluster.effective_view_id(),
            local: NodeAddr::new(&self.cluster.localhost),
        }
    }
}
