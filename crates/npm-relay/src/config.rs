//! Configuration loading

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use relay_uplink::{GlobalConfig, NoProxy, ProxySetting, UplinkConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier of this relay in `Via` headers
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Overrides the default `npm-relay/<version>` user agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<ProxySetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<ProxySetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<NoProxy>,
    #[serde(default = "default_uplinks")]
    pub uplinks: BTreeMap<String, UplinkConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_server_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

fn default_uplinks() -> BTreeMap<String, UplinkConfig> {
    BTreeMap::from([(
        "npmjs".to_string(),
        UplinkConfig::new("https://registry.npmjs.org/"),
    )])
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// Process-wide settings handed to every uplink
    pub fn global(&self) -> GlobalConfig {
        let mut global = GlobalConfig::new(self.server_id.clone());
        if let Some(user_agent) = &self.user_agent {
            global.user_agent = user_agent.clone();
        }
        global.http_proxy = self.http_proxy.clone();
        global.https_proxy = self.https_proxy.clone();
        global.no_proxy = self.no_proxy.clone();
        global
    }

    /// Look up an uplink by name, or take the first configured one
    pub fn get_uplink(&self, name: Option<&str>) -> Result<(&str, &UplinkConfig)> {
        match name {
            Some(name) => self
                .uplinks
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| anyhow::anyhow!("Uplink '{}' not found", name)),
            None => self
                .uplinks
                .iter()
                .next()
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| anyhow::anyhow!("No uplinks configured")),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            user_agent: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            uplinks: default_uplinks(),
            logging: LoggingConfig::default(),
        }
    }
}
