//! Uplink configuration types
//!
//! These types are deserialized straight from the host process configuration.
//! Every field except `url` is optional so that a bare `url = "..."` entry is
//! a complete uplink definition; global proxy settings are inherited unless an
//! uplink overrides them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Timeout applied when none (or an unusable one) is configured
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// User agent sent when neither the caller nor the configuration sets one
pub const DEFAULT_USER_AGENT: &str = concat!("npm-relay/", env!("CARGO_PKG_VERSION"));

/// A proxy setting: either a proxy URL, or a boolean
///
/// Only a non-empty string selects a proxy. `false` lets a single uplink opt
/// out of a globally configured proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxySetting {
    Url(String),
    Flag(bool),
}

impl ProxySetting {
    /// The proxy URL, if this setting names one
    pub fn as_url(&self) -> Option<&str> {
        match self {
            ProxySetting::Url(url) if !url.is_empty() => Some(url),
            _ => None,
        }
    }
}

/// Hosts that must be reached without a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoProxy {
    /// Ordered list of host-suffix patterns
    List(Vec<String>),
    /// Comma-separated host-suffix patterns
    Text(String),
}

impl NoProxy {
    /// Patterns in their configured order, with blank entries skipped
    pub fn patterns(&self) -> Vec<&str> {
        match self {
            NoProxy::List(items) => items
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect(),
            NoProxy::Text(text) => text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

/// Request timeout in milliseconds, as a number or a numeric string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeoutSetting {
    Millis(f64),
    Text(String),
}

impl TimeoutSetting {
    fn millis(&self) -> Option<f64> {
        let ms = match self {
            TimeoutSetting::Millis(ms) => *ms,
            TimeoutSetting::Text(text) => text.trim().parse::<f64>().ok()?,
        };

        (ms.is_finite() && ms > 0.0).then_some(ms)
    }
}

/// Configuration of a single uplink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConfig {
    /// Base URL of the upstream registry
    pub url: String,
    /// PEM encoded CA bundle used to verify the uplink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    /// Path to a PEM CA bundle, read when `ca` is not given inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// Request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<ProxySetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<ProxySetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<NoProxy>,
    /// Refuse requests for a while after the uplink went offline
    #[serde(default)]
    pub fast_fail_offline: bool,
}

impl UplinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ca: None,
            ca_file: None,
            timeout: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            fast_fail_offline: false,
        }
    }

    /// Timeout to hand to the transport
    ///
    /// Values that are unusable or too large for a `Duration` fall back to
    /// [`DEFAULT_TIMEOUT_MS`].
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .as_ref()
            .and_then(TimeoutSetting::millis)
            .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
            .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// Base URL without its trailing slash
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub(crate) fn proxy_setting(&self, https: bool) -> Option<&ProxySetting> {
        if https {
            self.https_proxy.as_ref()
        } else {
            self.http_proxy.as_ref()
        }
    }
}

/// Process-wide settings shared by every uplink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Identifier used in `Via` headers to detect request loops
    pub server_id: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<ProxySetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<ProxySetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<NoProxy>,
}

impl GlobalConfig {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            user_agent: default_user_agent(),
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
        }
    }

    pub(crate) fn proxy_setting(&self, https: bool) -> Option<&ProxySetting> {
        if https {
            self.https_proxy.as_ref()
        } else {
            self.http_proxy.as_ref()
        }
    }
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
