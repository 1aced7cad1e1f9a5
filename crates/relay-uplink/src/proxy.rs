//! Per-uplink HTTP proxy selection
//!
//! The proxy is chosen once, when the uplink is built, from the uplink's own
//! settings first and the global settings second. Exclusions follow the
//! `no_proxy` convention of command line HTTP tools: a rule matches when the
//! hostname ends with it, both sides normalized to start with a dot.

use tracing::debug;

use crate::config::{GlobalConfig, UplinkConfig};

/// Pick the proxy URL for `hostname`, or `None` for a direct connection
pub fn resolve_proxy(
    hostname: &str,
    https: bool,
    uplink: &UplinkConfig,
    global: &GlobalConfig,
) -> Option<String> {
    let proxy = uplink
        .proxy_setting(https)
        .or_else(|| global.proxy_setting(https))
        .and_then(|setting| setting.as_url());

    let no_proxy = uplink.no_proxy.as_ref().or(global.no_proxy.as_ref());

    if let Some(no_proxy) = no_proxy
        && let Some(rule) = excluded_by(hostname, &no_proxy.patterns())
    {
        if proxy.is_some() {
            debug!(host = hostname, rule = %rule, "not using proxy for {}, excluded by {} rule", hostname, rule);
        }
        return None;
    }

    let proxy = proxy?;
    debug!(host = hostname, proxy = proxy, "using proxy {} for {}", proxy, hostname);
    Some(proxy.to_string())
}

/// First `no_proxy` rule matching `hostname`, normalized with a leading dot
pub fn excluded_by(hostname: &str, patterns: &[&str]) -> Option<String> {
    let hostname = with_leading_dot(hostname);

    patterns
        .iter()
        .map(|pattern| with_leading_dot(pattern))
        .find(|pattern| hostname.ends_with(pattern.as_str()))
}

fn with_leading_dot(value: &str) -> String {
    if value.starts_with('.') {
        value.to_string()
    } else {
        format!(".{}", value)
    }
}
