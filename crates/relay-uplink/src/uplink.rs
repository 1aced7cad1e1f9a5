//! A single upstream registry

use std::sync::Arc;

use reqwest::header::HeaderValue;
use reqwest::{Certificate, Client, Proxy};
use tracing::info;
use url::Url;

use crate::config::{GlobalConfig, UplinkConfig};
use crate::error::UplinkError;
use crate::health::HealthTracker;
use crate::proxy::resolve_proxy;
use crate::request::{RequestExecutor, Target, UplinkRequest};

/// Client for one upstream registry
///
/// Built once per configured uplink and shared by every request that needs
/// it. Proxy selection, CA bundle and timeout are fixed at construction.
pub struct Uplink {
    config: UplinkConfig,
    /// URL as configured, used for ownership checks
    url: Url,
    base_url: String,
    proxy: Option<String>,
    pub(crate) executor: RequestExecutor,
    health: Arc<HealthTracker>,
}

impl Uplink {
    /// Create a new uplink client
    pub fn new(config: UplinkConfig, global: &GlobalConfig) -> Result<Self, UplinkError> {
        let url = parse_url(&config.url)?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(UplinkError::UnsupportedUrl(config.url.clone()));
        }

        let base_url = config.base_url().to_string();
        let base = parse_url(&base_url)?;

        let hostname = url.host_str().unwrap_or_default();
        let proxy = resolve_proxy(hostname, url.scheme() == "https", &config, global);

        let timeout = config.effective_timeout();
        let mut builder = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout);

        builder = match &proxy {
            Some(proxy) => builder.proxy(Proxy::all(proxy).map_err(|source| {
                UplinkError::InvalidProxy {
                    proxy: proxy.clone(),
                    source,
                }
            })?),
            None => builder.no_proxy(),
        };

        for certificate in load_ca_bundle(&config)? {
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder.build()?;
        let health = Arc::new(HealthTracker::new(
            host_with_port(&url),
            config.fast_fail_offline,
        ));
        let user_agent = HeaderValue::from_str(&global.user_agent)?;
        let executor = RequestExecutor::new(
            client,
            base,
            user_agent,
            &global.server_id,
            health.clone(),
        );

        info!("Created uplink client for {}", base_url);

        Ok(Self {
            config,
            url,
            base_url,
            proxy,
            executor,
            health,
        })
    }

    /// Base URL, never with a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn config(&self) -> &UplinkConfig {
        &self.config
    }

    /// Proxy chosen for this uplink, if any
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Whether requests should be attempted against this uplink
    pub fn is_available(&self) -> bool {
        self.health.is_available()
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// Check if the uplink is reachable
    ///
    /// Any HTTP answer marks the uplink alive; `Ok(false)` means it answered
    /// with a non-2xx status.
    pub async fn ping(&self) -> Result<bool, UplinkError> {
        let request = UplinkRequest::get(Target::Absolute(self.url.to_string()));
        let reply = self.executor.execute(request).await?;
        Ok(reply.is_success())
    }

    /// Whether `candidate` points inside this uplink
    ///
    /// Scheme, host and port must match, and the path must start with the
    /// uplink's own path.
    pub fn can_fetch(&self, candidate: &str) -> bool {
        let Ok(candidate) = Url::parse(candidate) else {
            return false;
        };

        candidate.scheme() == self.url.scheme()
            && candidate.host_str() == self.url.host_str()
            && candidate.port() == self.url.port()
            && candidate.path().starts_with(self.url.path())
    }
}

impl std::fmt::Debug for Uplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uplink")
            .field("url", &self.base_url)
            .field("proxy", &self.proxy)
            .field("health", &self.health.snapshot())
            .finish_non_exhaustive()
    }
}

fn parse_url(raw: &str) -> Result<Url, UplinkError> {
    Url::parse(raw).map_err(|source| UplinkError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn load_ca_bundle(config: &UplinkConfig) -> Result<Vec<Certificate>, UplinkError> {
    let pem = match (&config.ca, &config.ca_file) {
        (Some(inline), _) => inline.clone().into_bytes(),
        (None, Some(path)) => std::fs::read(path)?,
        (None, None) => return Ok(Vec::new()),
    };

    let certificates = Certificate::from_pem_bundle(&pem)
        .map_err(|e| UplinkError::InvalidCertificate(e.to_string()))?;
    if certificates.is_empty() {
        return Err(UplinkError::InvalidCertificate(
            "no certificates found".to_string(),
        ));
    }

    Ok(certificates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NoProxy, ProxySetting};

    fn uplink(url: &str) -> Uplink {
        Uplink::new(UplinkConfig::new(url), &GlobalConfig::new("test")).unwrap()
    }

    #[test]
    fn test_base_url_has_no_trailing_slash() {
        assert_eq!(
            uplink("https://registry.npmjs.org/").base_url(),
            "https://registry.npmjs.org"
        );
    }

    #[test]
    fn test_can_fetch_same_origin() {
        let npmjs = uplink("https://registry.npmjs.org/");
        assert!(npmjs.can_fetch("https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz"));
        assert!(!npmjs.can_fetch("http://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz"));
        assert!(!npmjs.can_fetch("https://registry.yarnpkg.com/left-pad/-/left-pad-1.3.0.tgz"));
        assert!(!npmjs.can_fetch("https://registry.npmjs.org:8443/left-pad/-/left-pad-1.3.0.tgz"));
        assert!(!npmjs.can_fetch("not a url"));
    }

    #[test]
    fn test_can_fetch_checks_path_prefix() {
        let nested = uplink("http://mirror.local:4873/npm/");
        assert!(nested.can_fetch("http://mirror.local:4873/npm/left-pad/-/left-pad-1.3.0.tgz"));
        assert!(!nested.can_fetch("http://mirror.local:4873/other/left-pad/-/left-pad-1.3.0.tgz"));
        assert!(!nested.can_fetch("http://mirror.local/npm/left-pad/-/left-pad-1.3.0.tgz"));
    }

    #[test]
    fn test_proxy_resolved_at_construction() {
        let global = GlobalConfig {
            https_proxy: Some(ProxySetting::Url("http://proxy.local:3128".to_string())),
            no_proxy: Some(NoProxy::Text("internal.corp".to_string())),
            ..GlobalConfig::new("test")
        };

        let public = Uplink::new(UplinkConfig::new("https://registry.npmjs.org"), &global).unwrap();
        assert_eq!(public.proxy(), Some("http://proxy.local:3128"));

        let internal =
            Uplink::new(UplinkConfig::new("https://npm.internal.corp"), &global).unwrap();
        assert_eq!(internal.proxy(), None);
    }

    #[test]
    fn test_rejects_unsupported_urls() {
        let global = GlobalConfig::new("test");
        assert!(matches!(
            Uplink::new(UplinkConfig::new("ftp://registry.npmjs.org"), &global),
            Err(UplinkError::UnsupportedUrl(_))
        ));
        assert!(matches!(
            Uplink::new(UplinkConfig::new("registry.npmjs.org"), &global),
            Err(UplinkError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_rejects_garbage_ca_bundle() {
        let config = UplinkConfig {
            ca: Some("not a certificate".to_string()),
            ..UplinkConfig::new("https://registry.npmjs.org")
        };
        assert!(matches!(
            Uplink::new(config, &GlobalConfig::new("test")),
            Err(UplinkError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_huge_timeout_falls_back() {
        let config = UplinkConfig {
            timeout: Some(crate::config::TimeoutSetting::Millis(1e300)),
            ..UplinkConfig::new("https://registry.npmjs.org")
        };
        assert!(Uplink::new(config, &GlobalConfig::new("test")).is_ok());
    }

    #[test]
    fn test_health_starts_alive() {
        let npmjs = uplink("https://registry.npmjs.org");
        assert!(npmjs.is_available());
        assert!(npmjs.health().snapshot().alive);
        assert_eq!(npmjs.health().host(), "registry.npmjs.org");
    }
}
