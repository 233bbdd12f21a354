use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::{debug, warn, Instrument};
use url::{Host, Url};

use crate::error::{ConfigError, DispatchError};
use crate::ip_rules::{BlockedHost, IpRules, IpRulesConfig, RuleResolver};
use crate::license::Licenser;
use crate::types::TlsPolicy;

/// Response bodies beyond this are cut off.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 50 * 1024;

/// Proxy value that means "connect directly".
pub const PROXY_DISABLED: &str = "nil";

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Forward proxy address. `None`, `""` and `"nil"` disable it.
    pub proxy_url: Option<String>,

    /// Destination ranges, enforced only when licensed.
    pub ip_rules: IpRulesConfig,

    pub max_response_size: usize,
    pub user_agent: String,
    pub pool_idle_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            proxy_url: None,
            ip_rules: IpRulesConfig::default(),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            user_agent: concat!("webhook-delivery/", env!("CARGO_PKG_VERSION")).to_string(),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl DispatcherOptions {
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub fn with_ip_rules(mut self, ip_rules: IpRulesConfig) -> Self {
        self.ip_rules = ip_rules;
        self
    }

    pub fn with_max_response_size(mut self, max: usize) -> Self {
        self.max_response_size = max;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// One outbound HTTP call.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,

    /// Deadline for the whole exchange, body read included.
    pub timeout: Duration,
    pub tls: TlsPolicy,
}

impl DispatchRequest {
    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            headers: BTreeMap::new(),
            body: body.into(),
            timeout,
            tls: TlsPolicy::Verify,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,

    /// At most `max_response_size` bytes.
    pub body: Vec<u8>,
    pub truncated: bool,
    pub latency: Duration,
    pub remote_addr: Option<SocketAddr>,
}

impl DispatchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs a single delivery attempt.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, DispatchError>;
}

/// `reqwest`-backed dispatcher.
///
/// Holds one connection pool per [`TlsPolicy`]. Cheap to share behind an
/// `Arc` across every worker of a process.
pub struct HttpDispatcher {
    licenser: Arc<dyn Licenser>,
    rules: Arc<IpRules>,
    verify_client: Client,
    insecure_client: Client,
    proxy: Option<String>,
    max_response_size: usize,
}

impl HttpDispatcher {
    pub fn new(
        licenser: Arc<dyn Licenser>,
        options: DispatcherOptions,
    ) -> Result<Self, ConfigError> {
        let rules = Arc::new(IpRules::from_config(&options.ip_rules).map_err(|e| {
            ConfigError::Invalid {
                field: "ip_rules",
                reason: e.to_string(),
            }
        })?);

        let proxy = if licenser.use_forward_proxy() {
            proxy_address(options.proxy_url.as_deref()).map(str::to_string)
        } else {
            None
        };

        // Behind a proxy the client only ever resolves the proxy itself;
        // destinations are covered by `check_destination`.
        let resolver = if licenser.ip_rules() && !rules.is_empty() && proxy.is_none() {
            Some(Arc::new(RuleResolver {
                rules: rules.clone(),
                licenser: licenser.clone(),
            }))
        } else {
            None
        };

        let verify_client =
            build_client(TlsPolicy::Verify, proxy.as_deref(), resolver.clone(), &options)?;
        let insecure_client =
            build_client(TlsPolicy::AcceptInvalidCerts, proxy.as_deref(), resolver, &options)?;

        debug!(
            proxy = proxy.as_deref().unwrap_or("none"),
            ip_rules = !rules.is_empty(),
            "dispatcher initialised"
        );

        Ok(Self {
            licenser,
            rules,
            verify_client,
            insecure_client,
            proxy,
            max_response_size: options.max_response_size,
        })
    }

    /// Proxy in effect, after licence and sentinel checks.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    fn client(&self, tls: TlsPolicy) -> &Client {
        match tls {
            TlsPolicy::Verify => &self.verify_client,
            TlsPolicy::AcceptInvalidCerts => &self.insecure_client,
        }
    }

    async fn check_destination(&self, url: &Url) -> Result<(), DispatchError> {
        if !self.licenser.ip_rules() || self.rules.is_empty() {
            return Ok(());
        }

        let addrs: Vec<IpAddr> = match url.host() {
            Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
            Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
            Some(Host::Domain(domain)) => {
                let port = url.port_or_known_default().unwrap_or(443);
                tokio::net::lookup_host((domain, port))
                    .await
                    .map_err(|e| {
                        DispatchError::network(format!("dns lookup for {domain} failed: {e}"))
                    })?
                    .map(|a| a.ip())
                    .collect()
            }
            None => return Err(DispatchError::policy("url has no host")),
        };

        match addrs.into_iter().find(|ip| !self.rules.permits(*ip)) {
            Some(blocked) => Err(DispatchError::policy(format!(
                "destination {blocked} is blocked by IP rules"
            ))),
            None => Ok(()),
        }
    }

    async fn send(&self, request: &DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        let url = Url::parse(&request.url)
            .map_err(|e| DispatchError::policy(format!("invalid url {}: {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DispatchError::policy(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        self.check_destination(&url).await?;

        let mut builder = self
            .client(request.tls)
            .request(request.method.clone(), url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let mut response = builder.send().await.map_err(classify_error)?;

        let status = response.status().as_u16();
        let remote_addr = response.remote_addr();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(classify_error)? {
            let room = self.max_response_size.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(DispatchResponse {
            status,
            headers,
            body,
            truncated,
            latency: started.elapsed(),
            remote_addr,
        })
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        let span = tracing::info_span!(
            "dispatch",
            url = %request.url,
            method = %request.method,
            status = tracing::field::Empty,
        );

        async {
            let result = self.send(request).await;
            match &result {
                Ok(response) => {
                    tracing::Span::current().record("status", response.status);
                    if response.truncated {
                        debug!(limit = self.max_response_size, "response body truncated");
                    }
                }
                Err(err) => warn!(error = %err, "dispatch failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Normalise the configured proxy, honouring the disabled sentinels.
pub fn proxy_address(raw: Option<&str>) -> Option<&str> {
    match raw.map(str::trim) {
        None | Some("") => None,
        Some(v) if v.eq_ignore_ascii_case(PROXY_DISABLED) => None,
        Some(v) => Some(v),
    }
}

fn build_client(
    tls: TlsPolicy,
    proxy: Option<&str>,
    resolver: Option<Arc<RuleResolver>>,
    options: &DispatcherOptions,
) -> Result<Client, ConfigError> {
    let mut builder = Client::builder()
        .user_agent(options.user_agent.clone())
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(options.pool_idle_timeout)
        .danger_accept_invalid_certs(tls == TlsPolicy::AcceptInvalidCerts);

    builder = match proxy {
        Some(addr) => builder.proxy(reqwest::Proxy::all(addr).map_err(|e| ConfigError::Invalid {
            field: "proxy_url",
            reason: e.to_string(),
        })?),
        None => builder.no_proxy(),
    };

    if let Some(resolver) = resolver {
        builder = builder.dns_resolver(resolver);
    }

    builder.build().map_err(|e| ConfigError::Invalid {
        field: "http_client",
        reason: e.to_string(),
    })
}

fn classify_error(err: reqwest::Error) -> DispatchError {
    if err.is_builder() {
        return DispatchError::policy(format!("invalid request: {err}"));
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(blocked) = cause.downcast_ref::<BlockedHost>() {
            return DispatchError::policy(blocked.to_string());
        }
        source = cause.source();
    }

    if err.is_timeout() {
        DispatchError::timeout(format!("request timed out: {err}"))
    } else {
        DispatchError::network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_sentinels_disable_forwarding() {
        assert_eq!(proxy_address(None), None);
        assert_eq!(proxy_address(Some("")), None);
        assert_eq!(proxy_address(Some("nil")), None);
        assert_eq!(proxy_address(Some(" NIL ")), None);
        assert_eq!(
            proxy_address(Some("http://proxy.internal:3128")),
            Some("http://proxy.internal:3128")
        );
    }

    #[test]
    fn only_2xx_is_success() {
        let mut response = DispatchResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: Vec::new(),
            truncated: false,
            latency: Duration::ZERO,
            remote_addr: None,
        };
        assert!(response.is_success());
        response.status = 204;
        assert!(response.is_success());
        for status in [301, 400, 404, 500, 503] {
            response.status = status;
            assert!(!response.is_success());
        }
    }
}
