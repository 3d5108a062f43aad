//! Registry endpoints and the resolver that orders them.

use std::collections::{HashMap, HashSet};
use std::fmt;

use reqwest::Url;

use crate::error::PullError;

/// Registry protocol generation spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    /// Legacy key/value protocol (`/v1/`).
    V1,
    /// Manifest-based protocol (`/v2/`).
    V2,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiVersion::V1 => f.write_str("v1"),
            ApiVersion::V2 => f.write_str("v2"),
        }
    }
}

/// One network location from which a registry can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: Url,
    pub version: ApiVersion,
    /// Endpoint is a pull-through mirror rather than the registry itself.
    pub mirror: bool,
    /// Verify the server certificate. Only meaningful for https.
    pub tls_verify: bool,
}

impl Endpoint {
    pub fn new(url: Url, version: ApiVersion) -> Self {
        Self {
            url,
            version,
            mirror: false,
            tls_verify: true,
        }
    }

    /// Parse `url` and build an endpoint for `version`.
    pub fn parse(url: &str, version: ApiVersion) -> Result<Self, PullError> {
        let url = Url::parse(url)
            .map_err(|e| PullError::Resolve(format!("invalid endpoint URL {}: {}", url, e)))?;
        Ok(Self::new(url, version))
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// `host[:port]` exactly as written in the URL, so that `https://reg`
    /// and `http://reg` name the same host.
    pub fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Base URL without a trailing slash.
    pub(crate) fn base(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.base(), self.version)
    }
}

/// Produces the ordered endpoint list for a registry host.
///
/// The order is the attempt order and is preserved by the orchestrator.
pub trait EndpointResolver: Send + Sync {
    fn lookup_pull_endpoints(&self, registry: &str) -> Result<Vec<Endpoint>, PullError>;
}

/// Host that actually serves Docker Hub's v2 API.
pub const DOCKER_HUB_V2_HOST: &str = "registry-1.docker.io";

/// Host that served Docker Hub's v1 API.
pub const DOCKER_HUB_V1_HOST: &str = "index.docker.io";

/// Resolver driven by static configuration.
///
/// Order per registry: mirrors (v2), https v2, plaintext v2 for insecure
/// registries, then the same https/plaintext pair for v1 when legacy
/// endpoints are enabled.
#[derive(Debug, Clone, Default)]
pub struct StaticEndpointResolver {
    mirrors: HashMap<String, Vec<Url>>,
    insecure: HashSet<String>,
    legacy: bool,
}

impl StaticEndpointResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pull-through mirror for `registry`.
    pub fn with_mirror(mut self, registry: &str, mirror: Url) -> Self {
        self.mirrors
            .entry(registry.to_string())
            .or_default()
            .push(mirror);
        self
    }

    /// Allow plaintext and unverified TLS for `registry`.
    pub fn with_insecure_registry(mut self, registry: &str) -> Self {
        self.insecure.insert(registry.to_string());
        self
    }

    /// Also list legacy v1 endpoints.
    pub fn with_legacy_endpoints(mut self, enabled: bool) -> Self {
        self.legacy = enabled;
        self
    }

    fn hosts(registry: &str) -> (String, String) {
        if registry == dray_reference::DEFAULT_DOMAIN
            || registry == dray_reference::LEGACY_DEFAULT_DOMAIN
        {
            (DOCKER_HUB_V2_HOST.to_string(), DOCKER_HUB_V1_HOST.to_string())
        } else {
            (registry.to_string(), registry.to_string())
        }
    }
}

impl EndpointResolver for StaticEndpointResolver {
    fn lookup_pull_endpoints(&self, registry: &str) -> Result<Vec<Endpoint>, PullError> {
        let insecure = self.insecure.contains(registry);
        let (v2_host, v1_host) = Self::hosts(registry);
        let mut endpoints = Vec::new();

        for mirror in self.mirrors.get(registry).into_iter().flatten() {
            let mut endpoint = Endpoint::new(mirror.clone(), ApiVersion::V2);
            endpoint.mirror = true;
            endpoints.push(endpoint);
        }

        let mut push = |scheme: &str, host: &str, version: ApiVersion| -> Result<(), PullError> {
            let mut endpoint = Endpoint::parse(&format!("{}://{}", scheme, host), version)?;
            endpoint.tls_verify = !insecure;
            endpoints.push(endpoint);
            Ok(())
        };

        push("https", &v2_host, ApiVersion::V2)?;
        if insecure {
            push("http", &v2_host, ApiVersion::V2)?;
        }
        if self.legacy {
            push("https", &v1_host, ApiVersion::V1)?;
            if insecure {
                push("http", &v1_host, ApiVersion::V1)?;
            }
        }

        Ok(endpoints)
    }
}
