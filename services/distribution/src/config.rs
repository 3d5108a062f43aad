//! Pull configuration.
//!
//! [`PullConfig`] is what the library consumes: behaviour switches plus the
//! injected collaborators. [`Config`] is the process-level configuration
//! read from the environment by `dray-pull` and turned into a
//! [`PullConfig`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;

use crate::auth::{Anonymous, CredentialProvider, Credentials, StaticCredentials};
use crate::client::ClientOptions;
use crate::endpoint::{EndpointResolver, StaticEndpointResolver};
use crate::events::{EventLogger, TracingEventLogger};
use crate::platform::Platform;
use crate::progress::{NoopProgress, ProgressSink};
use crate::puller::{HttpPullerFactory, PullerFactory};
use crate::store::{ContentStore, FsStore, MemoryMetadataStore, MemoryStore, MetadataStore};

/// Configuration for one or more pulls.
#[derive(Clone)]
pub struct PullConfig {
    /// Never use legacy v1 endpoints.
    pub require_schema2: bool,
    /// Registries tried in order for unqualified references.
    pub default_registries: Vec<String>,
    /// Platform to select from manifest lists. Defaults to the host.
    pub platform: Option<Platform>,
    pub max_blob_size: Option<u64>,
    pub request_timeout: Duration,
    pub blob_timeout: Duration,
    pub user_agent: String,

    pub resolver: Arc<dyn EndpointResolver>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub store: Arc<dyn ContentStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub progress: Arc<dyn ProgressSink>,
    pub events: Arc<dyn EventLogger>,
    pub pullers: Arc<dyn PullerFactory>,
}

impl Default for PullConfig {
    fn default() -> Self {
        let client = ClientOptions::default();
        Self {
            require_schema2: false,
            default_registries: vec![dray_reference::DEFAULT_DOMAIN.to_string()],
            platform: None,
            max_blob_size: client.max_blob_size,
            request_timeout: client.request_timeout,
            blob_timeout: client.blob_timeout,
            user_agent: client.user_agent,
            resolver: Arc::new(StaticEndpointResolver::new()),
            credentials: Arc::new(Anonymous),
            store: Arc::new(MemoryStore::new()),
            metadata: Arc::new(MemoryMetadataStore::new()),
            progress: Arc::new(NoopProgress),
            events: Arc::new(TracingEventLogger),
            pullers: Arc::new(HttpPullerFactory),
        }
    }
}

impl fmt::Debug for PullConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullConfig")
            .field("require_schema2", &self.require_schema2)
            .field("default_registries", &self.default_registries)
            .field("platform", &self.platform)
            .field("max_blob_size", &self.max_blob_size)
            .field("request_timeout", &self.request_timeout)
            .field("blob_timeout", &self.blob_timeout)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl PullConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_require_schema2(mut self, require: bool) -> Self {
        self.require_schema2 = require;
        self
    }

    pub fn with_default_registries<I, S>(mut self, registries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_registries = registries.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_max_blob_size(mut self, limit: Option<u64>) -> Self {
        self.max_blob_size = limit;
        self
    }

    pub fn with_timeouts(mut self, request: Duration, blob: Duration) -> Self {
        self.request_timeout = request;
        self.blob_timeout = blob;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventLogger>) -> Self {
        self.events = events;
        self
    }

    pub fn with_pullers(mut self, pullers: Arc<dyn PullerFactory>) -> Self {
        self.pullers = pullers;
        self
    }

    /// The platform manifest lists are matched against.
    pub fn target_platform(&self) -> Platform {
        self.platform.clone().unwrap_or_else(Platform::current)
    }

    pub(crate) fn client_options(&self) -> ClientOptions {
        ClientOptions {
            user_agent: self.user_agent.clone(),
            request_timeout: self.request_timeout,
            blob_timeout: self.blob_timeout,
            max_blob_size: self.max_blob_size,
        }
    }
}

// =============================================================================
// Process configuration
// =============================================================================

/// `dray-pull` configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Local store directory. Without one, pulled content is kept in memory.
    pub data_dir: Option<PathBuf>,

    /// Pull-through mirrors for Docker Hub.
    pub mirrors: Vec<String>,

    /// Registries reachable over plaintext or unverified TLS.
    pub insecure_registries: Vec<String>,

    /// Registries tried in order for unqualified references.
    pub default_registries: Vec<String>,

    pub require_schema2: bool,

    pub username: Option<String>,
    pub password: Option<String>,
    pub registry_token: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let list = |key: &str| -> Vec<String> {
            lookup(key)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let default_registries = match list("DRAY_DEFAULT_REGISTRIES") {
            registries if registries.is_empty() => {
                vec![dray_reference::DEFAULT_DOMAIN.to_string()]
            }
            registries => registries,
        };

        let require_schema2 = match lookup("DRAY_REQUIRE_SCHEMA2") {
            Some(v) => parse_bool(&v).with_context(|| format!("DRAY_REQUIRE_SCHEMA2={}", v))?,
            None => false,
        };

        Ok(Self {
            data_dir: lookup("DRAY_DATA_DIR").map(PathBuf::from),
            mirrors: list("DRAY_REGISTRY_MIRRORS"),
            insecure_registries: list("DRAY_INSECURE_REGISTRIES"),
            default_registries,
            require_schema2,
            username: lookup("DRAY_USERNAME"),
            password: lookup("DRAY_PASSWORD"),
            registry_token: lookup("DRAY_REGISTRY_TOKEN"),
            log_level: lookup("DRAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Endpoint resolver for the configured mirrors and insecure registries.
    pub fn resolver(&self) -> Result<StaticEndpointResolver> {
        let mut resolver =
            StaticEndpointResolver::new().with_legacy_endpoints(!self.require_schema2);
        for mirror in &self.mirrors {
            let url = Url::parse(mirror).with_context(|| format!("invalid mirror URL {}", mirror))?;
            resolver = resolver.with_mirror(dray_reference::DEFAULT_DOMAIN, url);
        }
        for registry in &self.insecure_registries {
            resolver = resolver.with_insecure_registry(registry);
        }
        Ok(resolver)
    }

    /// Credentials applied to every registry.
    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        let credentials = match (&self.registry_token, &self.username, &self.password) {
            (Some(token), _, _) => Credentials::Bearer(token.clone()),
            (None, Some(username), Some(password)) => Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => return Arc::new(Anonymous),
        };
        Arc::new(StaticCredentials::new().with_default(credentials))
    }

    /// Build the library configuration, opening the store when a data
    /// directory is configured.
    pub async fn pull_config(&self) -> Result<PullConfig> {
        let store: Arc<dyn ContentStore> = match &self.data_dir {
            Some(dir) => Arc::new(
                FsStore::open(dir)
                    .await
                    .with_context(|| format!("opening store at {}", dir.display()))?,
            ),
            None => Arc::new(MemoryStore::new()),
        };

        Ok(PullConfig::new()
            .with_require_schema2(self.require_schema2)
            .with_default_registries(self.default_registries.clone())
            .with_resolver(Arc::new(self.resolver()?))
            .with_credentials(self.credentials())
            .with_store(store))
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {:?}", other),
    }
}
