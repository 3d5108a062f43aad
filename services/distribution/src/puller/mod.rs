//! Protocol pullers.
//!
//! A [`Puller`] performs one endpoint attempt. It either returns the
//! normalized image or an [`AttemptError`] telling the orchestrator whether
//! the next endpoint may be tried.

mod v1;
mod v2;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dray_reference::Reference;
use tokio_util::sync::CancellationToken;

use crate::client::RegistryClient;
use crate::config::PullConfig;
use crate::endpoint::{ApiVersion, Endpoint};
use crate::error::{AttemptError, PullError};
use crate::image::ImageRecord;

pub use v1::V1Puller;
pub use v2::V2Puller;

/// How much of the image to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Manifest, config and every layer blob.
    Full,
    /// Manifest and config only.
    MetadataOnly,
}

/// Result of a successful attempt.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    pub record: ImageRecord,
    /// Layer blobs that were not in the local store and had to be fetched.
    pub layers_downloaded: usize,
}

#[async_trait]
pub trait Puller: Send + Sync {
    /// Pull `reference` from this puller's endpoint.
    ///
    /// Every network operation observes `cancel`; a cancelled pull returns
    /// [`PullError::Cancelled`] as a fatal error.
    async fn pull(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, AttemptError>;
}

/// Builds the puller for an endpoint's protocol version.
pub trait PullerFactory: Send + Sync {
    fn new_puller(
        &self,
        endpoint: &Endpoint,
        reference: &Reference,
        config: &PullConfig,
        mode: PullMode,
    ) -> Result<Box<dyn Puller>, PullError>;
}

/// Pullers speaking HTTP to real registries.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpPullerFactory;

impl PullerFactory for HttpPullerFactory {
    fn new_puller(
        &self,
        endpoint: &Endpoint,
        reference: &Reference,
        config: &PullConfig,
        mode: PullMode,
    ) -> Result<Box<dyn Puller>, PullError> {
        let credentials = config.credentials.credentials(endpoint, reference.path());
        let client = Arc::new(RegistryClient::new(
            endpoint.clone(),
            reference.path(),
            credentials,
            config.client_options(),
        )?);
        let context = PullContext::new(client, reference, config, mode);

        Ok(match endpoint.version {
            ApiVersion::V2 => Box::new(V2Puller::new(context)),
            ApiVersion::V1 => Box::new(V1Puller::new(context)),
        })
    }
}

/// Everything one attempt needs, shared by both protocol versions.
pub(crate) struct PullContext {
    pub client: Arc<RegistryClient>,
    /// Registry domain, the key for v1 ID mappings.
    pub registry: String,
    pub config: PullConfig,
    pub mode: PullMode,
}

impl PullContext {
    fn new(
        client: Arc<RegistryClient>,
        reference: &Reference,
        config: &PullConfig,
        mode: PullMode,
    ) -> Self {
        Self {
            client,
            registry: reference.domain().unwrap_or_default().to_string(),
            config: config.clone(),
            mode,
        }
    }

    /// The transport reached the server, error responses included.
    fn transport_ok(&self) -> bool {
        self.client.responded()
    }
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, PullError>
where
    F: Future<Output = Result<T, PullError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PullError::Cancelled),
        result = fut => result,
    }
}
