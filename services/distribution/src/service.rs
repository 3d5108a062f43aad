//! Pull-and-persist.
//!
//! The pull pipeline only writes verified blobs. Recording the image and
//! pointing references at it happens here, after the pull succeeded.

use dray_digest::Digest;
use dray_reference::Reference;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PullConfig;
use crate::error::ImagePullError;
use crate::image::ImageRecord;
use crate::orchestrator;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Pull(#[from] ImagePullError),

    #[error("failed to store image: {0}")]
    Store(#[from] StoreError),
}

/// Pulls images and records them in the configured content store.
#[derive(Clone)]
pub struct ImageService {
    config: PullConfig,
}

impl ImageService {
    pub fn new(config: PullConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PullConfig {
        &self.config
    }

    /// Pull `reference`, store the image and tag it.
    ///
    /// The pulled tag is always moved to the new image. A digest reference
    /// that already points at a different image is left alone.
    pub async fn pull_and_store(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord, ServiceError> {
        let record = orchestrator::pull(reference, &self.config, cancel).await?;
        let store = &self.config.store;

        let id = store.put_image(&record).await?;
        let pulled = &record.reference;

        if let Some(tag) = pulled.tag() {
            let tagged = pulled
                .trim()
                .with_tag(tag)
                .map_err(|e| ImagePullError::InvalidReference(e.to_string()))?;
            store.tag(&tagged, &id).await?;
        }

        if let Some(manifest_digest) = &record.manifest_digest {
            self.add_digest_reference(pulled, manifest_digest, &id)
                .await?;
        }

        info!(reference = %pulled, image_id = %id, "image stored");
        Ok(record)
    }

    async fn add_digest_reference(
        &self,
        pulled: &Reference,
        manifest_digest: &Digest,
        id: &Digest,
    ) -> Result<(), StoreError> {
        let store = &self.config.store;
        let by_digest = pulled.trim().with_digest(manifest_digest.clone());

        match store.resolve(&by_digest).await? {
            Some(existing) if existing != *id => {
                warn!(
                    reference = %by_digest,
                    existing = %existing,
                    image_id = %id,
                    "image ID for digest reference changed, keeping the existing one"
                );
                Ok(())
            }
            Some(_) => Ok(()),
            None => store.tag(&by_digest, id).await,
        }
    }
}
