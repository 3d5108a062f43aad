//! Legacy (v1) puller.
//!
//! The v1 protocol names images by random IDs rather than digests: the
//! puller resolves the tag to an image ID, walks that image's ancestry and
//! fetches each ancestor's JSON and layer. Layers are digested on receipt
//! and the mapping is remembered so a later pull can skip them.

use async_trait::async_trait;
use dray_digest::Digest;
use dray_reference::Reference;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cancellable, PullContext, PullMode, PullOutcome, Puller};
use crate::error::{AttemptError, PullError, RegistryErrorCode};
use crate::manifest::{validate_v1_id, LegacyLayer, V1Image};
use crate::normalize::from_legacy_layers;
use crate::progress::{Phase, ProgressEvent};

pub struct V1Puller {
    ctx: PullContext,
}

impl V1Puller {
    pub(crate) fn new(ctx: PullContext) -> Self {
        Self { ctx }
    }

    async fn pull_inner(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, PullError> {
        if reference.digest().is_some() {
            return Err(PullError::NoSupport(
                "cannot pull by digest with v1 registry".to_string(),
            ));
        }
        if self.ctx.mode == PullMode::MetadataOnly {
            return Err(PullError::NoSupport(
                "cannot fetch image metadata without layers from a v1 registry".to_string(),
            ));
        }

        cancellable(cancel, self.ctx.client.ping_v1()).await?;
        let tags = cancellable(cancel, self.ctx.client.v1_tags()).await?;

        let tag = match reference.tag() {
            Some(tag) => tag.to_string(),
            None if tags.contains_key(dray_reference::DEFAULT_TAG) => {
                dray_reference::DEFAULT_TAG.to_string()
            }
            None => {
                let mut names: Vec<_> = tags.keys().collect();
                names.sort();
                names
                    .first()
                    .map(|t| t.to_string())
                    .ok_or_else(|| PullError::NoTags(reference.name()))?
            }
        };
        let reference = reference.clone().with_tag(&tag)?;

        let image_id = tags.get(&tag).ok_or_else(|| PullError::Registry {
            url: self.ctx.client.endpoint().to_string(),
            status: 404,
            code: RegistryErrorCode::ManifestUnknown,
            message: format!("tag {} not found in repository {}", tag, reference.name()),
        })?;
        validate_v1_id(image_id)?;

        let ancestry = cancellable(cancel, self.ctx.client.v1_ancestry(image_id)).await?;
        for id in &ancestry {
            validate_v1_id(id)?;
        }
        if ancestry.first() != Some(image_id) {
            return Err(PullError::InvalidLayerChain(format!(
                "ancestry of {} does not start with the image itself",
                image_id
            )));
        }

        let mut layers = Vec::with_capacity(ancestry.len());
        let mut layers_downloaded = 0;
        for id in ancestry.iter().rev() {
            let (layer, downloaded) = self.fetch_image(id, cancel).await?;
            if let Some(below) = layers.last() {
                check_parent(&layer, below)?;
            } else if !layer.image.parent.is_empty() {
                return Err(PullError::InvalidLayerChain(
                    "invalid parent ID in the base layer of the image".to_string(),
                ));
            }
            if downloaded {
                layers_downloaded += 1;
            }
            layers.push(layer);
        }

        let record = from_legacy_layers(&reference, &layers, None)?;
        Ok(PullOutcome {
            record,
            layers_downloaded,
        })
    }

    /// Fetch one image's JSON and, unless a known blob covers it, its layer.
    async fn fetch_image(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(LegacyLayer, bool), PullError> {
        let raw = cancellable(cancel, self.ctx.client.v1_image_json(id)).await?;
        let v1_compatibility = String::from_utf8(raw.to_vec())
            .map_err(|e| PullError::InvalidConfig(format!("image {}: {}", id, e)))?;
        let image: V1Image = serde_json::from_str(&v1_compatibility)
            .map_err(|e| PullError::InvalidConfig(format!("image {}: {}", id, e)))?;
        if image.id != id {
            return Err(PullError::InvalidLayerChain(format!(
                "image JSON for {} carries ID {}",
                id, image.id
            )));
        }

        let registry = &self.ctx.registry;
        let metadata = &self.ctx.config.metadata;
        let store = &self.ctx.config.store;
        let progress = &self.ctx.config.progress;
        let short = id.get(..12).unwrap_or(id);

        if let Some(digest) = metadata.digest_for_v1_id(registry, id).await {
            if store.has_blob(&digest).await? {
                progress.emit(ProgressEvent::blob(short, Phase::AlreadyExists));
                let layer = LegacyLayer {
                    digest,
                    image,
                    v1_compatibility,
                };
                return Ok((layer, false));
            }
        }

        progress.emit(ProgressEvent::blob(short, Phase::Downloading));
        let data = cancellable(cancel, self.ctx.client.v1_layer(id)).await?;
        let digest = Digest::sha256(&data);
        store.put_blob(&digest, data).await?;
        metadata.set_v1_id(registry, id, &digest).await;
        progress.emit(ProgressEvent::blob(short, Phase::Complete));
        debug!(image = id, digest = %digest, "v1 layer stored");

        let layer = LegacyLayer {
            digest,
            image,
            v1_compatibility,
        };
        Ok((layer, true))
    }
}

fn check_parent(layer: &LegacyLayer, below: &LegacyLayer) -> Result<(), PullError> {
    if layer.image.parent == below.image.id {
        Ok(())
    } else {
        Err(PullError::InvalidLayerChain(format!(
            "invalid parent ID: expected {}, got {}",
            below.image.id, layer.image.parent
        )))
    }
}

#[async_trait]
impl Puller for V1Puller {
    async fn pull(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, AttemptError> {
        match self.pull_inner(reference, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(_) if cancel.is_cancelled() => Err(AttemptError::Fatal(PullError::Cancelled)),
            Err(e) => Err(AttemptError::classify(e, false, self.ctx.transport_ok())),
        }
    }
}
