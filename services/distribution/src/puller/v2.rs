//! Manifest-based (v2) puller.

use async_trait::async_trait;
use bytes::Bytes;
use dray_digest::Digest;
use dray_reference::{Reference, DEFAULT_TAG};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cancellable, PullContext, PullMode, PullOutcome, Puller};
use crate::error::{AttemptError, PullError};
use crate::manifest::{
    decode_verified, CurrentManifest, Descriptor, LegacyManifest, Manifest, ManifestList,
    MEDIA_TYPE_FOREIGN_LAYER,
};
use crate::normalize::{normalize_current, normalize_legacy};
use crate::platform::select_manifest;
use crate::progress::{Phase, ProgressEvent};

pub struct V2Puller {
    ctx: PullContext,
}

impl V2Puller {
    pub(crate) fn new(ctx: PullContext) -> Self {
        Self { ctx }
    }

    /// What to ask the manifests endpoint for: the digest when there is
    /// one, else the tag, else a tag picked from the repository listing.
    async fn resolve(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<(Reference, String), PullError> {
        if let Some(digest) = reference.digest() {
            return Ok((reference.clone(), digest.to_string()));
        }
        if let Some(tag) = reference.tag() {
            return Ok((reference.clone(), tag.to_string()));
        }

        let tags = cancellable(cancel, self.ctx.client.list_tags()).await?;
        let tag = choose_tag(&tags)
            .ok_or_else(|| PullError::NoTags(reference.name()))?
            .to_string();
        debug!(tag = %tag, "no tag given, picked one from the repository");
        Ok((reference.clone().with_tag(&tag)?, tag))
    }

    async fn pull_inner(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
        confirmed_v2: &mut bool,
    ) -> Result<PullOutcome, PullError> {
        cancellable(cancel, self.ctx.client.ping_v2()).await?;

        let (reference, manifest_ref) = self.resolve(reference, cancel).await?;
        let fetched = cancellable(cancel, self.ctx.client.get_manifest(&manifest_ref)).await?;
        *confirmed_v2 = true;

        let verified = decode_verified(fetched, reference.digest())?;
        debug!(
            digest = %verified.digest,
            media_type = verified.manifest.media_type().as_str(),
            "manifest verified"
        );

        match verified.manifest {
            Manifest::Current(manifest) => {
                self.pull_current(&reference, manifest, verified.digest, cancel)
                    .await
            }
            Manifest::Legacy(manifest) => {
                self.pull_legacy(&reference, manifest, verified.digest, cancel)
                    .await
            }
            Manifest::List(list) => {
                self.pull_list(&reference, list, verified.digest, cancel)
                    .await
            }
        }
    }

    /// Select the local platform's entry and pull it. The record is
    /// labelled with the list's digest, the one the user addressed.
    async fn pull_list(
        &self,
        reference: &Reference,
        list: ManifestList,
        list_digest: Digest,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, PullError> {
        let platform = self.ctx.config.target_platform();
        let selected = select_manifest(&list, &platform)?;
        debug!(platform = %platform, digest = %selected, "selected manifest from list");

        let fetched =
            cancellable(cancel, self.ctx.client.get_manifest(&selected.to_string())).await?;
        let verified = decode_verified(fetched, Some(&selected))?;

        match verified.manifest {
            Manifest::Current(manifest) => {
                self.pull_current(reference, manifest, list_digest, cancel)
                    .await
            }
            Manifest::Legacy(manifest) => {
                self.pull_legacy(reference, manifest, list_digest, cancel)
                    .await
            }
            Manifest::List(_) => Err(PullError::NestedManifestList(selected.to_string())),
        }
    }

    /// Fetch the config and the layers side by side under one cancellation
    /// scope. Whichever fails first cancels the other.
    async fn pull_current(
        &self,
        reference: &Reference,
        manifest: CurrentManifest,
        manifest_digest: Digest,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, PullError> {
        let scope = cancel.child_token();

        let config = async {
            let result = self.fetch_config(&manifest.config, &scope).await;
            if result.is_err() {
                scope.cancel();
            }
            result
        };
        let layers = async {
            let result = self.fetch_layers(&manifest.layers, &scope).await;
            if result.is_err() {
                scope.cancel();
            }
            result
        };

        let (config_raw, layers_downloaded) =
            tokio::try_join!(config, layers).map_err(|e| {
                if cancel.is_cancelled() {
                    PullError::Cancelled
                } else {
                    e
                }
            })?;

        let record = normalize_current(reference, &manifest, config_raw, manifest_digest)?;
        Ok(PullOutcome {
            record,
            layers_downloaded,
        })
    }

    async fn fetch_config(
        &self,
        descriptor: &Descriptor,
        scope: &CancellationToken,
    ) -> Result<Bytes, PullError> {
        let config = cancellable(scope, self.ctx.client.get_blob(&descriptor.digest)).await?;
        debug!(digest = %descriptor.digest, size = config.len(), "config fetched");
        Ok(config)
    }

    async fn fetch_layers(
        &self,
        layers: &[Descriptor],
        scope: &CancellationToken,
    ) -> Result<usize, PullError> {
        if self.ctx.mode == PullMode::MetadataOnly {
            return Ok(0);
        }

        let mut downloaded = 0;
        for layer in layers {
            if layer.media_type == MEDIA_TYPE_FOREIGN_LAYER {
                debug!(digest = %layer.digest, "skipping foreign layer");
                continue;
            }
            if self.fetch_layer(&layer.digest, Some(layer.size), scope).await? {
                downloaded += 1;
            }
        }
        Ok(downloaded)
    }

    /// Download one layer unless the store already has it. Returns whether
    /// anything was downloaded.
    async fn fetch_layer(
        &self,
        digest: &Digest,
        size: Option<u64>,
        scope: &CancellationToken,
    ) -> Result<bool, PullError> {
        let progress = &self.ctx.config.progress;
        let store = &self.ctx.config.store;
        let id = digest.short();

        if store.has_blob(digest).await? {
            progress.emit(ProgressEvent::blob(id, Phase::AlreadyExists));
            return Ok(false);
        }

        progress.emit(ProgressEvent::blob(id, Phase::Downloading).with_progress(0, size));
        let mut writer = store.begin_blob(digest).await?;
        let written =
            match cancellable(scope, self.ctx.client.download_blob(digest, writer.as_mut())).await {
                Ok(written) => written,
                Err(e) => {
                    writer.abort().await;
                    return Err(e);
                }
            };
        progress.emit(ProgressEvent::blob(id, Phase::Verifying).with_progress(written, size));
        writer.commit().await?;
        progress.emit(ProgressEvent::blob(id, Phase::Complete));
        Ok(true)
    }

    async fn pull_legacy(
        &self,
        reference: &Reference,
        mut manifest: LegacyManifest,
        manifest_digest: Digest,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, PullError> {
        manifest.fix_layers()?;

        let mut layers_downloaded = 0;
        if self.ctx.mode == PullMode::Full {
            for layer in manifest.layers_bottom_up() {
                if layer.image.throwaway {
                    continue;
                }
                if self.fetch_layer(&layer.digest, None, cancel).await? {
                    layers_downloaded += 1;
                }
                self.ctx
                    .config
                    .metadata
                    .set_v1_id(&self.ctx.registry, &layer.image.id, &layer.digest)
                    .await;
            }
        }

        let record = normalize_legacy(reference, &manifest, Some(manifest_digest))?;
        Ok(PullOutcome {
            record,
            layers_downloaded,
        })
    }
}

#[async_trait]
impl Puller for V2Puller {
    async fn pull(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, AttemptError> {
        let mut confirmed_v2 = false;
        match self.pull_inner(reference, cancel, &mut confirmed_v2).await {
            Ok(outcome) => Ok(outcome),
            Err(_) if cancel.is_cancelled() => Err(AttemptError::Fatal(PullError::Cancelled)),
            Err(e) => Err(AttemptError::classify(
                e,
                confirmed_v2,
                self.ctx.transport_ok(),
            )),
        }
    }
}

/// `latest` if the repository has it, else the first tag listed.
fn choose_tag(tags: &[String]) -> Option<&str> {
    tags.iter()
        .find(|t| t.as_str() == DEFAULT_TAG)
        .or_else(|| tags.first())
        .map(String::as_str)
}
