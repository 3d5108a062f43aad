//! Schema normalization: every accepted manifest variant becomes an
//! [`ImageRecord`] with the same shape.

use bytes::Bytes;
use dray_digest::Digest;
use dray_reference::Reference;

use crate::error::PullError;
use crate::image::{HistoryEntry, ImageConfig, ImageRecord, LayerRef};
use crate::manifest::{CurrentManifest, LegacyLayer, LegacyManifest, MEDIA_TYPE_LAYER};

/// Keys of a v1 image JSON that describe the layer rather than the image.
const V1_ONLY_KEYS: [&str; 6] = ["id", "parent", "Size", "parent_id", "layer_id", "throwaway"];

/// Combine a current-schema manifest with its separately fetched config.
///
/// Layer order is the manifest's order. The config's `rootfs.diff_ids`, when
/// present, must have one entry per manifest layer.
pub fn normalize_current(
    reference: &Reference,
    manifest: &CurrentManifest,
    config_raw: Bytes,
    manifest_digest: Digest,
) -> Result<ImageRecord, PullError> {
    let config: ImageConfig = serde_json::from_slice(&config_raw)
        .map_err(|e| PullError::InvalidConfig(e.to_string()))?;

    if let Some(rootfs) = &config.rootfs {
        if rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(PullError::InvalidConfig(format!(
                "config has {} diff IDs but manifest has {} layers",
                rootfs.diff_ids.len(),
                manifest.layers.len()
            )));
        }
    }

    let layers = manifest
        .layers
        .iter()
        .map(|d| LayerRef {
            digest: d.digest.clone(),
            size: Some(d.size),
            media_type: d.media_type.clone(),
        })
        .collect();

    Ok(ImageRecord {
        reference: reference.clone(),
        id: Digest::sha256(&config_raw),
        history: config.history.clone(),
        config,
        config_raw,
        layers,
        manifest_digest: Some(manifest_digest),
    })
}

/// Normalize a legacy manifest whose layer chain has already been fixed up.
pub fn normalize_legacy(
    reference: &Reference,
    manifest: &LegacyManifest,
    manifest_digest: Option<Digest>,
) -> Result<ImageRecord, PullError> {
    from_legacy_layers(reference, &manifest.layers_bottom_up(), manifest_digest)
}

/// Build a record from legacy layers ordered base first.
///
/// History has one entry per layer, oldest first. Throwaway layers are kept
/// in history but not in the layer list. The config is the topmost layer's
/// v1 JSON with its layer-specific keys removed and the history added.
pub(crate) fn from_legacy_layers(
    reference: &Reference,
    layers: &[LegacyLayer],
    manifest_digest: Option<Digest>,
) -> Result<ImageRecord, PullError> {
    let top = layers
        .last()
        .ok_or_else(|| PullError::MalformedManifest("image has no layers".to_string()))?;

    let history: Vec<HistoryEntry> = layers.iter().map(|l| l.image.history_entry()).collect();

    let mut doc: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&top.v1_compatibility)
            .map_err(|e| PullError::InvalidConfig(e.to_string()))?;
    for key in V1_ONLY_KEYS {
        doc.remove(key);
    }
    let history_value =
        serde_json::to_value(&history).map_err(|e| PullError::InvalidConfig(e.to_string()))?;
    doc.insert("history".to_string(), history_value);

    let config_raw = Bytes::from(
        serde_json::to_vec(&doc).map_err(|e| PullError::InvalidConfig(e.to_string()))?,
    );
    let config: ImageConfig = serde_json::from_slice(&config_raw)
        .map_err(|e| PullError::InvalidConfig(e.to_string()))?;

    let layers = layers
        .iter()
        .filter(|l| !l.image.throwaway)
        .map(|l| LayerRef {
            digest: l.digest.clone(),
            size: None,
            media_type: MEDIA_TYPE_LAYER.to_string(),
        })
        .collect();

    Ok(ImageRecord {
        reference: reference.clone(),
        id: Digest::sha256(&config_raw),
        config,
        config_raw,
        layers,
        history,
        manifest_digest,
    })
}
