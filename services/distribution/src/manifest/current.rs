//! Single-platform manifest: one config blob plus ordered layer blobs.

use bytes::Bytes;
use dray_digest::Digest;
use serde::{Deserialize, Serialize};

use crate::error::PullError;

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Alternate download locations for foreign layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

/// Single-platform manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentManifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, bottom-most first.
    pub layers: Vec<Descriptor>,
}

impl CurrentManifest {
    pub(crate) fn parse(body: Bytes) -> Result<Self, PullError> {
        let manifest: CurrentManifest = serde_json::from_slice(&body)
            .map_err(|e| PullError::MalformedManifest(e.to_string()))?;
        if manifest.schema_version != 2 {
            return Err(PullError::MalformedManifest(format!(
                "unexpected schemaVersion {} for image manifest",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}
