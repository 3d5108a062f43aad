//! Multi-platform manifest list.

use dray_digest::Digest;
use serde::{Deserialize, Serialize};

use crate::error::PullError;
use crate::platform::Platform;

/// One per-platform entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    pub platform: Platform,
}

/// Manifest list: per-platform manifest digests, no blobs of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<PlatformManifest>,
}

impl ManifestList {
    pub(crate) fn parse(body: &[u8]) -> Result<Self, PullError> {
        let list: ManifestList = serde_json::from_slice(body)
            .map_err(|e| PullError::MalformedManifest(e.to_string()))?;
        if list.schema_version != 2 {
            return Err(PullError::MalformedManifest(format!(
                "unexpected schemaVersion {} for manifest list",
                list.schema_version
            )));
        }
        Ok(list)
    }
}
