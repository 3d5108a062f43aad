//! Legacy single-platform manifest (schema 1).
//!
//! Layers are listed newest first, each paired with an embedded v1 image
//! JSON ("v1Compatibility") that carries the layer's ID, its parent's ID and
//! the config as of that layer. Signed manifests wrap the document in a JWS;
//! the digest covers the payload with the signatures cut out.

use std::collections::HashSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dray_digest::Digest;
use serde::Deserialize;

use crate::error::PullError;
use crate::image::{ContainerConfig, HistoryEntry};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Body {
    schema_version: u32,
    #[serde(default)]
    name: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
    #[serde(default)]
    history: Vec<V1Compatibility>,
    #[serde(default)]
    signatures: Vec<Signature>,
}

#[derive(Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: Digest,
}

#[derive(Deserialize)]
struct V1Compatibility {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Deserialize)]
struct Signature {
    protected: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
}

/// The subset of an embedded v1 image JSON the pull needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct V1Image {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub container_config: Option<ContainerConfig>,
    /// Empty layer kept only to preserve the ID chain.
    #[serde(default)]
    pub throwaway: bool,
}

impl V1Image {
    /// History entry describing the build step that produced this layer.
    pub fn history_entry(&self) -> HistoryEntry {
        let created_by = self
            .container_config
            .as_ref()
            .and_then(|c| c.cmd.as_ref())
            .map(|cmd| cmd.join(" "));
        HistoryEntry {
            created: self.created,
            author: non_empty(&self.author),
            created_by,
            comment: non_empty(&self.comment),
            empty_layer: self.throwaway,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// One layer of a legacy manifest, in bottom-to-top order.
#[derive(Debug, Clone)]
pub struct LegacyLayer {
    pub digest: Digest,
    pub image: V1Image,
    /// The embedded JSON exactly as it appeared in the manifest.
    pub v1_compatibility: String,
}

/// Decoded legacy manifest.
#[derive(Debug, Clone)]
pub struct LegacyManifest {
    pub name: String,
    pub tag: String,
    pub architecture: String,
    /// Blob digests, newest first.
    pub fs_layers: Vec<Digest>,
    /// Raw v1Compatibility documents, newest first.
    pub history: Vec<String>,
    images: Vec<V1Image>,
    canonical: Bytes,
}

impl LegacyManifest {
    pub(crate) fn parse(raw: Bytes) -> Result<Self, PullError> {
        let body: Body =
            serde_json::from_slice(&raw).map_err(|e| PullError::MalformedManifest(e.to_string()))?;

        if body.schema_version != 1 {
            return Err(PullError::MalformedManifest(format!(
                "unexpected schemaVersion {} for legacy manifest",
                body.schema_version
            )));
        }
        if body.fs_layers.is_empty() {
            return Err(PullError::MalformedManifest(
                "no FSLayers in manifest".to_string(),
            ));
        }
        if body.fs_layers.len() != body.history.len() {
            return Err(PullError::MalformedManifest(format!(
                "length of history not equal to number of layers ({} != {})",
                body.history.len(),
                body.fs_layers.len()
            )));
        }

        let history: Vec<String> = body
            .history
            .into_iter()
            .map(|h| h.v1_compatibility)
            .collect();
        let images = history
            .iter()
            .map(|h| {
                serde_json::from_str::<V1Image>(h).map_err(|e| {
                    PullError::MalformedManifest(format!("invalid v1Compatibility entry: {}", e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let canonical = canonical_payload(&raw, &body.signatures)?;

        Ok(Self {
            name: body.name,
            tag: body.tag,
            architecture: body.architecture,
            fs_layers: body.fs_layers.into_iter().map(|l| l.blob_sum).collect(),
            history,
            images,
            canonical,
        })
    }

    /// The signature-free bytes the manifest digest is computed over.
    pub fn canonical(&self) -> &[u8] {
        &self.canonical
    }

    /// Remove adjacent duplicate layers and check the parent chain.
    ///
    /// Every layer's declared parent must be the ID of the layer below it,
    /// and the bottom layer must have no parent. An ID repeated anywhere
    /// other than directly adjacent is rejected.
    pub fn fix_layers(&mut self) -> Result<(), PullError> {
        for image in &self.images {
            validate_v1_id(&image.id)?;
        }

        if let Some(base) = self.images.last() {
            if !base.parent.is_empty() {
                return Err(PullError::InvalidLayerChain(
                    "invalid parent ID in the base layer of the image".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        let mut last_id: Option<&str> = None;
        for image in &self.images {
            if last_id != Some(image.id.as_str()) && seen.contains(image.id.as_str()) {
                return Err(PullError::InvalidLayerChain(format!(
                    "ID {} appears multiple times in manifest",
                    image.id
                )));
            }
            last_id = Some(image.id.as_str());
            seen.insert(image.id.as_str());
        }

        // Walk downwards so removals don't shift the indexes still to visit.
        for i in (0..self.images.len().saturating_sub(1)).rev() {
            if self.images[i].id == self.images[i + 1].id {
                self.images.remove(i);
                self.fs_layers.remove(i);
                self.history.remove(i);
            } else if self.images[i].parent != self.images[i + 1].id {
                return Err(PullError::InvalidLayerChain(format!(
                    "invalid parent ID: expected {}, got {}",
                    self.images[i + 1].id,
                    self.images[i].parent
                )));
            }
        }

        Ok(())
    }

    /// Layers from the base upwards.
    pub fn layers_bottom_up(&self) -> Vec<LegacyLayer> {
        self.fs_layers
            .iter()
            .zip(&self.images)
            .zip(&self.history)
            .rev()
            .map(|((digest, image), raw)| LegacyLayer {
                digest: digest.clone(),
                image: image.clone(),
                v1_compatibility: raw.clone(),
            })
            .collect()
    }
}

pub(crate) fn validate_v1_id(id: &str) -> Result<(), PullError> {
    let valid = id.len() == 64
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(())
    } else {
        Err(PullError::InvalidLayerChain(format!(
            "image ID '{}' is invalid",
            id
        )))
    }
}

fn decode_base64url(s: &str) -> Result<Vec<u8>, PullError> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| PullError::MalformedManifest(format!("invalid signature encoding: {}", e)))
}

fn canonical_payload(raw: &Bytes, signatures: &[Signature]) -> Result<Bytes, PullError> {
    let Some(signature) = signatures.first() else {
        return Ok(raw.clone());
    };

    let header: ProtectedHeader = serde_json::from_slice(&decode_base64url(&signature.protected)?)
        .map_err(|e| PullError::MalformedManifest(format!("invalid protected header: {}", e)))?;
    if header.format_length > raw.len() {
        return Err(PullError::MalformedManifest(format!(
            "signature formatLength {} exceeds manifest length {}",
            header.format_length,
            raw.len()
        )));
    }

    let tail = decode_base64url(&header.format_tail)?;
    let mut payload = Vec::with_capacity(header.format_length + tail.len());
    payload.extend_from_slice(&raw[..header.format_length]);
    payload.extend_from_slice(&tail);
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> String {
        format!("{:064x}", n)
    }

    fn v1(id: &str, parent: &str, throwaway: bool) -> String {
        let mut doc = serde_json::json!({
            "id": id,
            "created": "2016-09-23T23:20:46.131243165Z",
            "container_config": {"Cmd": ["/bin/sh", "-c", format!("#(nop) step {}", &id[60..])]},
        });
        if !parent.is_empty() {
            doc["parent"] = parent.into();
        }
        if throwaway {
            doc["throwaway"] = true.into();
        }
        doc.to_string()
    }

    /// `entries` is newest first: (id, parent, blob content, throwaway).
    fn manifest(entries: &[(String, String, &str, bool)]) -> Bytes {
        let doc = serde_json::json!({
            "schemaVersion": 1,
            "name": "library/busybox",
            "tag": "latest",
            "architecture": "amd64",
            "fsLayers": entries.iter().map(|(_, _, blob, _)| {
                serde_json::json!({"blobSum": Digest::sha256(blob.as_bytes())})
            }).collect::<Vec<_>>(),
            "history": entries.iter().map(|(id, parent, _, throwaway)| {
                serde_json::json!({"v1Compatibility": v1(id, parent, *throwaway)})
            }).collect::<Vec<_>>(),
        });
        Bytes::from(serde_json::to_vec_pretty(&doc).unwrap())
    }

    #[test]
    fn test_parse_and_order() {
        let raw = manifest(&[
            (id(2), id(1), "top", false),
            (id(1), String::new(), "base", false),
        ]);
        let mut parsed = LegacyManifest::parse(raw.clone()).unwrap();
        parsed.fix_layers().unwrap();

        let layers = parsed.layers_bottom_up();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].digest, Digest::sha256(b"base"));
        assert_eq!(layers[1].digest, Digest::sha256(b"top"));
        assert_eq!(parsed.canonical(), raw.as_ref());
    }

    #[test]
    fn test_adjacent_duplicate_removed() {
        let raw = manifest(&[
            (id(3), id(2), "top", false),
            (id(2), id(1), "", true),
            (id(2), id(1), "", true),
            (id(1), String::new(), "base", false),
        ]);
        let mut parsed = LegacyManifest::parse(raw).unwrap();
        parsed.fix_layers().unwrap();

        assert_eq!(parsed.fs_layers.len(), 3);
        assert_eq!(parsed.history.len(), 3);
        let ids: Vec<_> = parsed.layers_bottom_up().into_iter().map(|l| l.image.id).collect();
        assert_eq!(ids, vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn test_broken_parent_chain() {
        let raw = manifest(&[
            (id(3), id(9), "top", false),
            (id(1), String::new(), "base", false),
        ]);
        let mut parsed = LegacyManifest::parse(raw).unwrap();
        let err = parsed.fix_layers().unwrap_err();
        assert!(matches!(err, PullError::InvalidLayerChain(ref m) if m.contains("invalid parent ID")));
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn test_base_layer_with_parent() {
        let raw = manifest(&[(id(2), id(1), "only", false)]);
        let mut parsed = LegacyManifest::parse(raw).unwrap();
        assert!(parsed.fix_layers().is_err());
    }

    #[test]
    fn test_non_adjacent_duplicate() {
        let raw = manifest(&[
            (id(1), id(2), "a", false),
            (id(2), id(1), "b", false),
            (id(1), String::new(), "c", false),
        ]);
        let mut parsed = LegacyManifest::parse(raw).unwrap();
        let err = parsed.fix_layers().unwrap_err();
        assert!(matches!(err, PullError::InvalidLayerChain(ref m) if m.contains("multiple times")));
    }

    #[test]
    fn test_invalid_v1_id() {
        let raw = manifest(&[("not-an-id".to_string(), String::new(), "a", false)]);
        let mut parsed = LegacyManifest::parse(raw).unwrap();
        assert!(parsed.fix_layers().is_err());
    }

    #[test]
    fn test_validate_v1_id() {
        assert!(validate_v1_id(&id(1)).is_ok());
        assert!(validate_v1_id(&id(0xab).to_uppercase()).is_err());
        assert!(validate_v1_id(&id(1)[..63]).is_err());
        // Multi-byte characters padding the ID out to 64 bytes.
        let padded = format!("{}{}", "\u{20ac}".repeat(21), "a");
        assert_eq!(padded.len(), 64);
        assert!(validate_v1_id(&padded).is_err());
    }

    #[test]
    fn test_structural_checks() {
        let mismatched = serde_json::json!({
            "schemaVersion": 1,
            "fsLayers": [{"blobSum": Digest::sha256(b"a")}],
            "history": [],
        });
        let err = LegacyManifest::parse(Bytes::from(mismatched.to_string())).unwrap_err();
        assert!(matches!(err, PullError::MalformedManifest(_)));

        let empty = serde_json::json!({"schemaVersion": 1, "fsLayers": [], "history": []});
        assert!(LegacyManifest::parse(Bytes::from(empty.to_string())).is_err());
    }

    #[test]
    fn test_signed_manifest_canonical_payload() {
        let payload = manifest(&[(id(1), String::new(), "base", false)]);
        // A JWS-signed manifest: the payload's closing brace is replaced by
        // a signatures block, and the header records how to undo that.
        let body = &payload[..payload.len() - 2];
        let tail = &payload[payload.len() - 2..];
        let header = serde_json::json!({
            "formatLength": body.len(),
            "formatTail": URL_SAFE_NO_PAD.encode(tail),
        });
        let protected = URL_SAFE_NO_PAD.encode(header.to_string());
        let mut signed = body.to_vec();
        signed.extend_from_slice(
            format!(
                ",\n   \"signatures\": [{{\"header\": {{}}, \"signature\": \"sig\", \"protected\": \"{}\"}}]\n}}",
                protected
            )
            .as_bytes(),
        );

        let parsed = LegacyManifest::parse(Bytes::from(signed)).unwrap();
        assert_eq!(parsed.canonical(), payload.as_ref());
    }

    #[test]
    fn test_history_entry_from_v1() {
        let image: V1Image = serde_json::from_str(&v1(&id(7), "", true)).unwrap();
        let entry = image.history_entry();
        assert!(entry.empty_layer);
        assert_eq!(entry.created_by.as_deref(), Some("/bin/sh -c #(nop) step 0007"));
        assert!(entry.author.is_none());
    }
}
