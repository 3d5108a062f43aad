//! Registry content builders.
//!
//! Everything here produces real bytes with real digests, so tests exercise
//! the same verification paths as a pull from a live registry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dray_digest::Digest;
use serde_json::json;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_LEGACY_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Content plus its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: Digest,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            digest: Digest::sha256(&data),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A single-platform image: config, layers and the manifest tying them
/// together.
#[derive(Debug, Clone)]
pub struct ImageFixture {
    pub os: String,
    pub architecture: String,
    pub config: Blob,
    pub layers: Vec<Blob>,
    pub manifest: Blob,
}

impl ImageFixture {
    /// Build an image whose layers have the given contents, bottom first.
    pub fn new(os: &str, architecture: &str, layers: &[&str]) -> Self {
        let layers: Vec<Blob> = layers.iter().map(|l| Blob::new(l.as_bytes())).collect();

        let diff_ids: Vec<String> = layers.iter().map(|l| l.digest.to_string()).collect();
        let history: Vec<_> = (0..layers.len())
            .map(|i| json!({"created_by": format!("/bin/sh -c #(nop) ADD layer{}", i)}))
            .collect();
        let config = json!({
            "architecture": architecture,
            "os": os,
            "created": "2024-03-01T12:00:00Z",
            "author": "fixtures",
            "config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin:/bin"],
                "Cmd": ["/bin/sh"]
            },
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
            "history": history,
        });
        let config = Blob::new(serde_json::to_vec(&config).unwrap_or_default());
        let manifest = current_manifest(&config, &layers);

        Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            config,
            layers,
            manifest,
        }
    }
}

/// Schema 2 manifest bytes for a config and its layers.
pub fn current_manifest(config: &Blob, layers: &[Blob]) -> Blob {
    let layers: Vec<_> = layers
        .iter()
        .map(|l| {
            json!({
                "mediaType": MEDIA_TYPE_LAYER,
                "size": l.size(),
                "digest": l.digest.to_string(),
            })
        })
        .collect();
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_MANIFEST,
        "config": {
            "mediaType": MEDIA_TYPE_IMAGE_CONFIG,
            "size": config.size(),
            "digest": config.digest.to_string(),
        },
        "layers": layers,
    });
    Blob::new(serde_json::to_vec_pretty(&manifest).unwrap_or_default())
}

/// Manifest list over the given images, in order.
pub fn manifest_list(images: &[&ImageFixture]) -> Blob {
    let manifests: Vec<_> = images
        .iter()
        .map(|image| {
            json!({
                "mediaType": MEDIA_TYPE_MANIFEST,
                "size": image.manifest.size(),
                "digest": image.manifest.digest.to_string(),
                "platform": {"architecture": image.architecture, "os": image.os},
            })
        })
        .collect();
    let list = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_MANIFEST_LIST,
        "manifests": manifests,
    });
    Blob::new(serde_json::to_vec_pretty(&list).unwrap_or_default())
}

// =============================================================================
// Legacy content
// =============================================================================

/// A 64-hex v1 image ID derived from `n`.
pub fn v1_id(n: u8) -> String {
    hex::encode([n; 32])
}

/// One legacy layer: v1 image JSON plus the layer blob.
#[derive(Debug, Clone)]
pub struct LegacyLayerFixture {
    pub id: String,
    pub parent: Option<String>,
    pub json: String,
    pub blob: Blob,
}

impl LegacyLayerFixture {
    pub fn new(id: &str, parent: Option<&str>, command: &str, content: &[u8]) -> Self {
        Self::build(id, parent, command, content, false)
    }

    /// A metadata-only layer.
    pub fn throwaway(id: &str, parent: Option<&str>, command: &str) -> Self {
        Self::build(id, parent, command, b"", true)
    }

    fn build(id: &str, parent: Option<&str>, command: &str, content: &[u8], throwaway: bool) -> Self {
        let mut doc = json!({
            "id": id,
            "created": "2016-05-04T10:00:00Z",
            "container_config": {"Cmd": ["/bin/sh", "-c", command]},
            "architecture": "amd64",
            "os": "linux",
        });
        if let Some(parent) = parent {
            doc["parent"] = json!(parent);
        }
        if throwaway {
            doc["throwaway"] = json!(true);
        }
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            json: doc.to_string(),
            blob: Blob::new(content),
        }
    }
}

/// A linear chain of legacy layers, base first, with IDs `v1_id(1..)`.
pub fn legacy_chain(contents: &[&str]) -> Vec<LegacyLayerFixture> {
    let mut layers: Vec<LegacyLayerFixture> = Vec::with_capacity(contents.len());
    for (i, content) in contents.iter().enumerate() {
        let id = v1_id(i as u8 + 1);
        let parent = layers.last().map(|l| l.id.clone());
        layers.push(LegacyLayerFixture::new(
            &id,
            parent.as_deref(),
            &format!("step {}", i),
            content.as_bytes(),
        ));
    }
    layers
}

/// Unsigned schema 1 manifest. `layers` is base first; the manifest lists
/// them newest first.
pub fn legacy_manifest(name: &str, tag: &str, layers: &[LegacyLayerFixture]) -> Blob {
    let fs_layers: Vec<_> = layers
        .iter()
        .rev()
        .map(|l| json!({"blobSum": l.blob.digest.to_string()}))
        .collect();
    let history: Vec<_> = layers
        .iter()
        .rev()
        .map(|l| json!({"v1Compatibility": l.json}))
        .collect();
    let manifest = json!({
        "schemaVersion": 1,
        "name": name,
        "tag": tag,
        "architecture": "amd64",
        "fsLayers": fs_layers,
        "history": history,
    });
    Blob::new(serde_json::to_vec_pretty(&manifest).unwrap_or_default())
}

/// Wrap an unsigned legacy manifest in a JWS signature block.
///
/// The returned bytes differ from `payload`, but the manifest digest is
/// still `Digest::sha256(payload)`.
pub fn sign_legacy(payload: &[u8]) -> Vec<u8> {
    let split = payload.len().saturating_sub(2);
    let (body, tail) = payload.split_at(split);
    let header = json!({
        "formatLength": body.len(),
        "formatTail": URL_SAFE_NO_PAD.encode(tail),
    });
    let protected = URL_SAFE_NO_PAD.encode(header.to_string());

    let mut signed = body.to_vec();
    signed.extend_from_slice(
        format!(
            ",\n   \"signatures\": [{{\"header\": {{\"alg\": \"ES256\"}}, \"signature\": \"c2ln\", \"protected\": \"{}\"}}]\n}}",
            protected
        )
        .as_bytes(),
    );
    signed
}
