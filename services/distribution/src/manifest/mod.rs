//! Manifest decoding.
//!
//! A registry can answer a manifest request with one of three encodings:
//!
//! | Variant | Media type |
//! |---|---|
//! | [`Manifest::Legacy`] | `application/vnd.docker.distribution.manifest.v1+json` (or `+prettyjws`) |
//! | [`Manifest::Current`] | `application/vnd.docker.distribution.manifest.v2+json` |
//! | [`Manifest::List`] | `application/vnd.docker.distribution.manifest.list.v2+json` |
//!
//! The media type comes from the response `Content-Type`. When that header
//! is missing or generic, the document's own `mediaType`/`schemaVersion`
//! fields decide. Anything else is rejected.

mod current;
mod legacy;
mod list;

use bytes::Bytes;
use dray_digest::{verify_bytes, Algorithm, Digest};
use serde::Deserialize;

use crate::error::PullError;

pub use current::{CurrentManifest, Descriptor};
pub use legacy::{LegacyLayer, LegacyManifest, V1Image};
pub(crate) use legacy::validate_v1_id;
pub use list::{ManifestList, PlatformManifest};

pub const MEDIA_TYPE_LEGACY: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_LEGACY_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_FOREIGN_LAYER: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
pub const MEDIA_TYPE_LEGACY_LAYER: &str = "application/vnd.docker.container.image.rootfs.diff+x-gtar";

/// `Accept` header value for manifest requests.
pub fn accept_header() -> String {
    [
        MEDIA_TYPE_MANIFEST_LIST,
        MEDIA_TYPE_MANIFEST,
        MEDIA_TYPE_LEGACY_SIGNED,
        MEDIA_TYPE_LEGACY,
    ]
    .join(", ")
}

/// The three manifest encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Legacy,
    Current,
    List,
}

impl MediaType {
    /// Recognise a media type string, ignoring parameters such as `charset`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        match essence {
            MEDIA_TYPE_LEGACY | MEDIA_TYPE_LEGACY_SIGNED => Some(MediaType::Legacy),
            MEDIA_TYPE_MANIFEST => Some(MediaType::Current),
            MEDIA_TYPE_MANIFEST_LIST => Some(MediaType::List),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Legacy => MEDIA_TYPE_LEGACY_SIGNED,
            MediaType::Current => MEDIA_TYPE_MANIFEST,
            MediaType::List => MEDIA_TYPE_MANIFEST_LIST,
        }
    }
}

/// A decoded manifest.
#[derive(Debug, Clone)]
pub enum Manifest {
    Legacy(LegacyManifest),
    Current(CurrentManifest),
    List(ManifestList),
}

impl Manifest {
    pub fn media_type(&self) -> MediaType {
        match self {
            Manifest::Legacy(_) => MediaType::Legacy,
            Manifest::Current(_) => MediaType::Current,
            Manifest::List(_) => MediaType::List,
        }
    }
}

/// Raw manifest bytes as they came off the wire.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// `Docker-Content-Digest` response header, when present and valid.
    pub content_digest: Option<Digest>,
}

/// A decoded manifest labelled with the digest of the bytes it came from.
#[derive(Debug, Clone)]
pub struct VerifiedManifest {
    pub manifest: Manifest,
    pub digest: Digest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(default)]
    media_type: Option<String>,
}

/// Determine the encoding of `body`.
pub fn detect_media_type(body: &[u8], content_type: Option<&str>) -> Result<MediaType, PullError> {
    if let Some(media_type) = content_type.and_then(MediaType::from_content_type) {
        return Ok(media_type);
    }

    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| PullError::MalformedManifest(format!("not a JSON document: {}", e)))?;

    if let Some(media_type) = envelope.media_type.as_deref() {
        return MediaType::from_content_type(media_type)
            .ok_or_else(|| PullError::UnsupportedMediaType(media_type.to_string()));
    }
    if envelope.schema_version == Some(1) {
        return Ok(MediaType::Legacy);
    }

    Err(PullError::UnsupportedMediaType(
        content_type.unwrap_or("unknown").to_string(),
    ))
}

/// Decode `body` into one of the three variants.
pub fn decode(body: Bytes, content_type: Option<&str>) -> Result<Manifest, PullError> {
    match detect_media_type(&body, content_type)? {
        MediaType::Legacy => LegacyManifest::parse(body).map(Manifest::Legacy),
        MediaType::Current => CurrentManifest::parse(body).map(Manifest::Current),
        MediaType::List => ManifestList::parse(&body).map(Manifest::List),
    }
}

/// Decode a fetched manifest and check it against the digest it was
/// requested by and the digest the registry claims for it.
///
/// Legacy manifests are digested over their canonical (signature-free)
/// payload; the other variants over the raw bytes. Without an expected
/// digest the result is labelled with the canonical-algorithm digest.
pub fn decode_verified(
    fetched: FetchedManifest,
    requested: Option<&Digest>,
) -> Result<VerifiedManifest, PullError> {
    let manifest = decode(fetched.body.clone(), fetched.content_type.as_deref())?;

    let canonical: &[u8] = match &manifest {
        Manifest::Legacy(legacy) => legacy.canonical(),
        Manifest::Current(_) | Manifest::List(_) => &fetched.body,
    };

    for expected in requested.into_iter().chain(fetched.content_digest.as_ref()) {
        verify_bytes(expected, canonical)
            .map_err(|e| PullError::verification(format!("manifest {}", expected), e))?;
    }

    let digest = match requested {
        Some(expected) => expected.clone(),
        None => Digest::from_bytes(Algorithm::CANONICAL, canonical),
    };

    Ok(VerifiedManifest { manifest, digest })
}
