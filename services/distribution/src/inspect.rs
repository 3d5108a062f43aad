//! Remote image inspection.

use chrono::{DateTime, Utc};
use dray_digest::Digest;
use serde::Serialize;

use crate::image::{ContainerConfig, ImageRecord};

/// What a registry says about an image, fetched without its layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteImageInspect {
    /// Local image ID the image would get once pulled.
    pub id: Digest,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
    /// Layer digests, bottom-most first.
    pub layers: Vec<Digest>,
    /// Compressed size of the layers whose size the manifest declares.
    pub size: u64,
    pub registry: String,
}

impl RemoteImageInspect {
    pub fn new(record: &ImageRecord, registry: &str) -> Self {
        let name = record.reference.familiar_name();
        let repo_tags = record
            .reference
            .tag()
            .map(|tag| vec![format!("{}:{}", name, tag)])
            .unwrap_or_default();
        let repo_digests = record
            .manifest_digest
            .iter()
            .map(|digest| format!("{}@{}", name, digest))
            .collect();

        Self {
            id: record.id.clone(),
            repo_tags,
            repo_digests,
            created: record.config.created,
            author: record.config.author.clone(),
            comment: record.config.comment.clone(),
            docker_version: record.config.docker_version.clone(),
            architecture: record.config.architecture.clone(),
            os: record.config.os.clone(),
            config: record.config.config.clone(),
            layers: record.layers.iter().map(|l| l.digest.clone()).collect(),
            size: record.layer_size(),
            registry: registry.to_string(),
        }
    }
}
