//! Platform descriptors and manifest-list selection.

use std::fmt;

use dray_digest::Digest;
use serde::{Deserialize, Serialize};

use crate::error::PullError;
use crate::manifest::ManifestList;

/// Operating system and CPU architecture, in registry (Go) spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            ..Default::default()
        }
    }

    /// The platform this process runs on.
    pub fn current() -> Self {
        Self::new(oci_os(std::env::consts::OS), oci_arch(std::env::consts::ARCH))
    }

    /// Parse `os/arch`.
    pub fn parse(s: &str) -> Option<Self> {
        let (os, arch) = s.split_once('/')?;
        if os.is_empty() || arch.is_empty() || arch.contains('/') {
            return None;
        }
        Some(Self::new(os, arch))
    }

    /// Exact match on OS and architecture. Variant and features are not
    /// consulted.
    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os && self.architecture == other.architecture
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

fn oci_os(os: &'static str) -> &'static str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn oci_arch(arch: &'static str) -> &'static str {
    match arch {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        other => other,
    }
}

/// Pick the first list entry whose platform matches `local` exactly.
///
/// There is no best-effort fallback: no match is an error.
pub fn select_manifest(list: &ManifestList, local: &Platform) -> Result<Digest, PullError> {
    list.manifests
        .iter()
        .find(|entry| entry.platform.matches(local))
        .map(|entry| entry.digest.clone())
        .ok_or_else(|| PullError::NoMatchingPlatform(local.to_string()))
}
