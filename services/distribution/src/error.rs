//! Error taxonomy for the pull pipeline.
//!
//! Three layers:
//!
//! - [`PullError`]: what went wrong inside one endpoint attempt.
//! - [`AttemptError`]: how a puller hands that failure to the orchestrator,
//!   either as a [`FallbackError`] (try the next endpoint) or as fatal.
//! - [`ImagePullError`]: the stable classification returned to callers of
//!   [`crate::pull`] and [`crate::inspect`]. Internal variants never cross
//!   this boundary.

use dray_digest::DigestError;
use dray_reference::{Reference, ReferenceError};
use serde::Deserialize;
use thiserror::Error;

use crate::store::StoreError;

// =============================================================================
// Registry error codes
// =============================================================================

/// Error code from a registry's JSON error body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryErrorCode {
    Unauthorized,
    Denied,
    ManifestUnknown,
    NameUnknown,
    BlobUnknown,
    TagInvalid,
    Unsupported,
    TooManyRequests,
    Unknown(String),
}

impl RegistryErrorCode {
    fn from_code(code: &str) -> Self {
        match code {
            "UNAUTHORIZED" => Self::Unauthorized,
            "DENIED" => Self::Denied,
            "MANIFEST_UNKNOWN" => Self::ManifestUnknown,
            "NAME_UNKNOWN" => Self::NameUnknown,
            "BLOB_UNKNOWN" => Self::BlobUnknown,
            "TAG_INVALID" => Self::TagInvalid,
            "UNSUPPORTED" => Self::Unsupported,
            "TOOMANYREQUESTS" => Self::TooManyRequests,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Best guess at the code when the body carried none.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Denied,
            404 => Self::NameUnknown,
            405 | 501 => Self::Unsupported,
            429 => Self::TooManyRequests,
            other => Self::Unknown(format!("HTTP {}", other)),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Deserialize)]
struct ErrorEntry {
    code: String,
    #[serde(default)]
    message: String,
}

/// Decode the first entry of a registry error body, if there is one.
pub(crate) fn parse_error_body(body: &[u8]) -> Option<(RegistryErrorCode, String)> {
    let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
    parsed
        .errors
        .into_iter()
        .next()
        .map(|e| (RegistryErrorCode::from_code(&e.code), e.message))
}

// =============================================================================
// PullError
// =============================================================================

/// Failure inside a single endpoint attempt.
#[derive(Debug, Error)]
pub enum PullError {
    /// The endpoint does not implement the requested operation.
    #[error("{0}")]
    NoSupport(String),

    /// Connection, TLS or protocol failure below HTTP status level.
    #[error("error contacting {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The registry answered with an error status.
    #[error("registry returned {status} for {url}: {message}")]
    Registry {
        url: String,
        status: u16,
        code: RegistryErrorCode,
        message: String,
    },

    /// The repository has no tags to choose from.
    #[error("no tags available for remote repository {0}")]
    NoTags(String),

    /// Content did not hash to its digest, or outgrew its size limit.
    #[error("{subject} verification failed: {source}")]
    Verification {
        subject: String,
        #[source]
        source: DigestError,
    },

    /// The manifest could not be parsed or failed structural checks.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// The manifest's media type is not one of the three we understand.
    #[error("unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    /// A manifest list has no entry for the local platform.
    #[error("no matching manifest for {0} in the manifest list entries")]
    NoMatchingPlatform(String),

    /// A manifest list pointed at another manifest list.
    #[error("manifest list entry {0} is itself a manifest list")]
    NestedManifestList(String),

    /// The image config could not be parsed or contradicts the manifest.
    #[error("invalid image config: {0}")]
    InvalidConfig(String),

    /// The legacy layer chain is inconsistent.
    #[error("invalid layer chain: {0}")]
    InvalidLayerChain(String),

    /// The caller or a sibling task cancelled the pull.
    #[error("pull cancelled")]
    Cancelled,

    #[error("invalid reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// The endpoint resolver could not produce endpoints.
    #[error("endpoint lookup failed: {0}")]
    Resolve(String),
}

impl PullError {
    pub(crate) fn verification(subject: impl Into<String>, source: DigestError) -> Self {
        Self::Verification {
            subject: subject.into(),
            source,
        }
    }

    /// Returns true for capability-mismatch failures.
    pub fn is_no_support(&self) -> bool {
        match self {
            PullError::NoSupport(_) => true,
            PullError::Registry { code, .. } => *code == RegistryErrorCode::Unsupported,
            _ => false,
        }
    }

    /// Returns true for failures that mean the content cannot be trusted
    /// or understood. These are never retried elsewhere.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            PullError::Verification { .. }
                | PullError::MalformedManifest(_)
                | PullError::UnsupportedMediaType(_)
                | PullError::NoMatchingPlatform(_)
                | PullError::NestedManifestList(_)
                | PullError::InvalidConfig(_)
                | PullError::InvalidLayerChain(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PullError::Cancelled)
    }

    /// Returns true if another endpoint might succeed where this one failed.
    pub fn continue_on_error(&self) -> bool {
        match self {
            PullError::NoSupport(_)
            | PullError::Transport { .. }
            | PullError::Registry { .. }
            | PullError::NoTags(_) => true,
            PullError::Verification { .. }
            | PullError::MalformedManifest(_)
            | PullError::UnsupportedMediaType(_)
            | PullError::NoMatchingPlatform(_)
            | PullError::NestedManifestList(_)
            | PullError::InvalidConfig(_)
            | PullError::InvalidLayerChain(_)
            | PullError::Cancelled
            | PullError::Reference(_)
            | PullError::Store(_)
            | PullError::Resolve(_) => false,
        }
    }

    /// The registry error code, if the failure came from a registry response.
    pub fn registry_code(&self) -> Option<&RegistryErrorCode> {
        match self {
            PullError::Registry { code, .. } => Some(code),
            _ => None,
        }
    }
}

// =============================================================================
// Fallback
// =============================================================================

/// A failure the orchestrator may retry on the next endpoint.
///
/// The flags carry what the attempt learned about the endpoint even though
/// it failed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FallbackError {
    pub error: PullError,
    /// The endpoint proved it speaks the manifest-based protocol.
    pub confirmed_v2: bool,
    /// The transport channel, including TLS, was established.
    pub transport_ok: bool,
}

/// How an endpoint attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Fallback(FallbackError),

    #[error(transparent)]
    Fatal(PullError),
}

impl AttemptError {
    /// Wrap `error` as a fallback when it is eligible, fatal otherwise.
    pub fn classify(error: PullError, confirmed_v2: bool, transport_ok: bool) -> Self {
        if error.continue_on_error() {
            AttemptError::Fallback(FallbackError {
                error,
                confirmed_v2,
                transport_ok,
            })
        } else {
            AttemptError::Fatal(error)
        }
    }

    /// The underlying failure.
    pub fn error(&self) -> &PullError {
        match self {
            AttemptError::Fallback(f) => &f.error,
            AttemptError::Fatal(e) => e,
        }
    }

    pub fn into_error(self) -> PullError {
        match self {
            AttemptError::Fallback(f) => f.error,
            AttemptError::Fatal(e) => e,
        }
    }
}

// =============================================================================
// Caller-facing errors
// =============================================================================

/// Stable classification of a failed pull or inspect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImagePullError {
    #[error("invalid reference format: {0}")]
    InvalidReference(String),

    #[error(
        "pull access denied for {repository}, repository does not exist or may require authentication"
    )]
    Unauthorized { repository: String },

    #[error("manifest for {reference} not found")]
    ManifestNotFound { reference: String },

    #[error("repository {repository} not found")]
    RepositoryNotFound { repository: String },

    /// Content failed verification or could not be understood.
    #[error("{0}")]
    Integrity(String),

    #[error("pull cancelled")]
    Cancelled,

    #[error("no endpoints found for {reference}")]
    NoEndpoints { reference: String },

    #[error("no configured registry to pull from")]
    NoRegistries,

    #[error("{0}")]
    Failed(String),
}

impl ImagePullError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ImagePullError::ManifestNotFound { .. } | ImagePullError::RepositoryNotFound { .. }
        )
    }
}

/// Translate an internal failure into the caller-facing classification.
pub fn translate_pull_error(error: PullError, reference: &Reference) -> ImagePullError {
    match &error {
        PullError::Registry { code, .. } => match code {
            RegistryErrorCode::Unauthorized | RegistryErrorCode::Denied => {
                ImagePullError::Unauthorized {
                    repository: reference.familiar_name(),
                }
            }
            RegistryErrorCode::ManifestUnknown => ImagePullError::ManifestNotFound {
                reference: reference.familiar_string(),
            },
            RegistryErrorCode::NameUnknown => ImagePullError::RepositoryNotFound {
                repository: reference.familiar_name(),
            },
            _ => ImagePullError::Failed(error.to_string()),
        },
        PullError::Cancelled => ImagePullError::Cancelled,
        PullError::Reference(e) => ImagePullError::InvalidReference(e.to_string()),
        e if e.is_integrity_failure() => ImagePullError::Integrity(error.to_string()),
        _ => ImagePullError::Failed(error.to_string()),
    }
}
