//! Error types for reference parsing.

use dray_digest::DigestError;
use thiserror::Error;

/// Errors that can occur when parsing or validating a reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The reference string is empty.
    #[error("reference cannot be empty")]
    Empty,

    /// There is nothing before the tag or digest.
    #[error("repository name cannot be empty")]
    EmptyName,

    /// Repository names are lower-case only.
    #[error("repository name must be lowercase: '{0}'")]
    Uppercase(String),

    /// A path component does not match the component grammar.
    #[error("invalid repository name component: '{0}'")]
    InvalidComponent(String),

    /// The registry domain is not a hostname with an optional port.
    #[error("invalid registry domain: '{0}'")]
    InvalidDomain(String),

    /// The tag does not match `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
    #[error("invalid tag: '{0}'")]
    InvalidTag(String),

    /// The digest suffix is malformed.
    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] DigestError),

    /// The full name is longer than registries accept.
    #[error("repository name must not be more than {max} characters")]
    NameTooLong { max: usize },

    /// The name is reserved and cannot be pulled.
    #[error("'{0}' is a reserved name")]
    Reserved(String),
}

impl ReferenceError {
    /// Returns true if the failure is in the tag or digest suffix rather
    /// than the repository name.
    pub fn is_suffix_error(&self) -> bool {
        matches!(
            self,
            ReferenceError::InvalidTag(_) | ReferenceError::InvalidDigest(_)
        )
    }
}
