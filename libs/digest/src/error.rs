//! Error types for digest parsing and verification.

use thiserror::Error;

/// Errors that can occur when parsing or verifying digests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The digest string is empty.
    #[error("digest cannot be empty")]
    Empty,

    /// The digest has no `algorithm:` prefix.
    #[error("digest missing algorithm separator: '{0}'")]
    MissingSeparator(String),

    /// The algorithm prefix is not one we can compute.
    #[error("unsupported digest algorithm: '{0}'")]
    UnsupportedAlgorithm(String),

    /// The encoded portion has the wrong length for its algorithm.
    #[error("invalid {algorithm} digest length: expected {expected} hex characters, got {actual}")]
    InvalidLength {
        algorithm: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The encoded portion is not lower-case hex.
    #[error("invalid digest encoding: '{0}'")]
    InvalidEncoding(String),

    /// The content does not hash to the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    /// The content grew past the caller's size limit before it finished.
    #[error("content exceeds size limit of {limit} bytes")]
    TooLarge { limit: u64 },
}

impl DigestError {
    /// Returns true if the content was read completely but hashed to a
    /// different value.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, DigestError::Mismatch { .. })
    }

    /// Returns true if the digest string itself was malformed.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            DigestError::Empty
                | DigestError::MissingSeparator(_)
                | DigestError::UnsupportedAlgorithm(_)
                | DigestError::InvalidLength { .. }
                | DigestError::InvalidEncoding(_)
        )
    }
}

/// Error from [`crate::verify_stream`]: either the underlying stream failed
/// or the content it produced failed verification.
#[derive(Debug, Error)]
pub enum StreamError<E> {
    /// Reading the next chunk failed.
    #[error("stream error: {0}")]
    Stream(#[source] E),

    /// The content was read but did not verify.
    #[error(transparent)]
    Digest(#[from] DigestError),
}

impl<E> StreamError<E> {
    /// Returns true if the failure is a verification failure rather than
    /// an I/O failure.
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, StreamError::Digest(_))
    }
}
