//! # dray-digest
//!
//! Content digests for registry blobs and manifests.
//!
//! A digest is written `algorithm:hex`, for example
//! `sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4`.
//! It is both the identifier of a piece of content and the check that the
//! content arrived intact.
//!
//! ## Verification
//!
//! - [`verify_bytes`] checks a fully buffered object (manifests, configs).
//! - [`verify_stream`] hashes a chunked download as it arrives, so a layer
//!   never has to be hashed in a second pass.
//! - [`Verifier`] is the incremental primitive both are built on; it also
//!   implements [`std::io::Write`].
//!
//! A failed comparison is always [`DigestError::Mismatch`], never an I/O
//! error, so callers can treat corruption differently from a broken
//! connection.

mod digest;
mod error;
mod verify;

pub use digest::{Algorithm, Digest};
pub use error::{DigestError, StreamError};
pub use verify::{verify_bytes, verify_stream, Verifier};
