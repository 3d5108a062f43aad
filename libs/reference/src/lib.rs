//! # dray-reference
//!
//! Parsing and validation of image references.
//!
//! ## Format
//!
//! `[domain/]path[:tag][@algorithm:hex]`
//!
//! Examples:
//! - `busybox` (unqualified, no tag or digest)
//! - `docker.io/library/busybox:1.36`
//! - `localhost:5000/team/app@sha256:a3ed95ca...`
//!
//! A reference may carry a tag, a digest, both, or neither. A digest wins
//! for fetching; the tag is kept for display and local naming.
//!
//! Unqualified references (no registry domain) are resolved against an
//! ordered list of default registries with [`Reference::qualify`].

mod error;
mod reference;

pub use error::ReferenceError;
pub use reference::{
    validate_repo_name, Reference, DEFAULT_DOMAIN, DEFAULT_TAG, LEGACY_DEFAULT_DOMAIN,
    NAME_TOTAL_LENGTH_MAX, OFFICIAL_REPO_PREFIX, RESERVED_NAME,
};
