//! Test support for dray.
//!
//! - [`fixtures`]: images, manifest lists and legacy layer chains with
//!   correct digests.
//! - [`registry`]: a `wiremock`-backed fake registry serving them.

pub mod fixtures;
pub mod registry;

pub use fixtures::{Blob, ImageFixture, LegacyLayerFixture};
pub use registry::FakeRegistry;
