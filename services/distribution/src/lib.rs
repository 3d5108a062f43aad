//! dray image distribution
//!
//! Pulls container images from registries: resolves a reference to an
//! ordered list of endpoints, tries them in turn, and turns whatever
//! manifest the registry serves into one normalized [`ImageRecord`].
//!
//! ## Pipeline
//!
//! ```text
//! pull / inspect
//! └── orchestrator          (endpoint fallback)
//!     ├── V2Puller          (manifest → platform → config + layers)
//!     └── V1Puller          (tags → ancestry → image JSON + layers)
//!         └── normalize     (one record shape for every schema)
//! ```
//!
//! Every manifest, config and layer is checked against its digest before
//! anything is written to the [`ContentStore`].
//!
//! ## Modules
//!
//! - `manifest`: media type detection, decoding, legacy canonical form
//! - `puller`: one endpoint attempt per protocol version
//! - `orchestrator`: the fallback fold and the top-level operations
//! - `store`: content and v1 ID metadata stores
//! - `service`: pull and persist

pub mod auth;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod image;
pub mod inspect;
pub mod manifest;
pub mod normalize;
pub mod orchestrator;
pub mod platform;
pub mod progress;
pub mod puller;
pub mod service;
pub mod store;

pub use config::{Config, PullConfig};
pub use endpoint::{ApiVersion, Endpoint, EndpointResolver, StaticEndpointResolver};
pub use error::{ImagePullError, PullError};
pub use image::ImageRecord;
pub use inspect::RemoteImageInspect;
pub use orchestrator::{inspect, pull, pull_outcome};
pub use platform::Platform;
pub use service::{ImageService, ServiceError};
pub use store::{ContentStore, FsStore, MemoryStore};

pub use dray_digest::Digest;
pub use dray_reference::Reference;
