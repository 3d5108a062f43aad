#![allow(dead_code)]

use std::sync::Arc;

use dray_distribution::endpoint::{ApiVersion, Endpoint, EndpointResolver};
use dray_distribution::{MemoryStore, Platform, PullConfig, PullError, Reference};
use dray_testing::FakeRegistry;

/// Resolver returning the same endpoints for every registry.
pub struct FixedEndpoints(pub Vec<Endpoint>);

impl EndpointResolver for FixedEndpoints {
    fn lookup_pull_endpoints(&self, _registry: &str) -> Result<Vec<Endpoint>, PullError> {
        Ok(self.0.clone())
    }
}

pub fn v2(registry: &FakeRegistry) -> Endpoint {
    Endpoint::parse(&registry.uri(), ApiVersion::V2).unwrap()
}

pub fn v1(registry: &FakeRegistry) -> Endpoint {
    Endpoint::parse(&registry.uri(), ApiVersion::V1).unwrap()
}

pub fn config(endpoints: Vec<Endpoint>, store: Arc<MemoryStore>) -> PullConfig {
    PullConfig::new()
        .with_resolver(Arc::new(FixedEndpoints(endpoints)))
        .with_store(store)
        .with_platform(Platform::new("linux", "amd64"))
}

/// `<registry host>/<name>`
pub fn reference(registry: &FakeRegistry, name: &str) -> Reference {
    format!("{}/{}", registry.host(), name).parse().unwrap()
}
