//! In-process fake registry.
//!
//! A [`FakeRegistry`] is a `wiremock` server with helpers that mount the
//! registry API routes for fixture content. Routes not mounted answer 404,
//! which is also how a server that does not speak a protocol version looks.

use std::collections::HashMap;

use dray_digest::Digest;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use crate::fixtures::{
    Blob, ImageFixture, LegacyLayerFixture, MEDIA_TYPE_LEGACY_SIGNED, MEDIA_TYPE_MANIFEST,
    MEDIA_TYPE_MANIFEST_LIST,
};

const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

pub struct FakeRegistry {
    server: MockServer,
}

impl FakeRegistry {
    /// A registry speaking v2.
    pub async fn start() -> Self {
        let registry = Self::start_bare().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200).insert_header(API_VERSION_HEADER, "registry/2.0"))
            .mount(&registry.server)
            .await;
        registry
    }

    /// A registry speaking only the legacy v1 protocol.
    pub async fn start_v1() -> Self {
        let registry = Self::start_bare().await;
        Mock::given(method("GET"))
            .and(path("/v1/_ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .mount(&registry.server)
            .await;
        registry
    }

    /// A server with no routes at all.
    pub async fn start_bare() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// `http://127.0.0.1:<port>`
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// `127.0.0.1:<port>`, the registry domain for references.
    pub fn host(&self) -> String {
        self.uri().trim_start_matches("http://").to_string()
    }

    pub fn server(&self) -> &MockServer {
        &self.server
    }

    /// Paths of every request received so far, in order.
    pub async fn requested_paths(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r: &Request| r.url.path().to_string())
            .collect()
    }

    /// Number of requests received for `path`.
    pub async fn hits(&self, path: &str) -> usize {
        self.requested_paths()
            .await
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }

    // =========================================================================
    // v2
    // =========================================================================

    /// Serve `body` at `/v2/<repository>/manifests/<reference>`.
    pub async fn manifest(&self, repository: &str, reference: &str, media_type: &str, body: &[u8]) {
        let digest = Digest::sha256(body);
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/manifests/{}", repository, reference)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body.to_vec(), media_type)
                    .insert_header(CONTENT_DIGEST_HEADER, digest.to_string().as_str()),
            )
            .mount(&self.server)
            .await;
    }

    /// Serve `data` as the blob `digest`, whether or not it matches.
    pub async fn blob_as(&self, repository: &str, digest: &Digest, data: &[u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repository, digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.to_vec()))
            .mount(&self.server)
            .await;
    }

    pub async fn blob(&self, repository: &str, blob: &Blob) {
        self.blob_as(repository, &blob.digest, &blob.data).await;
    }

    pub async fn tags(&self, repository: &str, tags: &[&str]) {
        let body = serde_json::json!({"name": repository, "tags": tags});
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/tags/list", repository)))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Serve an image's config and layers, and its manifest under `tag`
    /// and under its digest.
    pub async fn push_image(&self, repository: &str, tag: &str, image: &ImageFixture) {
        self.blob(repository, &image.config).await;
        for layer in &image.layers {
            self.blob(repository, layer).await;
        }
        self.push_manifest(repository, tag, MEDIA_TYPE_MANIFEST, &image.manifest)
            .await;
    }

    /// Serve every image and a manifest list over them under `tag`.
    pub async fn push_list(&self, repository: &str, tag: &str, list: &Blob, images: &[&ImageFixture]) {
        for image in images {
            self.blob(repository, &image.config).await;
            for layer in &image.layers {
                self.blob(repository, layer).await;
            }
            let digest = image.manifest.digest.to_string();
            self.manifest(repository, &digest, MEDIA_TYPE_MANIFEST, &image.manifest.data)
                .await;
        }
        self.push_manifest(repository, tag, MEDIA_TYPE_MANIFEST_LIST, list)
            .await;
    }

    /// Serve a legacy manifest under `tag` together with its layer blobs.
    /// `manifest` may be signed; the digest header is left out because it
    /// covers the canonical payload rather than the served bytes.
    pub async fn push_legacy(
        &self,
        repository: &str,
        tag: &str,
        manifest: &[u8],
        layers: &[LegacyLayerFixture],
    ) {
        for layer in layers {
            self.blob(repository, &layer.blob).await;
        }
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/manifests/{}", repository, tag)))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(manifest.to_vec(), MEDIA_TYPE_LEGACY_SIGNED),
            )
            .mount(&self.server)
            .await;
    }

    async fn push_manifest(&self, repository: &str, tag: &str, media_type: &str, manifest: &Blob) {
        self.manifest(repository, tag, media_type, &manifest.data)
            .await;
        let digest = manifest.digest.to_string();
        self.manifest(repository, &digest, media_type, &manifest.data)
            .await;
    }

    /// Answer every request under `/v2/<repository>/` with `status`.
    pub async fn fail_repository(&self, repository: &str, status: u16, code: &str) {
        let body = serde_json::json!({"errors": [{"code": code, "message": code.to_lowercase()}]});
        Mock::given(method("GET"))
            .and(wiremock::matchers::path_regex(format!("^/v2/{}/.*", repository)))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    // =========================================================================
    // v1
    // =========================================================================

    /// Serve a v1 repository whose tags point at image IDs. `layers` is
    /// base first; ancestry and image JSON are mounted for the top layer of
    /// each prefix.
    pub async fn push_v1(&self, repository: &str, tags: &[(&str, &str)], layers: &[LegacyLayerFixture]) {
        let tags: HashMap<&str, &str> = tags.iter().copied().collect();
        Mock::given(method("GET"))
            .and(path(format!("/v1/repositories/{}/tags", repository)))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags))
            .mount(&self.server)
            .await;

        for (i, layer) in layers.iter().enumerate() {
            let ancestry: Vec<&str> = layers[..=i].iter().rev().map(|l| l.id.as_str()).collect();
            Mock::given(method("GET"))
                .and(path(format!("/v1/images/{}/ancestry", layer.id)))
                .respond_with(ResponseTemplate::new(200).set_body_json(ancestry))
                .mount(&self.server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/v1/images/{}/json", layer.id)))
                .respond_with(ResponseTemplate::new(200).set_body_string(layer.json.clone()))
                .mount(&self.server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/v1/images/{}/layer", layer.id)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(layer.blob.data.clone()))
                .mount(&self.server)
                .await;
        }
    }
}
