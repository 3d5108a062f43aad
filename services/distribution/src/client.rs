//! HTTP transport for one registry endpoint.
//!
//! A [`RegistryClient`] is built per endpoint attempt and is scoped to one
//! repository. It maps HTTP failures onto [`PullError`] but makes no
//! fallback decisions of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dray_digest::{verify_stream, Digest, DigestError, StreamError, Verifier};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::auth::{BearerChallenge, Credentials, TokenResponse};
use crate::endpoint::Endpoint;
use crate::error::{parse_error_body, PullError, RegistryErrorCode};
use crate::manifest::{accept_header, FetchedManifest};
use crate::store::BlobWriter;

/// Manifests larger than this are refused.
pub const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Transport settings shared by every client of a pull.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_agent: String,
    /// Timeout for pings, manifests, tag lists and metadata.
    pub request_timeout: Duration,
    /// Timeout for one blob download, body included.
    pub blob_timeout: Duration,
    /// Largest blob accepted.
    pub max_blob_size: Option<u64>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: concat!("dray/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
            blob_timeout: Duration::from_secs(300), // 5 minutes
            max_blob_size: Some(10 * 1024 * 1024 * 1024), // 10 GiB
        }
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Registry client for one endpoint and repository.
pub struct RegistryClient {
    http: Client,
    endpoint: Endpoint,
    repository: String,
    credentials: RwLock<Option<Credentials>>,
    options: ClientOptions,
    responded: AtomicBool,
}

impl RegistryClient {
    pub fn new(
        endpoint: Endpoint,
        repository: &str,
        credentials: Option<Credentials>,
        options: ClientOptions,
    ) -> Result<Self, PullError> {
        let http = Client::builder()
            .user_agent(options.user_agent.clone())
            .connect_timeout(options.request_timeout)
            .danger_accept_invalid_certs(!endpoint.tls_verify)
            .build()
            .map_err(|source| PullError::Transport {
                url: endpoint.base().to_string(),
                source,
            })?;

        Ok(Self {
            http,
            endpoint,
            repository: repository.to_string(),
            credentials: RwLock::new(credentials),
            options,
            responded: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns true once any HTTP response, error statuses included, has
    /// come back from the endpoint.
    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Relaxed)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.base(), path)
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &*self.credentials.read().await {
            Some(Credentials::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(Credentials::Bearer(token)) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<Response, PullError> {
        let response = self
            .authorize(request)
            .await
            .send()
            .await
            .map_err(|source| PullError::Transport {
                url: url.to_string(),
                source,
            })?;
        self.responded.store(true, Ordering::Relaxed);
        Ok(response)
    }

    async fn get(
        &self,
        url: &str,
        timeout: Duration,
        not_found: RegistryErrorCode,
    ) -> Result<Response, PullError> {
        let response = self.send(url, self.http.get(url).timeout(timeout)).await?;
        error_for_status(url, response, not_found).await
    }

    // =========================================================================
    // v2
    // =========================================================================

    /// `GET /v2/`. A bearer challenge is answered here, so every later
    /// request carries the pull token.
    pub async fn ping_v2(&self) -> Result<(), PullError> {
        let url = self.url("/v2/");
        debug!(url = %url, "pinging registry");

        let response = self
            .send(&url, self.http.get(&url).timeout(self.options.request_timeout))
            .await?;
        let advertised = response.headers().contains_key(API_VERSION_HEADER);

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|h| h.to_str().ok())
                    .and_then(BearerChallenge::parse);
                match challenge {
                    Some(challenge) => self.fetch_token(&challenge).await,
                    None => Ok(()),
                }
            }
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND if !advertised => Err(PullError::NoSupport(format!(
                "{} does not serve the v2 API",
                self.endpoint.base()
            ))),
            _ => error_for_status(&url, response, RegistryErrorCode::Unsupported)
                .await
                .map(|_| ()),
        }
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<(), PullError> {
        let url = challenge.token_url(&self.repository).ok_or_else(|| PullError::Registry {
            url: self.url("/v2/"),
            status: StatusCode::UNAUTHORIZED.as_u16(),
            code: RegistryErrorCode::Unauthorized,
            message: format!("invalid token realm {}", challenge.realm),
        })?;
        debug!(realm = %challenge.realm, "requesting pull token");

        let mut request = self
            .http
            .get(url.clone())
            .timeout(self.options.request_timeout);
        if let Some(Credentials::Basic { username, password }) = &*self.credentials.read().await {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await.map_err(|source| PullError::Transport {
            url: url.to_string(),
            source,
        })?;
        let response =
            error_for_status(url.as_str(), response, RegistryErrorCode::Unauthorized).await?;

        let body = read_body(url.as_str(), response).await?;
        let token = serde_json::from_slice::<TokenResponse>(&body)
            .ok()
            .and_then(TokenResponse::into_token)
            .ok_or_else(|| PullError::Registry {
                url: url.to_string(),
                status: StatusCode::OK.as_u16(),
                code: RegistryErrorCode::Unauthorized,
                message: "token response carried no token".to_string(),
            })?;

        *self.credentials.write().await = Some(Credentials::Bearer(token));
        Ok(())
    }

    /// Fetch a manifest by tag or digest.
    pub async fn get_manifest(&self, reference: &str) -> Result<FetchedManifest, PullError> {
        let url = self.url(&format!("/v2/{}/manifests/{}", self.repository, reference));
        debug!(url = %url, "fetching manifest");

        let request = self
            .http
            .get(&url)
            .header(ACCEPT, accept_header())
            .timeout(self.options.request_timeout);
        let response = self.send(&url, request).await?;
        let response = error_for_status(&url, response, RegistryErrorCode::ManifestUnknown).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let content_digest = response
            .headers()
            .get(CONTENT_DIGEST_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<Digest>().ok());

        if let Some(len) = response.content_length() {
            if len > MAX_MANIFEST_SIZE {
                return Err(PullError::MalformedManifest(format!(
                    "manifest of {} bytes exceeds limit of {} bytes",
                    len, MAX_MANIFEST_SIZE
                )));
            }
        }
        let body = read_limited(&url, response, MAX_MANIFEST_SIZE)
            .await
            .map_err(|e| match e {
                StreamError::Stream(e) => e,
                StreamError::Digest(_) => PullError::MalformedManifest(format!(
                    "manifest exceeds limit of {} bytes",
                    MAX_MANIFEST_SIZE
                )),
            })?;

        Ok(FetchedManifest {
            body,
            content_type,
            content_digest,
        })
    }

    /// All tags of the repository, in registry order.
    pub async fn list_tags(&self) -> Result<Vec<String>, PullError> {
        let url = self.url(&format!("/v2/{}/tags/list", self.repository));
        let response = self
            .get(&url, self.options.request_timeout, RegistryErrorCode::NameUnknown)
            .await?;
        let body = read_body(&url, response).await?;
        let list: TagList = serde_json::from_slice(&body).map_err(|e| PullError::Registry {
            url: url.clone(),
            status: StatusCode::OK.as_u16(),
            code: RegistryErrorCode::Unknown("INVALID_TAG_LIST".to_string()),
            message: e.to_string(),
        })?;
        Ok(list.tags.unwrap_or_default())
    }

    async fn blob_response(&self, digest: &Digest) -> Result<(String, Response), PullError> {
        let url = self.url(&format!("/v2/{}/blobs/{}", self.repository, digest));
        debug!(url = %url, "fetching blob");

        let response = self
            .get(&url, self.options.blob_timeout, RegistryErrorCode::BlobUnknown)
            .await?;
        if let (Some(len), Some(limit)) = (response.content_length(), self.options.max_blob_size) {
            if len > limit {
                return Err(PullError::verification(
                    format!("blob {}", digest),
                    DigestError::TooLarge { limit },
                ));
            }
        }
        Ok((url, response))
    }

    /// Download a small blob into memory, verifying it against `digest` as
    /// it streams in.
    pub async fn get_blob(&self, digest: &Digest) -> Result<Bytes, PullError> {
        let (url, response) = self.blob_response(digest).await?;
        verify_stream(digest, response.bytes_stream(), self.options.max_blob_size)
            .await
            .map_err(|e| match e {
                StreamError::Stream(source) => PullError::Transport {
                    url: url.clone(),
                    source,
                },
                StreamError::Digest(e) => PullError::verification(format!("blob {}", digest), e),
            })
    }

    /// Stream a blob into `writer`, hashing each chunk on the way. The
    /// writer is left uncommitted; the caller commits or aborts it. Returns
    /// the number of bytes written.
    pub async fn download_blob<W>(&self, digest: &Digest, writer: &mut W) -> Result<u64, PullError>
    where
        W: BlobWriter + ?Sized,
    {
        let (url, response) = self.blob_response(digest).await?;
        let limit = self.options.max_blob_size.unwrap_or(u64::MAX);
        let mut verifier = Verifier::new(digest);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| PullError::Transport {
                url: url.clone(),
                source,
            })?;
            if verifier.written() + chunk.len() as u64 > limit {
                return Err(PullError::verification(
                    format!("blob {}", digest),
                    DigestError::TooLarge { limit },
                ));
            }
            verifier.update(&chunk);
            writer.write(&chunk).await?;
        }

        let written = verifier.written();
        verifier
            .finish()
            .map_err(|e| PullError::verification(format!("blob {}", digest), e))?;
        Ok(written)
    }

    // =========================================================================
    // v1
    // =========================================================================

    /// `GET /v1/_ping`.
    pub async fn ping_v1(&self) -> Result<(), PullError> {
        let url = self.url("/v1/_ping");
        let response = self
            .send(&url, self.http.get(&url).timeout(self.options.request_timeout))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(PullError::NoSupport(format!(
                "{} does not serve the v1 API",
                self.endpoint.base()
            ))),
            _ => error_for_status(&url, response, RegistryErrorCode::Unsupported)
                .await
                .map(|_| ()),
        }
    }

    /// Tag to image ID map.
    pub async fn v1_tags(&self) -> Result<HashMap<String, String>, PullError> {
        let url = self.url(&format!("/v1/repositories/{}/tags", self.repository));
        self.get_json(&url, RegistryErrorCode::NameUnknown).await
    }

    /// Image IDs from `image_id` down to the base, newest first.
    pub async fn v1_ancestry(&self, image_id: &str) -> Result<Vec<String>, PullError> {
        let url = self.url(&format!("/v1/images/{}/ancestry", image_id));
        self.get_json(&url, RegistryErrorCode::ManifestUnknown).await
    }

    /// The raw v1 image JSON.
    pub async fn v1_image_json(&self, image_id: &str) -> Result<Bytes, PullError> {
        let url = self.url(&format!("/v1/images/{}/json", image_id));
        let response = self
            .get(&url, self.options.request_timeout, RegistryErrorCode::ManifestUnknown)
            .await?;
        read_body(&url, response).await
    }

    /// The layer tarball. v1 layers are not content addressed; the caller
    /// digests what it receives.
    pub async fn v1_layer(&self, image_id: &str) -> Result<Bytes, PullError> {
        let url = self.url(&format!("/v1/images/{}/layer", image_id));
        let response = self
            .get(&url, self.options.blob_timeout, RegistryErrorCode::BlobUnknown)
            .await?;
        let limit = self.options.max_blob_size.unwrap_or(u64::MAX);
        read_limited(&url, response, limit)
            .await
            .map_err(|e| match e {
                StreamError::Stream(e) => e,
                StreamError::Digest(e) => PullError::verification(format!("layer {}", image_id), e),
            })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        not_found: RegistryErrorCode,
    ) -> Result<T, PullError> {
        let response = self
            .get(url, self.options.request_timeout, not_found)
            .await?;
        let body = read_body(url, response).await?;
        serde_json::from_slice(&body).map_err(|e| PullError::Registry {
            url: url.to_string(),
            status: StatusCode::OK.as_u16(),
            code: RegistryErrorCode::Unknown("INVALID_RESPONSE".to_string()),
            message: e.to_string(),
        })
    }
}

async fn read_body(url: &str, response: Response) -> Result<Bytes, PullError> {
    response.bytes().await.map_err(|source| PullError::Transport {
        url: url.to_string(),
        source,
    })
}

/// Read the body, stopping as soon as it grows past `limit`.
async fn read_limited(
    url: &str,
    response: Response,
    limit: u64,
) -> Result<Bytes, StreamError<PullError>> {
    let mut stream = response.bytes_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| {
            StreamError::Stream(PullError::Transport {
                url: url.to_string(),
                source,
            })
        })?;
        if buf.len() as u64 + chunk.len() as u64 > limit {
            return Err(DigestError::TooLarge { limit }.into());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Turn an error status into [`PullError::Registry`], decoding the registry
/// error body when there is one. `not_found` is the code assumed for a bare
/// 404.
async fn error_for_status(
    url: &str,
    response: Response,
    not_found: RegistryErrorCode,
) -> Result<Response, PullError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.bytes().await.unwrap_or_default();
    let (code, message) = parse_error_body(&body).unwrap_or_else(|| {
        let code = if status == StatusCode::NOT_FOUND {
            not_found
        } else {
            RegistryErrorCode::from_status(status.as_u16())
        };
        (code, status.canonical_reason().unwrap_or_default().to_string())
    });

    Err(PullError::Registry {
        url: url.to_string(),
        status: status.as_u16(),
        code,
        message,
    })
}
