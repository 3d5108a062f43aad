//! Credentials for registry requests.
//!
//! Credential lookup (helpers, keychains) belongs to the caller; the pull
//! core only attaches what it is given. No credentials means an anonymous
//! pull. When a registry answers the ping with a bearer challenge, the
//! client trades whatever it was given for a pull-scoped token.

use std::collections::HashMap;
use std::fmt;

use reqwest::Url;
use serde::Deserialize;

use crate::endpoint::Endpoint;

/// Auth material for one endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Bearer(_) => f.debug_tuple("Bearer").field(&"<redacted>").finish(),
        }
    }
}

/// Supplies credentials per endpoint and repository.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, endpoint: &Endpoint, repository: &str) -> Option<Credentials>;
}

/// Always anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn credentials(&self, _endpoint: &Endpoint, _repository: &str) -> Option<Credentials> {
        None
    }
}

/// Fixed credentials per endpoint host, with an optional fallback for any
/// other host.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_host: HashMap<String, Credentials>,
    default: Option<Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, credentials: Credentials) -> Self {
        self.by_host.insert(host.to_string(), credentials);
        self
    }

    pub fn with_default(mut self, credentials: Credentials) -> Self {
        self.default = Some(credentials);
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, endpoint: &Endpoint, _repository: &str) -> Option<Credentials> {
        self.by_host
            .get(&endpoint.host())
            .or(self.default.as_ref())
            .cloned()
    }
}

/// A `WWW-Authenticate: Bearer realm="...",service="..."` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        for part in split_auth_params(params) {
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim().trim_matches('"');
                match key.trim() {
                    "realm" => realm = Some(value.to_string()),
                    "service" => service = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        Some(Self {
            realm: realm?,
            service,
        })
    }

    /// Token request URL granting pull access to `repository`.
    pub fn token_url(&self, repository: &str) -> Option<Url> {
        let mut url = Url::parse(&self.realm).ok()?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &self.service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", &format!("repository:{}:pull", repository));
        }
        Some(url)
    }
}

/// Split challenge parameters on commas outside quotes.
fn split_auth_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;

    for (i, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        parts.push(s[start..].trim());
    }
    parts
}

/// Token endpoint response. Registries disagree on the field name.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Option<String> {
        self.token
            .filter(|t| !t.is_empty())
            .or(self.access_token)
    }
}
