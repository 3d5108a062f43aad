//! The [`Reference`] type.

use std::fmt;
use std::str::FromStr;

use dray_digest::Digest;

use crate::error::ReferenceError;

/// Registry domain used when qualifying against Docker Hub.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Older spelling of the Docker Hub domain, treated as equivalent.
pub const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";

/// Prefix of single-component official repositories on Docker Hub.
pub const OFFICIAL_REPO_PREFIX: &str = "library/";

/// Tag used when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Maximum length of a full repository name.
pub const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// Name that refers to the empty base image and can never be pulled.
pub const RESERVED_NAME: &str = "scratch";

const TAG_LENGTH_MAX: usize = 128;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    domain: Option<String>,
    path: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// The registry domain, if the reference names one.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// The repository path within the registry (`library/busybox`).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The full repository name, `domain/path`, without tag or digest.
    pub fn name(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}/{}", domain, self.path),
            None => self.path.clone(),
        }
    }

    /// Returns true if the reference names its registry.
    pub fn is_fully_qualified(&self) -> bool {
        self.domain.is_some()
    }

    /// Returns true if the registry is Docker Hub under either spelling.
    pub fn is_default_domain(&self) -> bool {
        matches!(
            self.domain.as_deref(),
            Some(DEFAULT_DOMAIN) | Some(LEGACY_DEFAULT_DOMAIN)
        )
    }

    /// Replace the tag.
    pub fn with_tag(mut self, tag: &str) -> Result<Self, ReferenceError> {
        validate_tag(tag)?;
        self.tag = Some(tag.to_string());
        Ok(self)
    }

    /// Replace the digest.
    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Add the default tag when the reference has neither tag nor digest.
    pub fn with_default_tag(mut self) -> Self {
        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }

    /// The repository name alone, dropping tag and digest.
    pub fn trim(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: None,
            digest: None,
        }
    }

    /// Qualify an unqualified reference against `registry`.
    ///
    /// Fully qualified references are returned unchanged. Qualifying a
    /// single-component name against Docker Hub adds the `library/` prefix.
    pub fn qualify(&self, registry: &str) -> Result<Self, ReferenceError> {
        if self.is_fully_qualified() {
            return Ok(self.clone());
        }
        validate_domain(registry)?;

        let path = if is_docker_hub(registry) && !self.path.contains('/') {
            format!("{}{}", OFFICIAL_REPO_PREFIX, self.path)
        } else {
            self.path.clone()
        };
        if registry.len() + 1 + path.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ReferenceError::NameTooLong {
                max: NAME_TOTAL_LENGTH_MAX,
            });
        }

        Ok(Self {
            domain: Some(registry.to_string()),
            path,
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        })
    }

    /// The short form users type: Docker Hub domain and `library/` dropped.
    pub fn familiar_name(&self) -> String {
        if self.domain.is_none() || self.is_default_domain() {
            match self.path.strip_prefix(OFFICIAL_REPO_PREFIX) {
                Some(rest) if !rest.contains('/') => rest.to_string(),
                _ => self.path.clone(),
            }
        } else {
            self.name()
        }
    }

    /// [`Reference::familiar_name`] with tag and digest appended.
    pub fn familiar_string(&self) -> String {
        let mut out = self.familiar_name();
        self.write_suffix(&mut out);
        out
    }

    fn write_suffix(&self, out: &mut String) {
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(&digest.to_string());
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = self.name();
        self.write_suffix(&mut out);
        f.write_str(&out)
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (rest, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest.parse::<Digest>()?)),
            None => (s, None),
        };

        // A colon followed by a slash belongs to a registry port, not a tag.
        let (name, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx + 1..].contains('/') => {
                (&rest[..idx], Some(rest[idx + 1..].to_string()))
            }
            _ => (rest, None),
        };

        if name.is_empty() {
            return Err(ReferenceError::EmptyName);
        }
        if let Some(tag) = &tag {
            validate_tag(tag)?;
        }
        if name.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ReferenceError::NameTooLong {
                max: NAME_TOTAL_LENGTH_MAX,
            });
        }

        let (domain, path) = split_domain(name);
        if let Some(domain) = domain {
            validate_domain(domain)?;
        }
        if path.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(ReferenceError::Uppercase(name.to_string()));
        }
        for component in path.split('/') {
            if !valid_component(component) {
                return Err(ReferenceError::InvalidComponent(component.to_string()));
            }
        }

        Ok(Self {
            domain: domain.map(str::to_string),
            path: path.to_string(),
            tag,
            digest,
        })
    }
}

impl serde::Serialize for Reference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Reference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reject names that can never be pulled.
pub fn validate_repo_name(reference: &Reference) -> Result<(), ReferenceError> {
    if reference.familiar_name() == RESERVED_NAME {
        return Err(ReferenceError::Reserved(RESERVED_NAME.to_string()));
    }
    Ok(())
}

fn is_docker_hub(domain: &str) -> bool {
    domain == DEFAULT_DOMAIN || domain == LEGACY_DEFAULT_DOMAIN
}

fn split_domain(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first), rest)
        }
        _ => (None, name),
    }
}

fn validate_domain(domain: &str) -> Result<(), ReferenceError> {
    let invalid = || ReferenceError::InvalidDomain(domain.to_string());

    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (domain, None),
    };
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
    }
    if host.is_empty() {
        return Err(invalid());
    }
    for label in host.split('.') {
        let ok = !label.is_empty()
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !ok {
            return Err(invalid());
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = tag.as_bytes();
    let ok = !bytes.is_empty()
        && bytes.len() <= TAG_LENGTH_MAX
        && word(bytes[0])
        && bytes[1..].iter().all(|&b| word(b) || b == b'.' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_string()))
    }
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn valid_component(component: &str) -> bool {
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = component.as_bytes();
    if bytes.is_empty() || !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let sep = &component[start..i];
        if !(sep == "." || sep == "_" || sep == "__" || sep.bytes().all(|b| b == b'-')) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const DIGEST: &str = "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

    #[rstest]
    #[case("alpine", None, "alpine", None)]
    #[case("alpine:3.18", None, "alpine", Some("3.18"))]
    #[case("myuser/myapp:v1", None, "myuser/myapp", Some("v1"))]
    #[case("ghcr.io/org/repo:v2", Some("ghcr.io"), "org/repo", Some("v2"))]
    #[case("localhost:5000/myapp:test", Some("localhost:5000"), "myapp", Some("test"))]
    #[case("localhost/myapp", Some("localhost"), "myapp", None)]
    #[case("registry.example.com:443/a/b/c", Some("registry.example.com:443"), "a/b/c", None)]
    fn test_parse(
        #[case] input: &str,
        #[case] domain: Option<&str>,
        #[case] path: &str,
        #[case] tag: Option<&str>,
    ) {
        let reference: Reference = input.parse().unwrap();
        assert_eq!(reference.domain(), domain);
        assert_eq!(reference.path(), path);
        assert_eq!(reference.tag(), tag);
        assert!(reference.digest().is_none());
        assert_eq!(reference.to_string(), input);
    }

    #[test]
    fn test_parse_digest_is_not_a_tag() {
        let reference: Reference = format!("ghcr.io/org/app@{}", DIGEST).parse().unwrap();
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.digest().unwrap().to_string(), DIGEST);
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let reference: Reference = format!("busybox:1.36@{}", DIGEST).parse().unwrap();
        assert_eq!(reference.tag(), Some("1.36"));
        assert_eq!(reference.digest().unwrap().to_string(), DIGEST);
        assert_eq!(reference.to_string(), format!("busybox:1.36@{}", DIGEST));
    }

    #[rstest]
    #[case("", ReferenceError::Empty)]
    #[case(":latest", ReferenceError::EmptyName)]
    #[case("Busybox", ReferenceError::Uppercase("Busybox".to_string()))]
    #[case("busy!box", ReferenceError::InvalidComponent("busy!box".to_string()))]
    #[case("org//app", ReferenceError::InvalidComponent(String::new()))]
    #[case("app-", ReferenceError::InvalidComponent("app-".to_string()))]
    #[case("busybox:-bad", ReferenceError::InvalidTag("-bad".to_string()))]
    #[case("bad_host.io:port/app", ReferenceError::InvalidDomain("bad_host.io:port".to_string()))]
    fn test_parse_rejects(#[case] input: &str, #[case] expected: ReferenceError) {
        assert_eq!(input.parse::<Reference>().unwrap_err(), expected);
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        let err = "busybox@sha256:1234".parse::<Reference>().unwrap_err();
        assert!(matches!(err, ReferenceError::InvalidDigest(_)));
        assert!(err.is_suffix_error());
    }

    #[test]
    fn test_name_too_long() {
        let long = "a".repeat(NAME_TOTAL_LENGTH_MAX + 1);
        assert_eq!(
            long.parse::<Reference>().unwrap_err(),
            ReferenceError::NameTooLong {
                max: NAME_TOTAL_LENGTH_MAX
            }
        );
    }

    #[rstest]
    #[case("busybox", "docker.io", "docker.io/library/busybox")]
    #[case("team/app:v1", "docker.io", "docker.io/team/app:v1")]
    #[case("busybox:1.36", "registry.access.example.com", "registry.access.example.com/busybox:1.36")]
    #[case("quay.io/org/app", "docker.io", "quay.io/org/app")]
    fn test_qualify(#[case] input: &str, #[case] registry: &str, #[case] expected: &str) {
        let reference: Reference = input.parse().unwrap();
        assert_eq!(reference.qualify(registry).unwrap().to_string(), expected);
    }

    #[test]
    fn test_qualify_rejects_bad_registry() {
        let reference: Reference = "busybox".parse().unwrap();
        assert!(matches!(
            reference.qualify("not a host"),
            Err(ReferenceError::InvalidDomain(_))
        ));
    }

    #[rstest]
    #[case("docker.io/library/busybox:latest", "busybox", "busybox:latest")]
    #[case("index.docker.io/team/app", "team/app", "team/app")]
    #[case("docker.io/library/a/b", "library/a/b", "library/a/b")]
    #[case("ghcr.io/org/app:v1", "ghcr.io/org/app", "ghcr.io/org/app:v1")]
    fn test_familiar(#[case] input: &str, #[case] name: &str, #[case] string: &str) {
        let reference: Reference = input.parse().unwrap();
        assert_eq!(reference.familiar_name(), name);
        assert_eq!(reference.familiar_string(), string);
    }

    #[test]
    fn test_default_tag_only_when_untagged() {
        let plain: Reference = "busybox".parse().unwrap();
        assert_eq!(plain.with_default_tag().tag(), Some(DEFAULT_TAG));

        let digested: Reference = format!("busybox@{}", DIGEST).parse().unwrap();
        assert_eq!(digested.with_default_tag().tag(), None);

        let tagged: Reference = "busybox:musl".parse().unwrap();
        assert_eq!(tagged.with_default_tag().tag(), Some("musl"));
    }

    #[test]
    fn test_reserved_name() {
        let scratch: Reference = "scratch".parse().unwrap();
        assert_eq!(
            validate_repo_name(&scratch).unwrap_err(),
            ReferenceError::Reserved(RESERVED_NAME.to_string())
        );

        let qualified = scratch.qualify(DEFAULT_DOMAIN).unwrap();
        assert!(validate_repo_name(&qualified).is_err());

        let other: Reference = "ghcr.io/scratch".parse().unwrap();
        assert!(validate_repo_name(&other).is_ok());
    }

    #[test]
    fn test_serde_as_string() {
        let reference: Reference = "ghcr.io/org/app:v1".parse().unwrap();
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, "\"ghcr.io/org/app:v1\"");
        let back: Reference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = s.parse::<Reference>();
        }

        #[test]
        fn prop_valid_names_roundtrip(
            path in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,2}",
            tag in "[a-z0-9_][a-z0-9_.-]{0,10}",
        ) {
            let input = format!("{}:{}", path, tag);
            let reference: Reference = input.parse().unwrap();
            prop_assert_eq!(reference.to_string(), input);
        }
    }
}
