//! Endpoint/fallback orchestration.
//!
//! For one fully qualified reference the orchestrator asks the resolver for
//! the registry's endpoints and tries them strictly in order. What it has
//! learned so far lives in a [`FallbackState`] that is folded over the
//! attempts:
//!
//! - `confirmed_v2`: some endpoint proved it speaks v2, so v1 endpoints are
//!   skipped from then on.
//! - `confirmed_tls_hosts`: hosts that completed a TLS exchange; their
//!   plaintext endpoints are skipped.
//! - the error to report if every endpoint fails: the latest substantive
//!   error, else the first capability-mismatch error. Once a substantive
//!   error is seen, capability-mismatch errors are ignored.
//!
//! The state is created per call and never shared between pulls.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;

use dray_reference::{validate_repo_name, Reference, DEFAULT_DOMAIN};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PullConfig;
use crate::endpoint::{ApiVersion, Endpoint};
use crate::error::{translate_pull_error, AttemptError, ImagePullError, PullError};
use crate::events::PullEvent;
use crate::image::ImageRecord;
use crate::inspect::RemoteImageInspect;
use crate::progress::ProgressEvent;
use crate::puller::{PullMode, PullOutcome};

// =============================================================================
// Fallback state
// =============================================================================

/// Why an endpoint was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// v1 endpoint while only schema 2 is acceptable.
    RequireSchema2,
    /// v1 endpoint after a v2 endpoint answered.
    ConfirmedV2,
    /// Plaintext endpoint for a host known to speak TLS.
    ConfirmedTls,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::RequireSchema2 => f.write_str("v1 endpoints are disabled"),
            SkipReason::ConfirmedV2 => f.write_str("v2 registry was detected"),
            SkipReason::ConfirmedTls => f.write_str("host/port appears to use TLS"),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug)]
pub enum Step {
    /// Try the next endpoint.
    Next,
    /// Stop and report this error.
    Abort(PullError),
}

/// Accumulated knowledge across the endpoint attempts of one pull.
#[derive(Debug, Default)]
pub struct FallbackState {
    pub confirmed_v2: bool,
    /// `host[:port]` of endpoints that completed a TLS exchange.
    pub confirmed_tls_hosts: HashSet<String>,
    discard_no_support: bool,
    last_error: Option<PullError>,
}

impl FallbackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `endpoint` should be attempted.
    pub fn admit(&self, endpoint: &Endpoint, require_schema2: bool) -> Option<SkipReason> {
        if endpoint.version == ApiVersion::V1 {
            if require_schema2 {
                return Some(SkipReason::RequireSchema2);
            }
            if self.confirmed_v2 {
                return Some(SkipReason::ConfirmedV2);
            }
        }
        if !endpoint.is_tls() && self.confirmed_tls_hosts.contains(&endpoint.host()) {
            return Some(SkipReason::ConfirmedTls);
        }
        None
    }

    /// Fold a failed attempt against `endpoint` into the state.
    ///
    /// `cancelled` reports whether the pull's cancellation signal had fired;
    /// a cancelled pull never falls back.
    pub fn absorb(mut self, endpoint: &Endpoint, failure: AttemptError, cancelled: bool) -> (Self, Step) {
        if cancelled {
            return (self, Step::Abort(PullError::Cancelled));
        }

        let fallback = match failure {
            AttemptError::Fatal(error) => return (self, Step::Abort(error)),
            AttemptError::Fallback(fallback) => fallback,
        };

        self.confirmed_v2 |= fallback.confirmed_v2;
        if fallback.transport_ok && endpoint.is_tls() {
            self.confirmed_tls_hosts.insert(endpoint.host());
        }

        let error = fallback.error;
        if !error.is_no_support() {
            self.discard_no_support = true;
            self.last_error = Some(error);
        } else if !self.discard_no_support
            && !self.last_error.as_ref().is_some_and(PullError::is_no_support)
        {
            self.last_error = Some(error);
        }
        (self, Step::Next)
    }

    /// Record a failure to build the puller for an endpoint.
    pub fn absorb_setup_error(mut self, error: PullError) -> Self {
        self.last_error = Some(error);
        self
    }

    /// The error to report once every endpoint has been tried.
    pub fn last_error(&self) -> Option<&PullError> {
        self.last_error.as_ref()
    }

    pub fn into_last_error(self) -> Option<PullError> {
        self.last_error
    }
}

// =============================================================================
// Orchestration
// =============================================================================

/// Pull `reference` and return the normalized image.
///
/// Unqualified references are tried against each default registry in
/// turn. The record is returned, not stored; see [`crate::ImageService`].
pub async fn pull(
    reference: &Reference,
    config: &PullConfig,
    cancel: &CancellationToken,
) -> Result<ImageRecord, ImagePullError> {
    pull_outcome(reference, config, cancel)
        .await
        .map(|outcome| outcome.record)
}

/// [`pull`], also reporting how many layers were downloaded.
pub async fn pull_outcome(
    reference: &Reference,
    config: &PullConfig,
    cancel: &CancellationToken,
) -> Result<PullOutcome, ImagePullError> {
    with_default_registries(reference, config, cancel, |qualified| async move {
        let outcome = pull_from_registry(&qualified, config, PullMode::Full, cancel).await?;

        if let Some(digest) = &outcome.record.manifest_digest {
            config.progress.emit(ProgressEvent::digest(digest));
        }
        config.progress.emit(ProgressEvent::finished(
            &outcome.record.reference.familiar_string(),
            outcome.layers_downloaded > 0,
        ));
        Ok(outcome)
    })
    .await
}

/// Fetch manifest and config of `reference` without any layer blobs.
pub async fn inspect(
    reference: &Reference,
    config: &PullConfig,
    cancel: &CancellationToken,
) -> Result<RemoteImageInspect, ImagePullError> {
    with_default_registries(reference, config, cancel, |qualified| async move {
        let outcome =
            pull_from_registry(&qualified, config, PullMode::MetadataOnly, cancel).await?;
        let registry = qualified.domain().unwrap_or(DEFAULT_DOMAIN).to_string();
        Ok(RemoteImageInspect::new(&outcome.record, &registry))
    })
    .await
}

async fn with_default_registries<T, F, Fut>(
    reference: &Reference,
    config: &PullConfig,
    cancel: &CancellationToken,
    attempt: F,
) -> Result<T, ImagePullError>
where
    F: Fn(Reference) -> Fut,
    Fut: Future<Output = Result<T, ImagePullError>>,
{
    if reference.is_fully_qualified() {
        return attempt(reference.clone()).await;
    }
    if config.default_registries.is_empty() {
        return Err(ImagePullError::NoRegistries);
    }
    validate_repo_name(reference).map_err(|e| ImagePullError::InvalidReference(e.to_string()))?;

    let mut last = ImagePullError::NoRegistries;
    for registry in &config.default_registries {
        if cancel.is_cancelled() {
            return Err(ImagePullError::Cancelled);
        }
        let qualified = match reference.qualify(registry) {
            Ok(qualified) => qualified,
            Err(e) => {
                warn!(
                    reference = %reference,
                    registry = %registry,
                    error = %e,
                    "failed to qualify reference"
                );
                last = ImagePullError::InvalidReference(e.to_string());
                continue;
            }
        };

        match attempt(qualified).await {
            Ok(value) => return Ok(value),
            Err(ImagePullError::Cancelled) => return Err(ImagePullError::Cancelled),
            Err(e) => {
                debug!(registry = %registry, error = %e, "default registry failed");
                last = e;
            }
        }
    }
    Err(last)
}

/// Run the endpoint loop for a fully qualified reference.
async fn pull_from_registry(
    reference: &Reference,
    config: &PullConfig,
    mode: PullMode,
    cancel: &CancellationToken,
) -> Result<PullOutcome, ImagePullError> {
    validate_repo_name(reference).map_err(|e| ImagePullError::InvalidReference(e.to_string()))?;
    let registry = reference.domain().unwrap_or(DEFAULT_DOMAIN);

    if mode == PullMode::Full {
        config
            .progress
            .emit(ProgressEvent::trying_to_pull(&reference.name()));
    }

    let endpoints = config
        .resolver
        .lookup_pull_endpoints(registry)
        .map_err(|e| translate_pull_error(e, reference))?;

    let mut state = FallbackState::new();
    for endpoint in &endpoints {
        if let Some(reason) = state.admit(endpoint, config.require_schema2) {
            debug!(endpoint = %endpoint, reason = %reason, "skipping endpoint");
            continue;
        }
        if cancel.is_cancelled() {
            return Err(ImagePullError::Cancelled);
        }

        debug!(
            repository = %reference.familiar_name(),
            endpoint = %endpoint,
            "trying to pull"
        );

        let puller = match config.pullers.new_puller(endpoint, reference, config, mode) {
            Ok(puller) => puller,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "could not set up endpoint");
                state = state.absorb_setup_error(e);
                continue;
            }
        };

        match puller.pull(reference, cancel).await {
            Ok(outcome) => {
                info!(
                    reference = %outcome.record.reference,
                    image_id = %outcome.record.id,
                    endpoint = %endpoint,
                    layers_downloaded = outcome.layers_downloaded,
                    "pull complete"
                );
                if mode == PullMode::Full {
                    config
                        .events
                        .log_pull(PullEvent::new(reference.to_string(), reference.name()));
                }
                return Ok(outcome);
            }
            Err(failure) => {
                let (next, step) = state.absorb(endpoint, failure, cancel.is_cancelled());
                state = next;
                match step {
                    Step::Next => {
                        if let Some(e) = state.last_error() {
                            warn!(endpoint = %endpoint, error = %e, "attempting next endpoint for pull after error");
                        }
                    }
                    Step::Abort(e) => {
                        error!(endpoint = %endpoint, error = %e, "not continuing with pull after error");
                        return Err(translate_pull_error(e, reference));
                    }
                }
            }
        }
    }

    Err(match state.into_last_error() {
        Some(e) => translate_pull_error(e, reference),
        None => ImagePullError::NoEndpoints {
            reference: reference.familiar_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use bytes::Bytes;
    use dray_digest::Digest;

    use crate::endpoint::EndpointResolver;
    use crate::error::{FallbackError, RegistryErrorCode};
    use crate::events::MemoryEventLog;
    use crate::image::ImageConfig;
    use crate::puller::{Puller, PullerFactory};

    fn endpoint(url: &str, version: ApiVersion) -> Endpoint {
        Endpoint::parse(url, version).unwrap()
    }

    fn no_support() -> AttemptError {
        AttemptError::classify(PullError::NoSupport("nope".into()), false, false)
    }

    fn unauthorized(confirmed_v2: bool, transport_ok: bool) -> AttemptError {
        AttemptError::classify(
            PullError::Registry {
                url: "https://registry.example.com/v2/".into(),
                status: 401,
                code: RegistryErrorCode::Unauthorized,
                message: "authentication required".into(),
            },
            confirmed_v2,
            transport_ok,
        )
    }

    fn integrity() -> AttemptError {
        AttemptError::classify(PullError::MalformedManifest("truncated".into()), true, true)
    }

    // -------------------------------------------------------------------------
    // The fold on its own
    // -------------------------------------------------------------------------

    #[test]
    fn test_confirmed_v2_skips_later_v1() {
        let v2 = endpoint("https://registry.example.com", ApiVersion::V2);
        let v1 = endpoint("https://registry.example.com", ApiVersion::V1);

        let state = FallbackState::new();
        assert_eq!(state.admit(&v1, false), None);

        let (state, step) = state.absorb(&v2, unauthorized(true, true), false);
        assert!(matches!(step, Step::Next));
        assert_eq!(state.admit(&v1, false), Some(SkipReason::ConfirmedV2));
    }

    #[test]
    fn test_tls_host_skips_plaintext() {
        let tls = endpoint("https://registry.example.com:5000", ApiVersion::V2);
        let plain = endpoint("http://registry.example.com:5000", ApiVersion::V2);
        let other = endpoint("http://other.example.com:5000", ApiVersion::V2);

        let (state, _) = FallbackState::new().absorb(&tls, unauthorized(false, true), false);
        assert_eq!(state.admit(&plain, false), Some(SkipReason::ConfirmedTls));
        assert_eq!(state.admit(&other, false), None);

        // A failed handshake proves nothing.
        let (state, _) = FallbackState::new().absorb(&tls, unauthorized(false, false), false);
        assert_eq!(state.admit(&plain, false), None);
    }

    #[test]
    fn test_require_schema2() {
        let v1 = endpoint("https://registry.example.com", ApiVersion::V1);
        assert_eq!(
            FallbackState::new().admit(&v1, true),
            Some(SkipReason::RequireSchema2)
        );
    }

    #[test]
    fn test_no_support_discarded_after_substantive_error() {
        let e = endpoint("https://registry.example.com", ApiVersion::V2);

        let (state, _) = FallbackState::new().absorb(&e, no_support(), false);
        assert!(state.last_error().unwrap().is_no_support());

        let (state, _) = state.absorb(&e, unauthorized(false, true), false);
        let (state, _) = state.absorb(&e, no_support(), false);
        assert!(matches!(
            state.last_error(),
            Some(PullError::Registry { status: 401, .. })
        ));
    }

    #[test]
    fn test_first_no_support_kept_while_nothing_substantive() {
        let e = endpoint("https://registry.example.com", ApiVersion::V1);
        let first = AttemptError::classify(PullError::NoSupport("first".into()), false, false);
        let (state, _) = FallbackState::new().absorb(&e, first, false);
        let (state, _) = state.absorb(&e, no_support(), false);
        assert!(matches!(state.last_error(), Some(PullError::NoSupport(m)) if m == "first"));
    }

    #[test]
    fn test_fatal_and_cancelled_abort() {
        let e = endpoint("https://registry.example.com", ApiVersion::V2);

        let (_, step) = FallbackState::new().absorb(&e, integrity(), false);
        assert!(matches!(step, Step::Abort(PullError::MalformedManifest(_))));

        let (_, step) = FallbackState::new().absorb(&e, unauthorized(true, true), true);
        assert!(matches!(step, Step::Abort(PullError::Cancelled)));
    }

    // -------------------------------------------------------------------------
    // The loop, with scripted pullers
    // -------------------------------------------------------------------------

    type Script = Arc<dyn Fn() -> Result<PullOutcome, AttemptError> + Send + Sync>;

    struct FixedEndpoints(Vec<Endpoint>);

    impl EndpointResolver for FixedEndpoints {
        fn lookup_pull_endpoints(&self, _registry: &str) -> Result<Vec<Endpoint>, PullError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct ScriptedPullers {
        scripts: HashMap<String, Script>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedPullers {
        fn on(mut self, endpoint: &Endpoint, script: Script) -> Self {
            self.scripts.insert(endpoint.to_string(), script);
            self
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    struct ScriptedPuller(Script);

    #[async_trait]
    impl Puller for ScriptedPuller {
        async fn pull(
            &self,
            _reference: &Reference,
            _cancel: &CancellationToken,
        ) -> Result<PullOutcome, AttemptError> {
            (self.0)()
        }
    }

    impl PullerFactory for ScriptedPullers {
        fn new_puller(
            &self,
            endpoint: &Endpoint,
            _reference: &Reference,
            _config: &PullConfig,
            _mode: PullMode,
        ) -> Result<Box<dyn Puller>, PullError> {
            self.attempts.lock().unwrap().push(endpoint.to_string());
            let script = self
                .scripts
                .get(&endpoint.to_string())
                .cloned()
                .unwrap_or_else(|| Arc::new(|| Err(no_support())));
            Ok(Box::new(ScriptedPuller(script)))
        }
    }

    fn success() -> Script {
        Arc::new(|| {
            let config_raw = Bytes::from_static(b"{}");
            Ok(PullOutcome {
                record: ImageRecord {
                    reference: "registry.example.com/app:1".parse().unwrap(),
                    id: Digest::sha256(&config_raw),
                    config: ImageConfig::default(),
                    config_raw,
                    layers: Vec::new(),
                    history: Vec::new(),
                    manifest_digest: Some(Digest::sha256(b"manifest")),
                },
                layers_downloaded: 1,
            })
        })
    }

    fn config(endpoints: Vec<Endpoint>, pullers: Arc<ScriptedPullers>) -> PullConfig {
        PullConfig::new()
            .with_resolver(Arc::new(FixedEndpoints(endpoints)))
            .with_pullers(pullers)
    }

    fn reference() -> Reference {
        "registry.example.com/app:1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_no_support_then_success() {
        let first = endpoint("https://mirror.example.com", ApiVersion::V2);
        let second = endpoint("https://registry.example.com", ApiVersion::V2);
        let pullers = Arc::new(
            ScriptedPullers::default()
                .on(&first, Arc::new(|| Err(no_support())))
                .on(&second, success()),
        );
        let events = Arc::new(MemoryEventLog::new());
        let config = config(vec![first, second], pullers.clone()).with_events(events.clone());

        let record = pull(&reference(), &config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.manifest_digest, Some(Digest::sha256(b"manifest")));
        assert_eq!(pullers.attempts().len(), 2);
        assert_eq!(events.events().len(), 1);
        assert_eq!(events.events()[0].repository, "registry.example.com/app");
    }

    #[tokio::test]
    async fn test_integrity_failure_stops_the_loop() {
        let first = endpoint("https://mirror.example.com", ApiVersion::V2);
        let second = endpoint("https://registry.example.com", ApiVersion::V2);
        let pullers = Arc::new(
            ScriptedPullers::default()
                .on(&first, Arc::new(|| Err(integrity())))
                .on(&second, success()),
        );
        let config = config(vec![first.clone(), second], pullers.clone());

        let err = pull(&reference(), &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImagePullError::Integrity(_)));
        assert_eq!(pullers.attempts(), vec![first.to_string()]);
    }

    #[tokio::test]
    async fn test_v1_skipped_after_v2_confirmed() {
        let v2 = endpoint("https://registry.example.com", ApiVersion::V2);
        let v1 = endpoint("https://registry.example.com", ApiVersion::V1);
        let pullers = Arc::new(
            ScriptedPullers::default()
                .on(&v2, Arc::new(|| Err(unauthorized(true, true))))
                .on(&v1, success()),
        );
        let config = config(vec![v2.clone(), v1], pullers.clone());

        let err = pull(&reference(), &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ImagePullError::Unauthorized {
                repository: "registry.example.com/app".into()
            }
        );
        assert_eq!(pullers.attempts(), vec![v2.to_string()]);
    }

    #[tokio::test]
    async fn test_plaintext_skipped_after_tls_confirmed() {
        let tls = endpoint("https://registry.example.com", ApiVersion::V2);
        let other = endpoint("https://mirror.example.com", ApiVersion::V2);
        let plain = endpoint("http://registry.example.com", ApiVersion::V2);
        let pullers = Arc::new(
            ScriptedPullers::default()
                .on(&tls, Arc::new(|| Err(unauthorized(false, true))))
                .on(&other, Arc::new(|| Err(no_support())))
                .on(&plain, success()),
        );
        let config = config(vec![tls.clone(), other.clone(), plain], pullers.clone());

        let err = pull(&reference(), &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImagePullError::Unauthorized { .. }));
        assert_eq!(pullers.attempts(), vec![tls.to_string(), other.to_string()]);
    }

    #[tokio::test]
    async fn test_empty_endpoint_list() {
        let pullers = Arc::new(ScriptedPullers::default());
        let config = config(Vec::new(), pullers);
        let err = pull(&reference(), &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ImagePullError::NoEndpoints {
                reference: "registry.example.com/app:1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let e = endpoint("https://registry.example.com", ApiVersion::V2);
        let pullers = Arc::new(ScriptedPullers::default().on(&e, success()));
        let config = config(vec![e], pullers.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pull(&reference(), &config, &cancel).await.unwrap_err();
        assert_eq!(err, ImagePullError::Cancelled);
        assert!(pullers.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_error_with_cancellation_is_not_retried() {
        let first = endpoint("https://mirror.example.com", ApiVersion::V2);
        let second = endpoint("https://registry.example.com", ApiVersion::V2);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let pullers = Arc::new(
            ScriptedPullers::default()
                .on(
                    &first,
                    Arc::new(move || {
                        trigger.cancel();
                        Err(AttemptError::Fallback(FallbackError {
                            error: PullError::NoSupport("interrupted".into()),
                            confirmed_v2: false,
                            transport_ok: false,
                        }))
                    }),
                )
                .on(&second, success()),
        );
        let config = config(vec![first, second], pullers.clone());

        let err = pull(&reference(), &config, &cancel).await.unwrap_err();
        assert_eq!(err, ImagePullError::Cancelled);
        assert_eq!(pullers.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_unqualified_reference_tries_default_registries() {
        let pullers = Arc::new(ScriptedPullers::default());
        let config = PullConfig::new()
            .with_resolver(Arc::new(FixedEndpoints(vec![endpoint(
                "https://registry.example.com",
                ApiVersion::V2,
            )])))
            .with_pullers(pullers.clone())
            .with_default_registries(["registry.example.com", "docker.io"]);

        let reference: Reference = "app:1".parse().unwrap();
        let err = pull(&reference, &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImagePullError::Failed(_)));
        assert_eq!(pullers.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_no_default_registries() {
        let config = PullConfig::new().with_default_registries(Vec::<String>::new());
        let reference: Reference = "app".parse().unwrap();
        let err = pull(&reference, &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ImagePullError::NoRegistries);
    }

    #[tokio::test]
    async fn test_reserved_name_rejected() {
        let config = PullConfig::new();
        let reference: Reference = "scratch".parse().unwrap();
        let err = pull(&reference, &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImagePullError::InvalidReference(_)));
    }
}
