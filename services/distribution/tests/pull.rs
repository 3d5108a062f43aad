//! End-to-end pulls against an in-process registry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use dray_distribution::progress::ChannelProgress;
use dray_distribution::store::ContentStore;
use dray_distribution::{
    inspect, pull, pull_outcome, FsStore, ImagePullError, ImageService, MemoryStore, Platform,
};
use dray_testing::fixtures::{manifest_list, MEDIA_TYPE_MANIFEST};
use dray_testing::{FakeRegistry, ImageFixture};
use rstest::rstest;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use common::{config, reference, v2};

#[tokio::test]
async fn test_pull_current_manifest() {
    let registry = FakeRegistry::start().await;
    let image = ImageFixture::new("linux", "amd64", &["base layer", "app layer"]);
    registry.push_image("team/app", "1.0", &image).await;

    let store = Arc::new(MemoryStore::new());
    let (progress, mut events) = ChannelProgress::new();
    let config = config(vec![v2(&registry)], store.clone()).with_progress(Arc::new(progress));
    let reference = reference(&registry, "team/app:1.0");

    let record = pull(&reference, &config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(record.id, image.config.digest);
    assert_eq!(record.manifest_digest, Some(image.manifest.digest.clone()));
    assert_eq!(record.config.architecture, "amd64");
    assert_eq!(record.history.len(), 2);
    assert_eq!(
        record.layers.iter().map(|l| &l.digest).collect::<Vec<_>>(),
        image.layers.iter().map(|l| &l.digest).collect::<Vec<_>>()
    );
    for layer in &image.layers {
        assert!(store.has_blob(&layer.digest).await.unwrap());
    }

    let mut messages = Vec::new();
    while let Ok(event) = events.try_recv() {
        messages.push(event.to_string());
    }
    assert_eq!(
        messages.first().map(String::as_str),
        Some(format!("Trying to pull repository {} ...", reference.name()).as_str())
    );
    assert!(messages.contains(&format!("Digest: {}", image.manifest.digest)));
    assert_eq!(
        messages.last(),
        Some(&format!(
            "Status: Downloaded newer image for {}",
            reference.familiar_string()
        ))
    );
}

#[tokio::test]
async fn test_second_pull_is_up_to_date() {
    let registry = FakeRegistry::start().await;
    let image = ImageFixture::new("linux", "amd64", &["only layer"]);
    registry.push_image("team/app", "1.0", &image).await;

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store);
    let reference = reference(&registry, "team/app:1.0");
    let cancel = CancellationToken::new();

    let first = pull_outcome(&reference, &config, &cancel).await.unwrap();
    let second = pull_outcome(&reference, &config, &cancel).await.unwrap();

    assert_eq!(first.layers_downloaded, 1);
    assert_eq!(second.layers_downloaded, 0);
    assert_eq!(first.record.id, second.record.id);
    let blob_path = format!("/v2/team/app/blobs/{}", image.layers[0].digest);
    assert_eq!(registry.hits(&blob_path).await, 1);
}

#[tokio::test]
async fn test_pull_by_digest() {
    let registry = FakeRegistry::start().await;
    let image = ImageFixture::new("linux", "amd64", &["layer"]);
    registry.push_image("team/app", "1.0", &image).await;

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store);
    let reference = reference(
        &registry,
        &format!("team/app@{}", image.manifest.digest),
    );

    let record = pull(&reference, &config, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(record.manifest_digest, Some(image.manifest.digest));
    assert_eq!(record.reference.digest(), reference.digest());
}

#[tokio::test]
async fn test_untagged_reference_prefers_latest() {
    let registry = FakeRegistry::start().await;
    let image = ImageFixture::new("linux", "amd64", &["layer"]);
    registry.tags("team/app", &["1.0", "latest", "2.0"]).await;
    registry.push_image("team/app", "latest", &image).await;

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store);

    let record = pull(
        &reference(&registry, "team/app"),
        &config,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(record.reference.tag(), Some("latest"));
}

#[tokio::test]
async fn test_manifest_list_selects_platform() {
    let registry = FakeRegistry::start().await;
    let amd64 = ImageFixture::new("linux", "amd64", &["amd64 layer"]);
    let arm64 = ImageFixture::new("linux", "arm64", &["arm64 layer"]);
    let list = manifest_list(&[&amd64, &arm64]);
    registry
        .push_list("team/app", "1.0", &list, &[&amd64, &arm64])
        .await;

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store.clone())
        .with_platform(Platform::new("linux", "arm64"));

    let record = pull(
        &reference(&registry, "team/app:1.0"),
        &config,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(record.config.architecture, "arm64");
    assert_eq!(record.id, arm64.config.digest);
    assert_eq!(record.manifest_digest, Some(list.digest));
    assert!(store.has_blob(&arm64.layers[0].digest).await.unwrap());
    assert!(!store.has_blob(&amd64.layers[0].digest).await.unwrap());
}

#[tokio::test]
async fn test_no_matching_platform_is_integrity_error() {
    let registry = FakeRegistry::start().await;
    let amd64 = ImageFixture::new("linux", "amd64", &["amd64 layer"]);
    let list = manifest_list(&[&amd64]);
    registry.push_list("team/app", "1.0", &list, &[&amd64]).await;

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store)
        .with_platform(Platform::new("linux", "s390x"));

    let err = pull(
        &reference(&registry, "team/app:1.0"),
        &config,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ImagePullError::Integrity(_)));
}

#[tokio::test]
async fn test_concurrent_pulls_are_independent() {
    let registry = FakeRegistry::start().await;
    let images: Vec<ImageFixture> = (0..3)
        .map(|i| {
            let own = format!("layer of image {}", i);
            ImageFixture::new("linux", "amd64", &["shared base", own.as_str()])
        })
        .collect();
    for (i, image) in images.iter().enumerate() {
        registry
            .push_image("team/app", &format!("1.{}", i), image)
            .await;
    }

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store.clone());
    let cancel = CancellationToken::new();
    let references: Vec<_> = (0..3)
        .map(|i| reference(&registry, &format!("team/app:1.{}", i)))
        .collect();

    let (a, b, c) = tokio::join!(
        pull(&references[0], &config, &cancel),
        pull(&references[1], &config, &cancel),
        pull(&references[2], &config, &cancel),
    );

    for ((record, image), reference) in [a.unwrap(), b.unwrap(), c.unwrap()]
        .iter()
        .zip(&images)
        .zip(&references)
    {
        assert_eq!(record.id, image.config.digest);
        assert_eq!(record.reference.tag(), reference.tag());
    }
    // One shared base plus one layer per image.
    assert_eq!(store.blob_count().await, 4);
}

#[tokio::test]
async fn test_cancellation_stops_a_slow_pull() {
    let registry = FakeRegistry::start().await;
    let image = ImageFixture::new("linux", "amd64", &["slow layer"]);
    Mock::given(method("GET"))
        .and(path(format!("/v2/team/app/blobs/{}", image.layers[0].digest)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(image.layers[0].data.clone())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(registry.server())
        .await;
    registry.push_image("team/app", "1.0", &image).await;

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store.clone());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let reference = reference(&registry, "team/app:1.0");
    let err = tokio::time::timeout(Duration::from_secs(10), pull(&reference, &config, &cancel))
        .await
        .expect("pull did not observe cancellation")
        .unwrap_err();

    assert_eq!(err, ImagePullError::Cancelled);
    assert!(!store.has_blob(&image.layers[0].digest).await.unwrap());
}

#[rstest]
#[case::config_missing(false)]
#[case::config_tampered(true)]
#[tokio::test]
async fn test_config_failure_stops_layer_download(#[case] tampered: bool) {
    let registry = FakeRegistry::start().await;
    let image = ImageFixture::new("linux", "amd64", &["slow layer"]);
    Mock::given(method("GET"))
        .and(path(format!("/v2/team/app/blobs/{}", image.layers[0].digest)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(image.layers[0].data.clone())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(registry.server())
        .await;
    if tampered {
        registry
            .blob_as("team/app", &image.config.digest, b"not the config")
            .await;
    }
    registry
        .manifest("team/app", "1.0", MEDIA_TYPE_MANIFEST, &image.manifest.data)
        .await;

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store.clone());
    let reference = reference(&registry, "team/app:1.0");

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        pull(&reference, &config, &CancellationToken::new()),
    )
    .await
    .expect("config failure did not stop the layer download")
    .unwrap_err();

    assert_ne!(err, ImagePullError::Cancelled);
    if tampered {
        assert!(matches!(err, ImagePullError::Integrity(_)), "{:?}", err);
    } else {
        assert!(matches!(err, ImagePullError::Failed(_)), "{:?}", err);
    }
    assert!(!store.has_blob(&image.layers[0].digest).await.unwrap());
    assert_eq!(store.blob_count().await, 0);
}

#[tokio::test]
async fn test_inspect_skips_layers() {
    let registry = FakeRegistry::start().await;
    let image = ImageFixture::new("linux", "amd64", &["big layer"]);
    registry.push_image("team/app", "1.0", &image).await;

    let store = Arc::new(MemoryStore::new());
    let config = config(vec![v2(&registry)], store.clone());

    let inspected = inspect(
        &reference(&registry, "team/app:1.0"),
        &config,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(inspected.id, image.config.digest);
    assert_eq!(inspected.registry, registry.host());
    assert_eq!(inspected.layers, vec![image.layers[0].digest.clone()]);
    assert_eq!(inspected.size, image.layers[0].size() as u64);
    assert_eq!(inspected.repo_digests.len(), 1);

    let layer_path = format!("/v2/team/app/blobs/{}", image.layers[0].digest);
    assert_eq!(registry.hits(&layer_path).await, 0);
    assert_eq!(store.blob_count().await, 0);
}

#[tokio::test]
async fn test_pull_and_store_on_disk() {
    let registry = FakeRegistry::start().await;
    let image = ImageFixture::new("linux", "amd64", &["layer on disk"]);
    registry.push_image("team/app", "1.0", &image).await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path()).await.unwrap());
    let config = common::config(vec![v2(&registry)], Arc::new(MemoryStore::new()))
        .with_store(store.clone());
    let reference = reference(&registry, "team/app:1.0");

    let record = ImageService::new(config)
        .pull_and_store(&reference, &CancellationToken::new())
        .await
        .unwrap();

    assert!(store.blob_path(&image.layers[0].digest).exists());
    assert_eq!(store.resolve(&reference).await.unwrap(), Some(record.id));
}
