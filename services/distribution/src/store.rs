//! Local persistence collaborators.
//!
//! The pull core only reads from these (`has_blob`, v1 ID lookups) and
//! writes content-addressed blobs it has already verified. Image records
//! and tags are written by the caller, see [`crate::ImageService`].

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dray_digest::{verify_bytes, Digest, DigestError, Verifier};
use dray_reference::Reference;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::image::ImageRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("refusing to store blob: {0}")]
    Digest(#[from] DigestError),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// =============================================================================
// Content store
// =============================================================================

/// Blob and image storage keyed by content digest.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn has_blob(&self, digest: &Digest) -> Result<bool, StoreError>;

    /// Store `data` under `digest`. Storing the same blob twice is a no-op.
    async fn put_blob(&self, digest: &Digest, data: Bytes) -> Result<(), StoreError>;

    /// Start writing the blob `digest` chunk by chunk. Nothing is visible
    /// under `digest` until [`BlobWriter::commit`] succeeds.
    async fn begin_blob<'a>(
        &'a self,
        digest: &Digest,
    ) -> Result<Box<dyn BlobWriter + 'a>, StoreError>;

    /// Persist an image record and return its local ID.
    async fn put_image(&self, record: &ImageRecord) -> Result<Digest, StoreError>;

    /// Point `reference` at the image `id`.
    async fn tag(&self, reference: &Reference, id: &Digest) -> Result<(), StoreError>;

    /// The image a reference currently points at.
    async fn resolve(&self, reference: &Reference) -> Result<Option<Digest>, StoreError>;
}

/// An in-progress blob write.
///
/// Call [`commit`](BlobWriter::commit) once all content is written, or
/// [`abort`](BlobWriter::abort) to throw it away.
#[async_trait]
pub trait BlobWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError>;

    /// Check the content against the digest and publish it. On a mismatch
    /// the content is discarded.
    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn abort(&mut self);
}

/// In-memory content store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<Digest, Bytes>>,
    images: RwLock<HashMap<Digest, ImageRecord>>,
    references: RwLock<HashMap<String, Digest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn blob(&self, digest: &Digest) -> Option<Bytes> {
        self.blobs.read().await.get(digest).cloned()
    }

    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn image(&self, id: &Digest) -> Option<ImageRecord> {
        self.images.read().await.get(id).cloned()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn has_blob(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(self.blobs.read().await.contains_key(digest))
    }

    async fn put_blob(&self, digest: &Digest, data: Bytes) -> Result<(), StoreError> {
        verify_bytes(digest, &data)?;
        self.blobs.write().await.entry(digest.clone()).or_insert(data);
        Ok(())
    }

    async fn begin_blob<'a>(
        &'a self,
        digest: &Digest,
    ) -> Result<Box<dyn BlobWriter + 'a>, StoreError> {
        Ok(Box::new(MemoryBlobWriter {
            store: self,
            digest: digest.clone(),
            buf: BytesMut::new(),
        }))
    }

    async fn put_image(&self, record: &ImageRecord) -> Result<Digest, StoreError> {
        self.images
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record.id.clone())
    }

    async fn tag(&self, reference: &Reference, id: &Digest) -> Result<(), StoreError> {
        self.references
            .write()
            .await
            .insert(reference.to_string(), id.clone());
        Ok(())
    }

    async fn resolve(&self, reference: &Reference) -> Result<Option<Digest>, StoreError> {
        Ok(self.references.read().await.get(&reference.to_string()).cloned())
    }
}

struct MemoryBlobWriter<'a> {
    store: &'a MemoryStore,
    digest: Digest,
    buf: BytesMut,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter<'_> {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let data = self.buf.split().freeze();
        self.store.put_blob(&self.digest, data).await
    }

    async fn abort(&mut self) {
        self.buf.clear();
    }
}

/// Filesystem content store.
///
/// Layout under the root directory:
///
/// ```text
/// blobs/<algorithm>/<hex>
/// images/<hex>.json
/// repositories.json
/// ```
///
/// Every file is written to a temporary name and renamed into place. Blobs
/// written through [`ContentStore::begin_blob`] are hashed as they reach the
/// temporary file and only renamed once the digest matches.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    references: Mutex<()>,
    tmp_seq: AtomicU64,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["blobs", "images"] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(Self {
            root,
            references: Mutex::new(()),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.encoded())
    }

    fn image_path(&self, id: &Digest) -> PathBuf {
        self.root
            .join("images")
            .join(format!("{}.json", id.encoded()))
    }

    fn references_path(&self) -> PathBuf {
        self.root.join("repositories.json")
    }

    /// Create `dest`'s directory and pick a fresh temporary name beside it.
    async fn tmp_path(&self, dest: &Path) -> Result<PathBuf, StoreError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        Ok(dest.with_extension(format!("{}.tmp", seq)))
    }

    async fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
        let tmp = self.tmp_path(dest).await?;
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| StoreError::io(dest, e))
    }

    async fn read_references(&self) -> Result<HashMap<String, Digest>, StoreError> {
        let path = self.references_path();
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

#[async_trait]
impl ContentStore for FsStore {
    async fn has_blob(&self, digest: &Digest) -> Result<bool, StoreError> {
        let path = self.blob_path(digest);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))
    }

    async fn put_blob(&self, digest: &Digest, data: Bytes) -> Result<(), StoreError> {
        if self.has_blob(digest).await? {
            debug!(digest = %digest, "blob already stored");
            return Ok(());
        }
        verify_bytes(digest, &data)?;
        self.write_atomic(&self.blob_path(digest), &data).await
    }

    async fn begin_blob<'a>(
        &'a self,
        digest: &Digest,
    ) -> Result<Box<dyn BlobWriter + 'a>, StoreError> {
        let dest = self.blob_path(digest);
        let tmp = self.tmp_path(&dest).await?;
        let file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        Ok(Box::new(FsBlobWriter {
            verifier: Verifier::new(digest),
            file: Some(file),
            tmp,
            dest,
        }))
    }

    async fn put_image(&self, record: &ImageRecord) -> Result<Digest, StoreError> {
        self.put_blob(&record.id, record.config_raw.clone()).await?;
        let json = serde_json::to_vec_pretty(record)?;
        self.write_atomic(&self.image_path(&record.id), &json).await?;
        Ok(record.id.clone())
    }

    async fn tag(&self, reference: &Reference, id: &Digest) -> Result<(), StoreError> {
        let _guard = self.references.lock().await;
        let mut references = self.read_references().await?;
        references.insert(reference.to_string(), id.clone());
        let json = serde_json::to_vec_pretty(&references)?;
        self.write_atomic(&self.references_path(), &json).await
    }

    async fn resolve(&self, reference: &Reference) -> Result<Option<Digest>, StoreError> {
        let _guard = self.references.lock().await;
        Ok(self.read_references().await?.remove(&reference.to_string()))
    }
}

struct FsBlobWriter {
    verifier: Verifier,
    file: Option<tokio::fs::File>,
    tmp: PathBuf,
    dest: PathBuf,
}

impl FsBlobWriter {
    async fn discard(&mut self) {
        self.file = None;
        if let Err(e) = tokio::fs::remove_file(&self.tmp).await {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.tmp.display(), error = %e, "failed to remove temporary blob");
            }
        }
    }
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        let file = self.file.as_mut().ok_or_else(|| {
            StoreError::io(
                &self.tmp,
                io::Error::new(io::ErrorKind::BrokenPipe, "blob writer already closed"),
            )
        })?;
        file.write_all(chunk)
            .await
            .map_err(|e| StoreError::io(&self.tmp, e))?;
        self.verifier.update(chunk);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let Some(mut file) = self.file.take() else {
            return Err(StoreError::io(
                &self.tmp,
                io::Error::new(io::ErrorKind::BrokenPipe, "blob writer already closed"),
            ));
        };
        let flushed = file.flush().await;
        drop(file);
        if let Err(e) = flushed {
            self.discard().await;
            return Err(StoreError::io(&self.tmp, e));
        }
        if let Err(e) = self.verifier.clone().finish() {
            self.discard().await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&self.tmp, &self.dest).await {
            self.discard().await;
            return Err(StoreError::io(&self.dest, e));
        }
        debug!(path = %self.dest.display(), size = self.verifier.written(), "blob stored");
        Ok(())
    }

    async fn abort(&mut self) {
        self.discard().await;
    }
}

// =============================================================================
// Metadata store
// =============================================================================

/// Mapping between legacy v1 image IDs and blob digests, per registry.
///
/// Shared by concurrent pulls; implementations must be safe for
/// concurrent access.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn digest_for_v1_id(&self, registry: &str, v1_id: &str) -> Option<Digest>;

    async fn set_v1_id(&self, registry: &str, v1_id: &str, digest: &Digest);
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    v1_ids: RwLock<HashMap<(String, String), Digest>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn digest_for_v1_id(&self, registry: &str, v1_id: &str) -> Option<Digest> {
        self.v1_ids
            .read()
            .await
            .get(&(registry.to_string(), v1_id.to_string()))
            .cloned()
    }

    async fn set_v1_id(&self, registry: &str, v1_id: &str, digest: &Digest) {
        self.v1_ids
            .write()
            .await
            .insert((registry.to_string(), v1_id.to_string()), digest.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageConfig, LayerRef};

    fn record(config: &'static [u8]) -> ImageRecord {
        ImageRecord {
            reference: "registry.example.com/app:1".parse().unwrap(),
            id: Digest::sha256(config),
            config: ImageConfig::default(),
            config_raw: Bytes::from_static(config),
            layers: vec![LayerRef {
                digest: Digest::sha256(b"layer"),
                size: Some(5),
                media_type: crate::manifest::MEDIA_TYPE_LAYER.to_string(),
            }],
            history: Vec::new(),
            manifest_digest: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_rejects_wrong_content() {
        let store = MemoryStore::new();
        let digest = Digest::sha256(b"expected");
        let err = store
            .put_blob(&digest, Bytes::from_static(b"other"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Digest(_)));
        assert!(!store.has_blob(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_tag_and_resolve() {
        let store = MemoryStore::new();
        let record = record(b"{}");
        let id = store.put_image(&record).await.unwrap();
        store.tag(&record.reference, &id).await.unwrap();

        assert_eq!(store.resolve(&record.reference).await.unwrap(), Some(id.clone()));
        assert_eq!(store.image(&id).await, Some(record));
    }

    #[tokio::test]
    async fn test_fs_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();

        let data = Bytes::from_static(b"layer");
        let digest = Digest::sha256(&data);
        store.put_blob(&digest, data.clone()).await.unwrap();
        store.put_blob(&digest, data.clone()).await.unwrap();

        let path = dir.path().join("blobs").join("sha256").join(digest.encoded());
        assert_eq!(std::fs::read(&path).unwrap(), data.as_ref());
        assert!(store.has_blob(&digest).await.unwrap());

        let record = record(br#"{"os":"linux"}"#);
        let id = store.put_image(&record).await.unwrap();
        assert!(dir
            .path()
            .join("images")
            .join(format!("{}.json", id.encoded()))
            .exists());
        assert!(store.has_blob(&id).await.unwrap());

        store.tag(&record.reference, &id).await.unwrap();
        let reopened = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.resolve(&record.reference).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_fs_store_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let data = Bytes::from_static(b"content");
        store.put_blob(&Digest::sha256(&data), data).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("blobs").join("sha256"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(".tmp"));
    }

    async fn write_chunks(
        store: &dyn ContentStore,
        digest: &Digest,
        chunks: &[&[u8]],
    ) -> Result<(), StoreError> {
        let mut writer = store.begin_blob(digest).await?;
        for chunk in chunks {
            writer.write(chunk).await?;
        }
        writer.commit().await
    }

    fn blob_dir_entries(root: &Path) -> Vec<String> {
        std::fs::read_dir(root.join("blobs").join("sha256"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_fs_store_streams_blob_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let digest = Digest::sha256(b"layer contents");

        write_chunks(&store, &digest, &[b"layer ", b"con", b"tents"])
            .await
            .unwrap();

        assert!(store.has_blob(&digest).await.unwrap());
        assert_eq!(std::fs::read(store.blob_path(&digest)).unwrap(), b"layer contents");
        assert_eq!(blob_dir_entries(dir.path()), vec![digest.encoded().to_string()]);
    }

    #[tokio::test]
    async fn test_fs_store_streamed_mismatch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let digest = Digest::sha256(b"layer contents");

        let err = write_chunks(&store, &digest, &[b"layer ", b"c0ntents"])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Digest(DigestError::Mismatch { .. })));
        assert!(!store.has_blob(&digest).await.unwrap());
        assert!(blob_dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_aborted_blob_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsStore::open(dir.path()).await.unwrap();
        let memory = MemoryStore::new();
        let digest = Digest::sha256(b"partial");

        for store in [&fs as &dyn ContentStore, &memory] {
            let mut writer = store.begin_blob(&digest).await.unwrap();
            writer.write(b"part").await.unwrap();
            writer.abort().await;
            assert!(!store.has_blob(&digest).await.unwrap());
        }
        assert!(blob_dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_streamed_blob() {
        let store = MemoryStore::new();
        let digest = Digest::sha256(b"layer contents");

        let err = write_chunks(&store, &digest, &[b"layer"]).await.unwrap_err();
        assert!(matches!(err, StoreError::Digest(_)));
        assert_eq!(store.blob_count().await, 0);

        write_chunks(&store, &digest, &[b"layer", b" contents"])
            .await
            .unwrap();
        assert_eq!(
            store.blob(&digest).await.unwrap(),
            Bytes::from_static(b"layer contents")
        );
    }

    #[tokio::test]
    async fn test_metadata_store_is_per_registry() {
        let store = MemoryMetadataStore::new();
        let digest = Digest::sha256(b"layer");
        store.set_v1_id("registry.example.com", "abc", &digest).await;

        assert_eq!(
            store.digest_for_v1_id("registry.example.com", "abc").await,
            Some(digest)
        );
        assert_eq!(store.digest_for_v1_id("other.example.com", "abc").await, None);
    }
}
