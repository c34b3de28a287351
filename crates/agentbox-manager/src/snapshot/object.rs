use super::{sha256_hex, Result, SnapshotPut, SnapshotStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

const ZSTD_LEVEL: i32 = 3;

fn backend(err: object_store::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Snapshot store over any `object_store` backend. Archives are
/// zstd-compressed at rest.
#[derive(Clone)]
pub struct ObjectSnapshotStore {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    prefix: Path,
}

impl ObjectSnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, signer: Option<Arc<dyn Signer>>, prefix: Path) -> Self {
        Self {
            store,
            signer,
            prefix,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), None, Path::from(""))
    }

    pub fn local(root: impl AsRef<std::path::Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| StoreError::Backend(format!("{}: {e}", root.display())))?;
        let store = LocalFileSystem::new_with_prefix(root).map_err(backend)?;
        Ok(Self::new(Arc::new(store), None, Path::from("")))
    }

    /// S3-compatible bucket; credentials, region and endpoint come from the
    /// standard `AWS_*` environment variables.
    pub fn s3(bucket: &str, prefix: &str) -> Result<Self> {
        let s3 = Arc::new(
            AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .map_err(backend)?,
        );
        Ok(Self::new(s3.clone(), Some(s3), Path::from(prefix)))
    }

    /// `memory://`, `file:///var/lib/agentbox/snapshots` or `s3://bucket/prefix`.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| StoreError::Unsupported(format!("invalid snapshot URL {url}: {e}")))?;
        let store = match parsed.scheme() {
            "memory" => Self::in_memory(),
            "file" => Self::local(parsed.path())?,
            "s3" => {
                let bucket = parsed.host_str().ok_or_else(|| {
                    StoreError::Unsupported(format!("missing bucket in {url}"))
                })?;
                Self::s3(bucket, parsed.path().trim_matches('/'))?
            }
            scheme => {
                return Err(StoreError::Unsupported(format!(
                    "snapshot URL scheme {scheme}"
                )))
            }
        };
        info!(scheme = parsed.scheme(), "Snapshot store configured");
        Ok(store)
    }

    fn path(&self, key: &str) -> Path {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.prefix.clone(), |path, part| path.child(part))
    }
}

#[async_trait]
impl SnapshotStore for ObjectSnapshotStore {
    #[instrument(skip(self, archive), fields(bytes = archive.len()))]
    async fn put(&self, key: &str, archive: Bytes) -> Result<SnapshotPut> {
        let size_bytes = archive.len() as u64;
        let (compressed, sha256) = tokio::task::spawn_blocking(move || {
            zstd::encode_all(&archive[..], ZSTD_LEVEL).map(|c| (c, sha256_hex(&archive)))
        })
        .await
        .map_err(|e| StoreError::Backend(format!("compression task failed: {e}")))?
        .map_err(|e| StoreError::Backend(format!("compression failed: {e}")))?;

        let stored_bytes = compressed.len() as u64;
        self.store
            .put(&self.path(key), PutPayload::from(compressed))
            .await
            .map_err(backend)?;

        debug!(key, size_bytes, stored_bytes, "Snapshot uploaded");
        Ok(SnapshotPut {
            size_bytes,
            stored_bytes,
            sha256,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let compressed = match self.store.get(&self.path(key)).await {
            Ok(result) => result.bytes().await.map_err(backend)?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(backend(e)),
        };

        let key_owned = key.to_string();
        let archive = tokio::task::spawn_blocking(move || zstd::decode_all(&compressed[..]))
            .await
            .map_err(|e| StoreError::Backend(format!("decompression task failed: {e}")))?
            .map_err(|e| StoreError::Corrupt(key_owned, e.to_string()))?;
        Ok(Some(Bytes::from(archive)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&self.path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(backend(e)),
        }
    }

    async fn signed_download_url(&self, key: &str, ttl: Duration) -> Result<Url> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| StoreError::Unsupported("signed download URLs".into()))?;
        if !self.exists(key).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        signer
            .signed_url(http::Method::GET, &self.path(key), ttl)
            .await
            .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbox_common::snapshot_key;

    #[tokio::test]
    async fn test_put_get_is_byte_identical() {
        let store = ObjectSnapshotStore::in_memory();
        let key = snapshot_key("alice", "coder");
        let archive = Bytes::from(vec![7u8; 64 * 1024]);

        assert!(!store.exists(&key).await.unwrap());
        let put = store.put(&key, archive.clone()).await.unwrap();
        assert_eq!(put.size_bytes, archive.len() as u64);
        assert!(put.stored_bytes < put.size_bytes);
        assert_eq!(put.sha256, sha256_hex(&archive));

        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap(), archive);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_none() {
        let store = ObjectSnapshotStore::in_memory();
        assert_eq!(store.get("snapshots/nobody/none.tar.zst").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectSnapshotStore::local(dir.path()).unwrap();
        let key = snapshot_key("bob", "writer");

        store.put(&key, Bytes::from_static(b"first")).await.unwrap();
        store.put(&key, Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap().unwrap(),
            Bytes::from_static(b"second")
        );
        assert!(dir
            .path()
            .join("snapshots/bob/writer.tar.zst")
            .exists());
    }

    #[tokio::test]
    async fn test_corrupt_object_is_reported() {
        let inner: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = ObjectSnapshotStore::new(inner.clone(), None, Path::from(""));
        let key = snapshot_key("carol", "coder");
        inner
            .put(&Path::from(key.as_str()), PutPayload::from_static(b"not zstd"))
            .await
            .unwrap();

        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::Corrupt(_, _))
        ));
    }

    #[tokio::test]
    async fn test_signed_url_needs_signer() {
        let store = ObjectSnapshotStore::in_memory();
        assert!(matches!(
            store
                .signed_download_url("snapshots/a/b.tar.zst", Duration::from_secs(60))
                .await,
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_from_url_schemes() {
        assert!(ObjectSnapshotStore::from_url("memory://").is_ok());
        assert!(matches!(
            ObjectSnapshotStore::from_url("ftp://example.com/x"),
            Err(StoreError::Unsupported(_))
        ));
    }
}
