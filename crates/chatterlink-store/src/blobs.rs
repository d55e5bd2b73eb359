//! Content-addressed blob storage.
//!
//! Blobs are opaque (already encrypted) byte strings addressed by the hex
//! BLAKE3 digest of their contents. Pinned blobs are the ones the node has
//! promised to keep; unpinning only drops that promise.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Hex BLAKE3 digest of the blob contents.
pub type ContentId = String;

pub fn content_id(bytes: &[u8]) -> ContentId {
    blake3::hash(bytes).to_hex().to_string()
}

fn validate_cid(cid: &str) -> Result<()> {
    if cid.len() == 64 && cid.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(StoreError::InvalidContentId(cid.to_string()))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<ContentId>;

    async fn get(&self, cid: &str) -> Result<Vec<u8>>;

    async fn pin(&self, cid: &str) -> Result<()>;

    async fn unpin(&self, cid: &str) -> Result<()>;

    async fn is_pinned(&self, cid: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<ContentId, Vec<u8>>>>,
    pins: Arc<RwLock<HashSet<ContentId>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<ContentId> {
        let cid = content_id(bytes);
        self.blobs.write().await.insert(cid.clone(), bytes.to_vec());
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(cid)
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound(cid.to_string()))
    }

    async fn pin(&self, cid: &str) -> Result<()> {
        if !self.blobs.read().await.contains_key(cid) {
            return Err(StoreError::BlobNotFound(cid.to_string()));
        }
        self.pins.write().await.insert(cid.to_string());
        Ok(())
    }

    async fn unpin(&self, cid: &str) -> Result<()> {
        self.pins.write().await.remove(cid);
        Ok(())
    }

    async fn is_pinned(&self, cid: &str) -> Result<bool> {
        Ok(self.pins.read().await.contains(cid))
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(StoreError::InvalidContentId(
                    "path traversal detected".to_string(),
                ));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(StoreError::InvalidContentId(
            "path traversal detected".to_string(),
        ));
    }
    Ok(resolved)
}

/// Blobs as files named by content id, pins as empty marker files under
/// `pins/`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl FsBlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self> {
        fs::create_dir_all(base_path.join("pins")).await?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, cid: &str) -> Result<PathBuf> {
        validate_cid(cid)?;
        ensure_within(&self.base_path, &self.base_path.join(cid))
    }

    fn pin_path(&self, cid: &str) -> Result<PathBuf> {
        validate_cid(cid)?;
        ensure_within(&self.base_path, &self.base_path.join("pins").join(cid))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<ContentId> {
        if bytes.len() > self.max_size {
            return Err(StoreError::BlobTooLarge {
                size: bytes.len(),
                max: self.max_size,
            });
        }

        let cid = content_id(bytes);
        let path = self.blob_path(&cid)?;
        if !fs::try_exists(&path).await? {
            fs::write(&path, bytes).await?;
        }

        debug!(cid = %cid, size = bytes.len(), "Stored blob");
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(cid)?;
        if !fs::try_exists(&path).await? {
            return Err(StoreError::BlobNotFound(cid.to_string()));
        }

        let data = fs::read(&path).await?;
        if content_id(&data) != cid.to_ascii_lowercase() {
            return Err(StoreError::Corrupted(cid.to_string()));
        }

        debug!(cid = %cid, size = data.len(), "Retrieved blob");
        Ok(data)
    }

    async fn pin(&self, cid: &str) -> Result<()> {
        if !fs::try_exists(self.blob_path(cid)?).await? {
            return Err(StoreError::BlobNotFound(cid.to_string()));
        }
        fs::write(self.pin_path(cid)?, b"").await?;
        debug!(cid = %cid, "Pinned blob");
        Ok(())
    }

    async fn unpin(&self, cid: &str) -> Result<()> {
        let path = self.pin_path(cid)?;
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
            debug!(cid = %cid, "Unpinned blob");
        }
        Ok(())
    }

    async fn is_pinned(&self, cid: &str) -> Result<bool> {
        Ok(fs::try_exists(self.pin_path(cid)?).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fs_store() -> (FsBlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf(), 1024 * 1024)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _dir) = fs_store().await;
        let cid = store.put(b"encrypted-blob-data").await.unwrap();
        assert_eq!(cid, content_id(b"encrypted-blob-data"));
        assert_eq!(store.get(&cid).await.unwrap(), b"encrypted-blob-data");
    }

    #[tokio::test]
    async fn test_pin_unpin() {
        let (store, _dir) = fs_store().await;
        let cid = store.put(b"keep me").await.unwrap();

        assert!(!store.is_pinned(&cid).await.unwrap());
        store.pin(&cid).await.unwrap();
        assert!(store.is_pinned(&cid).await.unwrap());
        store.unpin(&cid).await.unwrap();
        assert!(!store.is_pinned(&cid).await.unwrap());
        // blob survives unpinning
        assert!(store.get(&cid).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_found_and_invalid_ids() {
        let (store, _dir) = fs_store().await;
        let missing = content_id(b"never stored");
        assert!(matches!(
            store.get(&missing).await,
            Err(StoreError::BlobNotFound(_))
        ));
        assert!(matches!(
            store.get("../../etc/passwd").await,
            Err(StoreError::InvalidContentId(_))
        ));
        assert!(store.pin(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_size_limit() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf(), 4).await.unwrap();
        assert!(matches!(
            store.put(b"too large").await,
            Err(StoreError::BlobTooLarge { size: 9, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let (store, dir) = fs_store().await;
        let cid = store.put(b"original").await.unwrap();
        std::fs::write(dir.path().join(&cid), b"tampered").unwrap();
        assert!(matches!(store.get(&cid).await, Err(StoreError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlobStore::new();
        let cid = store.put(b"abc").await.unwrap();
        assert_eq!(store.get(&cid).await.unwrap(), b"abc");
        store.pin(&cid).await.unwrap();
        assert!(store.is_pinned(&cid).await.unwrap());
        store.unpin(&cid).await.unwrap();
        assert!(!store.is_pinned(&cid).await.unwrap());
        assert!(store.pin("ff").await.is_err());
    }
}
