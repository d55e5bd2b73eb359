//! Encrypted file vault on top of the content-addressed blob store.
//!
//! Only ciphertext reaches the blob store. The key needed to read a blob is
//! kept next to its name and type in a metadata record sealed by the
//! Encryption Engine and saved in the key-value store.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use chatterlink_shared::crypto;
use chatterlink_store::{BlobStore, ContentId, KeyValueStore};

use crate::engine::{decode_key, EncryptedPayload, EncryptionEngine};
use crate::error::{CoreError, Result};
use crate::files::AssembledFile;

const META_PREFIX: &str = "ipfs-meta-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub cid: ContentId,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
}

#[derive(Serialize, Deserialize)]
struct VaultRecord {
    #[serde(flatten)]
    file: StoredFile,
    key: String,
    iv: String,
}

fn meta_key(cid: &str) -> String {
    format!("{META_PREFIX}{cid}")
}

#[derive(Clone)]
pub struct FileVault {
    engine: EncryptionEngine,
    blobs: Arc<dyn BlobStore>,
    store: Arc<dyn KeyValueStore>,
}

impl FileVault {
    pub fn new(
        engine: EncryptionEngine,
        blobs: Arc<dyn BlobStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            engine,
            blobs,
            store,
        }
    }

    /// Encrypt `bytes` under a fresh key and store the ciphertext.
    pub async fn store_file(&self, bytes: &[u8], name: &str, mime_type: &str) -> Result<StoredFile> {
        let file_key = self.engine.generate_file_key();
        let sealed = crypto::seal(&file_key.key, &file_key.iv, bytes, &[])?;
        let cid = self.blobs.put(&sealed).await?;

        let record = VaultRecord {
            file: StoredFile {
                cid: cid.clone(),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                size: bytes.len() as u64,
            },
            key: self.engine.export_key(&file_key.key),
            iv: STANDARD.encode(file_key.iv),
        };
        let payload = self
            .engine
            .encrypt_message(&serde_json::to_vec(&record)?)
            .await?;
        self.store.set_json(&meta_key(&cid), &payload)?;

        info!(cid = %cid, size = bytes.len(), "File stored");
        Ok(record.file)
    }

    async fn record(&self, cid: &str) -> Result<VaultRecord> {
        let payload: EncryptedPayload = self
            .store
            .get_json(&meta_key(cid))?
            .ok_or_else(|| CoreError::NotFound(format!("stored file {cid}")))?;
        let plain = self
            .engine
            .decrypt_message(&payload.ciphertext, &payload.iv, &payload.key_id)
            .await?;
        Ok(serde_json::from_slice(&plain)?)
    }

    pub async fn stat(&self, cid: &str) -> Result<StoredFile> {
        Ok(self.record(cid).await?.file)
    }

    /// Fetch and decrypt a file saved with [`store_file`](Self::store_file).
    pub async fn load_file(&self, cid: &str) -> Result<AssembledFile> {
        let record = self.record(cid).await?;
        let sealed = self.blobs.get(cid).await?;

        let key = decode_key(&record.key)?;
        let iv = crypto::nonce_from_slice(&STANDARD.decode(&record.iv)?)?;
        let bytes = crypto::open(&key, &iv, &sealed, &[])?;

        debug!(cid = %cid, size = bytes.len(), "File loaded");
        Ok(AssembledFile {
            name: record.file.name,
            mime_type: record.file.mime_type,
            bytes,
        })
    }

    pub async fn pin(&self, cid: &str) -> Result<()> {
        Ok(self.blobs.pin(cid).await?)
    }

    pub async fn unpin(&self, cid: &str) -> Result<()> {
        Ok(self.blobs.unpin(cid).await?)
    }

    pub async fn is_pinned(&self, cid: &str) -> Result<bool> {
        Ok(self.blobs.is_pinned(cid).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatterlink_shared::PrivacyLevel;
    use chatterlink_store::{FsBlobStore, MemoryBlobStore, MemoryStore};

    async fn vault(blobs: Arc<dyn BlobStore>) -> (FileVault, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = EncryptionEngine::new(store.clone());
        engine.initialize("pw", PrivacyLevel::Standard).await.unwrap();
        (FileVault::new(engine, blobs, store.clone()), store)
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let (vault, store) = vault(blobs.clone()).await;

        let stored = vault
            .store_file(b"quarterly report", "report.txt", "text/plain")
            .await
            .unwrap();
        assert_eq!(stored.size, 16);

        // neither the blob nor the metadata record leaks the contents
        let blob = blobs.get(&stored.cid).await.unwrap();
        assert!(!blob.windows(9).any(|w| w == b"quarterly"));
        let meta = store.get(&meta_key(&stored.cid)).unwrap().unwrap();
        assert!(!meta.contains("report.txt"));

        let loaded = vault.load_file(&stored.cid).await.unwrap();
        assert_eq!(loaded.bytes, b"quarterly report");
        assert_eq!(loaded.name, "report.txt");
        assert_eq!(vault.stat(&stored.cid).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_unknown_cid() {
        let (vault, _) = vault(Arc::new(MemoryBlobStore::new())).await;
        assert!(matches!(
            vault.load_file(&"0".repeat(64)).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pinning_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path().to_path_buf(), 1024 * 1024)
            .await
            .unwrap();
        let (vault, _) = vault(Arc::new(blobs)).await;

        let stored = vault.store_file(b"keep me", "a.bin", "application/octet-stream").await.unwrap();
        assert!(!vault.is_pinned(&stored.cid).await.unwrap());
        vault.pin(&stored.cid).await.unwrap();
        assert!(vault.is_pinned(&stored.cid).await.unwrap());
        vault.unpin(&stored.cid).await.unwrap();
        assert!(!vault.is_pinned(&stored.cid).await.unwrap());
        assert_eq!(vault.load_file(&stored.cid).await.unwrap().bytes, b"keep me");
    }
}
