//! File Transfer Engine.
//!
//! Files move as fixed-size chunks, each sealed under the file's own key and
//! signed by the uploader. A chunk is only ever decrypted after its
//! signature checks out, and assembly reorders chunks by index first, so
//! they may be uploaded and received in any order.
//!
//! Chunk wire format: `nonce (24) || ciphertext`, with `file_id || index`
//! bound as associated data so chunks cannot be replayed into another file
//! or position.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use zeroize::Zeroizing;

use chatterlink_shared::constants::{FILE_CHUNK_SIZE, MAX_FILE_SIZE, NONCE_SIZE};
use chatterlink_shared::crypto::{self, SymmetricKey};
use chatterlink_shared::protocol::{FileChunk, FileShare};
use chatterlink_shared::{Clock, FileId, PrivacyLevel};

use crate::engine::{decode_key, EncryptionEngine};
use crate::error::{CoreError, Result};
use crate::sweep::Sweepable;

/// What the caller knows about a file before uploading it.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

struct Transfer {
    share: FileShare,
    key: Zeroizing<SymmetricKey>,
    chunks: BTreeMap<u32, FileChunk>,
}

struct Inner {
    transfers: Mutex<HashMap<FileId, Transfer>>,
    engine: EncryptionEngine,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct FileTransferEngine {
    inner: Arc<Inner>,
}

fn chunk_aad(file_id: &FileId, index: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(20);
    aad.extend_from_slice(file_id.0.as_bytes());
    aad.extend_from_slice(&index.to_le_bytes());
    aad
}

fn open_chunk(key: &SymmetricKey, chunk: &FileChunk) -> Result<Vec<u8>> {
    if chunk.data.len() < NONCE_SIZE {
        return Err(CoreError::Decryption(format!(
            "chunk {} of {} is truncated",
            chunk.index, chunk.file_id
        )));
    }
    let (nonce, sealed) = chunk.data.split_at(NONCE_SIZE);
    let nonce = crypto::nonce_from_slice(nonce)?;
    Ok(crypto::open(
        key,
        &nonce,
        sealed,
        &chunk_aad(&chunk.file_id, chunk.index),
    )?)
}

impl FileTransferEngine {
    pub fn new(engine: EncryptionEngine, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transfers: Mutex::new(HashMap::new()),
                engine,
                clock,
            }),
        }
    }

    fn transfers(&self) -> MutexGuard<'_, HashMap<FileId, Transfer>> {
        self.inner.transfers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live (known and unexpired) transfer for `file_id`.
    fn live<'a>(
        transfers: &'a mut HashMap<FileId, Transfer>,
        file_id: &FileId,
        now: DateTime<Utc>,
    ) -> Result<&'a mut Transfer> {
        transfers
            .get_mut(file_id)
            .filter(|t| !t.share.is_expired(now))
            .ok_or_else(|| CoreError::NotFound(format!("file {file_id}")))
    }

    /// Register a new outgoing file and generate its key. At the maximum
    /// level the key is wrapped with the hybrid exchange instead of being
    /// exported in the clear.
    pub async fn prepare_file_upload(
        &self,
        file: FileDescriptor,
        expires_in: Duration,
    ) -> Result<FileShare> {
        if file.size > MAX_FILE_SIZE {
            return Err(CoreError::InvalidChunk(format!(
                "file of {} bytes exceeds the {MAX_FILE_SIZE} byte limit",
                file.size
            )));
        }
        let engine = &self.inner.engine;
        let uploader = engine
            .user_id()
            .await
            .ok_or(CoreError::NotInitialized("signing key"))?;
        let file_key = engine.generate_file_key();

        let (key, protected_key) = if engine.level().await == PrivacyLevel::Maximum {
            (None, Some(engine.protect_file_key(&file_key.key, None).await?))
        } else {
            (Some(engine.export_key(&file_key.key)), None)
        };

        let chunk_size = FILE_CHUNK_SIZE as u32;
        let share = FileShare {
            id: FileId::new(),
            name: file.name,
            size: file.size,
            mime_type: file.mime_type,
            chunks: FileShare::chunk_count(file.size, chunk_size),
            chunk_size,
            expires_at: self.inner.clock.now() + expires_in,
            uploader,
            iv: STANDARD.encode(file_key.iv),
            key,
            protected_key,
        };

        self.transfers().insert(
            share.id,
            Transfer {
                share: share.clone(),
                key: file_key.key,
                chunks: BTreeMap::new(),
            },
        );
        info!(file = %share.id, size = share.size, chunks = share.chunks, "File upload prepared");
        Ok(share)
    }

    /// Seal and sign one slice of an outgoing file, keeping the chunk in the
    /// file's buffer.
    pub async fn upload_chunk(&self, file_id: &FileId, index: u32, bytes: &[u8]) -> Result<FileChunk> {
        let key = {
            let now = self.inner.clock.now();
            let mut transfers = self.transfers();
            let transfer = Self::live(&mut transfers, file_id, now)?;
            check_index(&transfer.share, index)?;
            if bytes.len() > transfer.share.chunk_size as usize {
                return Err(CoreError::InvalidChunk(format!(
                    "chunk {index} is {} bytes, limit is {}",
                    bytes.len(),
                    transfer.share.chunk_size
                )));
            }
            transfer.key.clone()
        };

        let nonce = crypto::generate_nonce();
        let sealed = crypto::seal(&key, &nonce, bytes, &chunk_aad(file_id, index))?;
        let mut data = Vec::with_capacity(NONCE_SIZE + sealed.len());
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&sealed);

        let signature = self.inner.engine.sign_data(&data).await?;
        let chunk = FileChunk {
            file_id: *file_id,
            index,
            data,
            signature,
        };

        let now = self.inner.clock.now();
        let mut transfers = self.transfers();
        Self::live(&mut transfers, file_id, now)?
            .chunks
            .insert(index, chunk.clone());
        debug!(file = %file_id, index, "Chunk uploaded");
        Ok(chunk)
    }

    /// Upload a whole file, slicing it at the share's chunk size.
    pub async fn upload_file(&self, file_id: &FileId, bytes: &[u8]) -> Result<Vec<FileChunk>> {
        let chunk_size = self
            .share(file_id)
            .ok_or_else(|| CoreError::NotFound(format!("file {file_id}")))?
            .chunk_size as usize;

        let mut chunks = Vec::new();
        for (index, slice) in bytes.chunks(chunk_size).enumerate() {
            chunks.push(self.upload_chunk(file_id, index as u32, slice).await?);
        }
        Ok(chunks)
    }

    /// Track a file offered by a peer so its chunks can be accepted. The
    /// file key comes from the share: exported, or wrapped to this node's
    /// post-quantum key.
    ///
    /// The share's shape is checked against the protocol: fixed chunk size,
    /// bounded size and a chunk count derived from that size. An offer for
    /// a file that is already tracked is refused.
    pub async fn register_share(&self, share: FileShare) -> Result<()> {
        let now = self.inner.clock.now();
        if share.is_expired(now) {
            return Err(CoreError::Expired(format!("file {}", share.id)));
        }
        check_share_shape(&share)?;
        self.ensure_untracked(&share.id, now)?;
        let key = match (&share.key, &share.protected_key) {
            (Some(exported), _) => decode_key(exported)?,
            (None, Some(protected)) => self.inner.engine.unprotect_file_key(protected).await?,
            (None, None) => {
                return Err(CoreError::Decryption(format!(
                    "file {} carries no key",
                    share.id
                )))
            }
        };

        let (file_id, chunks) = (share.id, share.chunks);
        let now = self.inner.clock.now();
        let mut transfers = self.transfers();
        let transfer = Transfer {
            share,
            key,
            chunks: BTreeMap::new(),
        };
        match transfers.entry(file_id) {
            Entry::Occupied(entry) if !entry.get().share.is_expired(now) => {
                return Err(already_tracked(entry.key()));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(transfer);
            }
            Entry::Vacant(entry) => {
                entry.insert(transfer);
            }
        }
        debug!(file = %file_id, chunks, "File share registered");
        Ok(())
    }

    fn ensure_untracked(&self, file_id: &FileId, now: DateTime<Utc>) -> Result<()> {
        match self.transfers().get(file_id) {
            Some(existing) if !existing.share.is_expired(now) => Err(already_tracked(file_id)),
            _ => Ok(()),
        }
    }

    /// Take in a chunk received from a peer. The uploader's signature is
    /// checked before the chunk enters the buffer.
    pub fn accept_chunk(&self, chunk: FileChunk) -> Result<()> {
        let now = self.inner.clock.now();
        let mut transfers = self.transfers();
        let transfer = Self::live(&mut transfers, &chunk.file_id, now)?;
        check_index(&transfer.share, chunk.index)?;

        if !self.inner.engine.verify_with_public_key(
            &transfer.share.uploader,
            &chunk.data,
            &chunk.signature,
        ) {
            return Err(CoreError::Signature);
        }
        debug!(file = %chunk.file_id, index = chunk.index, "Chunk accepted");
        transfer.chunks.insert(chunk.index, chunk);
        Ok(())
    }

    /// Plaintext of one chunk: signature first, decryption second.
    pub fn download_chunk(&self, chunk: &FileChunk) -> Result<Vec<u8>> {
        let now = self.inner.clock.now();
        let (uploader, key) = {
            let mut transfers = self.transfers();
            let transfer = Self::live(&mut transfers, &chunk.file_id, now)?;
            (transfer.share.uploader.clone(), transfer.key.clone())
        };

        if !self
            .inner
            .engine
            .verify_with_public_key(&uploader, &chunk.data, &chunk.signature)
        {
            return Err(CoreError::Signature);
        }
        open_chunk(&key, chunk)
    }

    /// Decrypt and join every chunk of `file_id`, in index order. Fails
    /// unless exactly the declared number of chunks is buffered.
    pub fn assemble_file(&self, file_id: &FileId) -> Result<AssembledFile> {
        let now = self.inner.clock.now();
        let mut transfers = self.transfers();
        let transfer = Self::live(&mut transfers, file_id, now)?;

        let expected = transfer.share.chunks;
        if transfer.chunks.len() != expected as usize {
            return Err(CoreError::IncompleteTransfer {
                received: transfer.chunks.len(),
                expected,
            });
        }

        // sealed chunks bound the plaintext from above
        let capacity = transfer.chunks.values().map(|c| c.data.len()).sum();
        let mut bytes = Vec::with_capacity(capacity);
        for chunk in transfer.chunks.values() {
            bytes.extend_from_slice(&open_chunk(&transfer.key, chunk)?);
        }
        if bytes.len() as u64 != transfer.share.size {
            return Err(CoreError::InvalidChunk(format!(
                "file {file_id} assembled to {} bytes, expected {}",
                bytes.len(),
                transfer.share.size
            )));
        }

        info!(file = %file_id, size = bytes.len(), "File assembled");
        Ok(AssembledFile {
            name: transfer.share.name.clone(),
            mime_type: transfer.share.mime_type.clone(),
            bytes,
        })
    }

    pub fn share(&self, file_id: &FileId) -> Option<FileShare> {
        self.transfers().get(file_id).map(|t| t.share.clone())
    }

    /// Number of chunks currently buffered for `file_id`.
    pub fn buffered_chunks(&self, file_id: &FileId) -> usize {
        self.transfers().get(file_id).map_or(0, |t| t.chunks.len())
    }

    /// Drop a transfer and its chunk buffer.
    pub fn remove(&self, file_id: &FileId) -> bool {
        self.transfers().remove(file_id).is_some()
    }
}

fn check_share_shape(share: &FileShare) -> Result<()> {
    let expected_size = FILE_CHUNK_SIZE as u32;
    if share.chunk_size != expected_size {
        return Err(CoreError::InvalidChunk(format!(
            "file {} declares chunk size {}, protocol uses {expected_size}",
            share.id, share.chunk_size
        )));
    }
    if share.size > MAX_FILE_SIZE {
        return Err(CoreError::InvalidChunk(format!(
            "file {} declares {} bytes, limit is {MAX_FILE_SIZE}",
            share.id, share.size
        )));
    }
    let derived = FileShare::chunk_count(share.size, share.chunk_size);
    if share.chunks != derived {
        return Err(CoreError::InvalidChunk(format!(
            "file {} declares {} chunks, {} bytes need {derived}",
            share.id, share.chunks, share.size
        )));
    }
    Ok(())
}

fn already_tracked(file_id: &FileId) -> CoreError {
    CoreError::Permission(format!("file {file_id} is already tracked"))
}

fn check_index(share: &FileShare, index: u32) -> Result<()> {
    if index >= share.chunks {
        return Err(CoreError::InvalidChunk(format!(
            "index {index} out of range for {} chunks",
            share.chunks
        )));
    }
    Ok(())
}

impl Sweepable for FileTransferEngine {
    fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut transfers = self.transfers();
        let before = transfers.len();
        transfers.retain(|_, t| !t.share.is_expired(now));
        Ok(before - transfers.len())
    }
}
