//! Encryption Engine.
//!
//! Holds the key material for one node session. What `initialize` sets up
//! depends on the privacy level:
//!
//! - `Basic`: nothing. Messages travel in the clear and nothing is signed.
//! - `Standard`: a master key stretched from the password with PBKDF2 and a
//!   fresh Ed25519 signing identity.
//! - `Maximum`: additionally brings up the anonymizing transport with a
//!   hidden endpoint, splits the master key 3-of-5 and persists the shares,
//!   and generates a Kyber-1024 key pair used to wrap file keys.
//!
//! Initialization either completes or leaves the engine untouched.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use chatterlink_net::AnonymizingTransport;
use chatterlink_shared::constants::{
    HIDDEN_SERVICE_PORT, KEY_SHARE_THRESHOLD, KEY_SHARE_TOTAL, PBKDF2_ITERATIONS,
};
use chatterlink_shared::crypto::{self, Nonce, SymmetricKey};
use chatterlink_shared::identity::{self, Identity};
use chatterlink_shared::invite::RoomInvite;
use chatterlink_shared::quantum::{self, PqKeyPair};
use chatterlink_shared::sharing::{KeyShare, SecretSharingService};
use chatterlink_shared::{PeerId, PrivacyLevel, RoomId};
use chatterlink_store::KeyValueStore;

use crate::error::{CoreError, Result};

/// Key-value entry holding the base64 binary form of each master key share.
pub const KEY_SHARES_KEY: &str = "key_shares";

/// Output of [`EncryptionEngine::encrypt_message`]. All fields are base64
/// except `key_id`; under the basic level `ciphertext` is the plaintext and
/// the other fields are empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
    pub key_id: String,
}

/// A per-file symmetric key and its base nonce.
#[derive(Clone)]
pub struct FileKey {
    pub key: Zeroizing<SymmetricKey>,
    pub iv: Nonce,
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey").finish_non_exhaustive()
    }
}

/// Decode a key produced by [`EncryptionEngine::export_key`].
pub fn decode_key(encoded: &str) -> Result<Zeroizing<SymmetricKey>> {
    let bytes = Zeroizing::new(STANDARD.decode(encoded)?);
    let key = crypto::key_from_slice(&bytes)
        .map_err(|_| CoreError::Decryption("key has the wrong length".into()))?;
    Ok(Zeroizing::new(key))
}

#[derive(Default)]
struct EngineState {
    initialized: bool,
    level: PrivacyLevel,
    master_key_id: Option<String>,
    keys: HashMap<String, Zeroizing<SymmetricKey>>,
    identity: Option<Identity>,
    pq: Option<PqKeyPair>,
    sharing: SecretSharingService,
    hidden_address: Option<String>,
}

/// Cheaply clonable handle to the node's key material.
#[derive(Clone)]
pub struct EncryptionEngine {
    state: Arc<RwLock<EngineState>>,
    store: Arc<dyn KeyValueStore>,
    anonymizer: Option<Arc<dyn AnonymizingTransport>>,
    hidden_service_port: u16,
}

impl EncryptionEngine {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            state: Arc::new(RwLock::new(EngineState::default())),
            store,
            anonymizer: None,
            hidden_service_port: HIDDEN_SERVICE_PORT,
        }
    }

    /// Anonymizing transport brought up at the maximum level, publishing a
    /// hidden endpoint on `hidden_service_port`.
    pub fn with_anonymizer(
        mut self,
        anonymizer: Arc<dyn AnonymizingTransport>,
        hidden_service_port: u16,
    ) -> Self {
        self.anonymizer = Some(anonymizer);
        self.hidden_service_port = hidden_service_port;
        self
    }

    /// Set up key material for `level`. Re-initializing first tears down
    /// the previous session.
    pub async fn initialize(&self, password: &str, level: PrivacyLevel) -> Result<()> {
        if self.state.read().await.initialized {
            self.cleanup().await;
        }

        let mut staged = EngineState {
            initialized: true,
            level,
            ..EngineState::default()
        };

        if level == PrivacyLevel::Basic {
            *self.state.write().await = staged;
            info!(level = %level, "Encryption engine initialized");
            return Ok(());
        }

        let anonymizer = if level == PrivacyLevel::Maximum {
            let anonymizer = self.anonymizer.clone().ok_or_else(|| {
                CoreError::CryptoInit("maximum privacy needs an anonymizing transport".into())
            })?;
            anonymizer
                .initialize()
                .await
                .map_err(|e| CoreError::CryptoInit(e.to_string()))?;
            Some(anonymizer)
        } else {
            None
        };

        match self.stage_keys(&mut staged, password, anonymizer.as_deref()).await {
            Ok(()) => {
                *self.state.write().await = staged;
                info!(level = %level, "Encryption engine initialized");
                Ok(())
            }
            Err(e) => {
                if let Some(anonymizer) = anonymizer {
                    if let Err(cleanup_err) = anonymizer.cleanup().await {
                        warn!(error = %cleanup_err, "Anonymizing transport cleanup failed");
                    }
                }
                warn!(level = %level, error = %e, "Encryption engine initialization failed");
                Err(e)
            }
        }
    }

    async fn stage_keys(
        &self,
        staged: &mut EngineState,
        password: &str,
        anonymizer: Option<&dyn AnonymizingTransport>,
    ) -> Result<()> {
        let salt = crypto::generate_salt();
        let password = Zeroizing::new(password.as_bytes().to_vec());
        let master_key = tokio::task::spawn_blocking(move || {
            crypto::derive_key_from_password(&password, &salt, PBKDF2_ITERATIONS)
        })
        .await
        .map_err(|e| CoreError::CryptoInit(e.to_string()))?
        .map_err(|e| CoreError::CryptoInit(e.to_string()))?;

        staged.identity = Some(Identity::generate());

        if let Some(anonymizer) = anonymizer {
            let address = anonymizer
                .create_hidden_endpoint(self.hidden_service_port)
                .await
                .map_err(|e| CoreError::CryptoInit(e.to_string()))?;
            debug!(address = %address, "Hidden endpoint published");
            staged.hidden_address = Some(address);

            staged.sharing.initialize();
            let shares = staged.sharing.split_secret_key(
                &master_key[..],
                KEY_SHARE_THRESHOLD,
                KEY_SHARE_TOTAL,
            )?;

            let pq = tokio::task::spawn_blocking(quantum::generate_keypair)
                .await
                .map_err(|e| CoreError::CryptoInit(e.to_string()))?;
            staged.pq = Some(pq);

            let encoded = shares
                .iter()
                .map(|share| share.to_bytes().map(|bytes| STANDARD.encode(bytes)))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            self.store
                .set_json(KEY_SHARES_KEY, &encoded)
                .map_err(|e| CoreError::CryptoInit(e.to_string()))?;
            debug!(total = encoded.len(), "Master key shares persisted");
        }

        let key_id = uuid::Uuid::new_v4().to_string();
        staged.keys.insert(key_id.clone(), master_key);
        staged.master_key_id = Some(key_id);
        Ok(())
    }

    /// Encrypt with the master key under a fresh nonce.
    pub async fn encrypt_message(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let state = self.state.read().await;
        if !state.initialized {
            return Err(CoreError::NotInitialized("encryption engine"));
        }
        // the payload travels as-is, so it must already be text
        if state.level == PrivacyLevel::Basic {
            let text = std::str::from_utf8(plaintext).map_err(|e| {
                CoreError::Serialization(format!("basic level carries UTF-8 text only: {e}"))
            })?;
            return Ok(EncryptedPayload {
                ciphertext: text.to_owned(),
                iv: String::new(),
                key_id: String::new(),
            });
        }

        let key_id = state
            .master_key_id
            .clone()
            .ok_or(CoreError::NotInitialized("encryption engine"))?;
        let key = state
            .keys
            .get(&key_id)
            .ok_or(CoreError::NotInitialized("encryption engine"))?;

        let nonce = crypto::generate_nonce();
        let ciphertext = crypto::seal(key, &nonce, plaintext, &[])
            .map_err(|e| CoreError::CryptoInit(e.to_string()))?;

        Ok(EncryptedPayload {
            ciphertext: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(nonce),
            key_id,
        })
    }

    /// Reverse [`encrypt_message`](Self::encrypt_message) with the key
    /// registered under `key_id`.
    pub async fn decrypt_message(&self, ciphertext: &str, iv: &str, key_id: &str) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        if state.level == PrivacyLevel::Basic && iv.is_empty() && key_id.is_empty() {
            return Ok(ciphertext.as_bytes().to_vec());
        }

        let key = state
            .keys
            .get(key_id)
            .ok_or_else(|| CoreError::Decryption(format!("unknown key id {key_id:?}")))?;
        let nonce = crypto::nonce_from_slice(&STANDARD.decode(iv)?)
            .map_err(|_| CoreError::Decryption("iv has the wrong length".into()))?;
        let sealed = STANDARD.decode(ciphertext)?;

        Ok(crypto::open(key, &nonce, &sealed, &[])?)
    }

    pub async fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let identity = state
            .identity
            .as_ref()
            .ok_or(CoreError::NotInitialized("signing key"))?;
        Ok(identity.sign_bytes(data))
    }

    /// Check a signature made by this engine. Never errors.
    pub async fn verify_signature(&self, data: &[u8], signature: &[u8]) -> bool {
        match self.state.read().await.identity.as_ref() {
            Some(identity) => identity::verify(&identity.public_key_bytes(), data, signature),
            None => false,
        }
    }

    /// Check a signature made by the holder of `pubkey_hex`.
    pub fn verify_with_public_key(&self, pubkey_hex: &str, data: &[u8], signature: &[u8]) -> bool {
        identity::verify_hex(pubkey_hex, data, signature)
    }

    pub fn generate_file_key(&self) -> FileKey {
        FileKey {
            key: Zeroizing::new(crypto::generate_symmetric_key()),
            iv: crypto::generate_nonce(),
        }
    }

    pub fn export_key(&self, key: &SymmetricKey) -> String {
        STANDARD.encode(key)
    }

    /// Register an exported key. Returns the key id to decrypt with.
    pub async fn import_key(&self, encoded: &str) -> Result<String> {
        let key = decode_key(encoded)?;
        let key_id = uuid::Uuid::new_v4().to_string();
        self.state.write().await.keys.insert(key_id.clone(), key);
        debug!(key_id = %key_id, "Imported key");
        Ok(key_id)
    }

    /// Rebuild the master key from the persisted shares.
    pub async fn recover_master_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        let encoded: Vec<String> = self
            .store
            .get_json(KEY_SHARES_KEY)?
            .ok_or_else(|| CoreError::NotFound("persisted key shares".into()))?;

        let shares = encoded
            .iter()
            .map(|e| {
                let bytes = STANDARD.decode(e)?;
                KeyShare::from_bytes(&bytes).map_err(CoreError::from)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(self.state.read().await.sharing.combine_secret_shares(&shares)?)
    }

    /// Wrap a file key with the hybrid exchange, to `recipient` or, by
    /// default, to this engine's own post-quantum key.
    pub async fn protect_file_key(
        &self,
        key: &SymmetricKey,
        recipient: Option<&[u8]>,
    ) -> Result<String> {
        let public_key = match recipient {
            Some(pk) => pk.to_vec(),
            None => self
                .pq_public_key()
                .await
                .ok_or(CoreError::NotInitialized("post-quantum key pair"))?,
        };
        let key = Zeroizing::new(*key);
        let wrapped =
            tokio::task::spawn_blocking(move || quantum::hybrid_encrypt(&key[..], &public_key))
                .await
                .map_err(|e| CoreError::CryptoInit(e.to_string()))?
                .map_err(|e| CoreError::CryptoInit(e.to_string()))?;
        Ok(STANDARD.encode(wrapped))
    }

    /// Unwrap a key produced by [`protect_file_key`](Self::protect_file_key)
    /// for this engine.
    pub async fn unprotect_file_key(&self, protected: &str) -> Result<Zeroizing<SymmetricKey>> {
        let secret_key = self
            .state
            .read()
            .await
            .pq
            .as_ref()
            .map(|pq| pq.secret_key.clone())
            .ok_or(CoreError::NotInitialized("post-quantum key pair"))?;
        let wrapped = STANDARD.decode(protected)?;

        let key = tokio::task::spawn_blocking(move || quantum::hybrid_decrypt(&wrapped, &secret_key))
            .await
            .map_err(|e| CoreError::Decryption(e.to_string()))??;
        let key = Zeroizing::new(key);
        Ok(Zeroizing::new(crypto::key_from_slice(&key).map_err(|_| {
            CoreError::Decryption("unwrapped key has the wrong length".into())
        })?))
    }

    /// Signed invite code for a private room, valid for `valid_for` from
    /// `now`.
    pub async fn create_room_invite(
        &self,
        room_id: RoomId,
        room_name: &str,
        owner: &PeerId,
        now: DateTime<Utc>,
        valid_for: chrono::Duration,
    ) -> Result<String> {
        let state = self.state.read().await;
        let identity = state
            .identity
            .as_ref()
            .ok_or(CoreError::NotInitialized("signing key"))?;
        let invite = RoomInvite::create(
            identity,
            room_id.0,
            room_name.to_string(),
            owner.to_string(),
            now,
            valid_for,
        )?;
        Ok(invite.encode()?)
    }

    pub async fn pq_public_key(&self) -> Option<Vec<u8>> {
        self.state
            .read()
            .await
            .pq
            .as_ref()
            .map(|pq| pq.public_key.clone())
    }

    /// Hex public signing key, used as the uploader id on file shares.
    pub async fn user_id(&self) -> Option<String> {
        self.state
            .read()
            .await
            .identity
            .as_ref()
            .map(Identity::public_key_hex)
    }

    pub async fn level(&self) -> PrivacyLevel {
        self.state.read().await.level
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    pub async fn hidden_address(&self) -> Option<String> {
        self.state.read().await.hidden_address.clone()
    }

    /// Drop all key material and tear down the anonymizing transport and the
    /// secret sharing service. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let previous = std::mem::take(&mut *self.state.write().await);
        if !previous.initialized {
            return;
        }

        let EngineState {
            level, mut sharing, ..
        } = previous;
        sharing.cleanup();

        if level == PrivacyLevel::Maximum {
            if let Some(anonymizer) = &self.anonymizer {
                if let Err(e) = anonymizer.cleanup().await {
                    warn!(error = %e, "Anonymizing transport cleanup failed");
                }
            }
        }
        info!("Encryption engine cleaned up");
    }
}
