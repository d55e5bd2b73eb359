use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    DEFAULT_FILE_RETENTION_SECS, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_PARTICIPANTS,
};
use crate::error::ProtocolError;
use crate::types::{FileId, PeerId, RoomId, RoomType};

/// All wire protocol messages exchanged over a peer session.
///
/// JSON, internally tagged by `type`. Receivers decode any tag they do not
/// know into [`WireMessage::Unknown`] and drop it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Direct chat message
    Chat { message: Message },

    /// Room metadata announced to the directory
    RoomAnnouncement { metadata: RoomMetadata },

    /// Opaque room-scoped relay payload
    #[serde(rename = "message")]
    RoomRelay {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        data: serde_json::Value,
    },

    /// File share descriptor, sent before its chunks
    FileOffer { share: FileShare },

    /// Signed, encrypted file chunk
    FileChunk { chunk: FileChunk },

    #[serde(other)]
    Unknown,
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub chunks: u32,
}

/// A chat message. `content` is ciphertext (base64) when `is_encrypted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender: PeerId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_metadata: Option<FileMetadata>,
}

impl Message {
    /// Encrypted messages must carry both their iv and key id.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.is_encrypted && (self.iv.is_none() || self.key_id.is_none()) {
            return Err(ProtocolError::MissingEncryptionParams(self.id));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Participant and file-sharing limits of a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomPolicy {
    pub max_participants: u32,
    pub allow_files: bool,
    pub max_file_size: u64,
    pub file_retention_secs: i64,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            allow_files: true,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            file_retention_secs: DEFAULT_FILE_RETENTION_SECS,
        }
    }
}

/// Sealed copy of a room's descriptive fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub iv: String,
    pub data: String,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The fields sealed into [`EncryptedEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomDescriptor {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub policy: RoomPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadata {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub is_private: bool,
    pub owner: PeerId,
    pub tags: Vec<String>,
    pub active_users: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub policy: RoomPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<EncryptedEnvelope>,
}

impl RoomMetadata {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_full(&self) -> bool {
        self.active_users >= self.policy.max_participants
    }

    pub fn descriptor(&self) -> RoomDescriptor {
        RoomDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            policy: self.policy.clone(),
        }
    }

    /// Case-insensitive substring match on name or description.
    pub fn matches_query(&self, query: &str) -> bool {
        let needle = query.to_lowercase();
        self.name.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle)
    }

    /// True when the room carries at least one of `tags`.
    pub fn matches_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }

    /// Copy safe to broadcast. Private rooms only travel with their sealed
    /// envelope; the plaintext descriptive fields are blanked.
    pub fn broadcast_view(&self) -> RoomMetadata {
        let mut view = self.clone();
        if view.is_private {
            view.name.clear();
            view.description.clear();
            view.tags.clear();
        }
        view
    }
}

/// Descriptor of a file offered for chunked transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileShare {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub chunks: u32,
    pub chunk_size: u32,
    pub expires_at: DateTime<Utc>,
    /// Hex Ed25519 public key that signs every chunk.
    pub uploader: String,
    /// Base nonce of the file key. Every chunk is sealed under its own
    /// fresh nonce carried in the chunk, so receivers never read this.
    pub iv: String,
    /// Exported file key, present under the standard level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// File key wrapped with the post-quantum hybrid exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected_key: Option<String>,
}

impl FileShare {
    pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
        size.div_ceil(chunk_size as u64) as u32
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: FileId,
    pub index: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
