//! Building and reading chat messages.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use chatterlink_shared::constants::DECRYPTION_FAILED_PLACEHOLDER;
use chatterlink_shared::protocol::{FileMetadata, FileShare, Message, MessageKind};
use chatterlink_shared::PeerId;

use crate::engine::EncryptionEngine;
use crate::error::Result;

async fn compose(
    engine: &EncryptionEngine,
    sender: PeerId,
    kind: MessageKind,
    body: &[u8],
    lifetime: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<Message> {
    let encrypted = engine.level().await.encrypts();
    let payload = engine.encrypt_message(body).await?;

    let message = Message {
        id: uuid::Uuid::new_v4(),
        sender,
        timestamp: now,
        kind,
        content: payload.ciphertext,
        is_encrypted: encrypted,
        iv: encrypted.then_some(payload.iv),
        key_id: encrypted.then_some(payload.key_id),
        expires_at: lifetime.map(|l| now + l),
        file_metadata: None,
    };
    message.validate()?;
    Ok(message)
}

/// A text message, sealed unless the engine runs at the basic level.
pub async fn compose_text_message(
    engine: &EncryptionEngine,
    sender: PeerId,
    text: &str,
    lifetime: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<Message> {
    compose(engine, sender, MessageKind::Text, text.as_bytes(), lifetime, now).await
}

/// A message announcing `share`. The share descriptor, key material
/// included, is the sealed content; the plain metadata lets receivers show
/// the file before opening it.
pub async fn compose_file_message(
    engine: &EncryptionEngine,
    sender: PeerId,
    share: &FileShare,
    lifetime: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<Message> {
    let body = serde_json::to_vec(share)?;
    let mut message = compose(engine, sender, MessageKind::File, &body, lifetime, now).await?;
    message.file_metadata = Some(FileMetadata {
        name: share.name.clone(),
        size: share.size,
        mime_type: share.mime_type.clone(),
        chunks: share.chunks,
    });
    Ok(message)
}

/// Readable content of `message`. Anything that fails to open renders as
/// the decryption-failed placeholder, never as partial plaintext.
pub async fn open_message(engine: &EncryptionEngine, message: &Message) -> String {
    if !message.is_encrypted {
        return message.content.clone();
    }
    let (Some(iv), Some(key_id)) = (&message.iv, &message.key_id) else {
        return DECRYPTION_FAILED_PLACEHOLDER.to_string();
    };

    match engine.decrypt_message(&message.content, iv, key_id).await {
        Ok(plain) => match String::from_utf8(plain) {
            Ok(text) => text,
            Err(_) => DECRYPTION_FAILED_PLACEHOLDER.to_string(),
        },
        Err(e) => {
            warn!(message = %message.id, error = %e, "Could not open message");
            DECRYPTION_FAILED_PLACEHOLDER.to_string()
        }
    }
}

/// Sealed file share carried by a file message.
pub async fn open_file_share(engine: &EncryptionEngine, message: &Message) -> Result<FileShare> {
    let body = if message.is_encrypted {
        let iv = message.iv.as_deref().unwrap_or_default();
        let key_id = message.key_id.as_deref().unwrap_or_default();
        engine.decrypt_message(&message.content, iv, key_id).await?
    } else {
        message.content.as_bytes().to_vec()
    };
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatterlink_shared::constants::FILE_CHUNK_SIZE;
    use chatterlink_shared::{FileId, PrivacyLevel};
    use chatterlink_store::MemoryStore;
    use std::sync::Arc;

    async fn engine(level: PrivacyLevel) -> EncryptionEngine {
        let engine = EncryptionEngine::new(Arc::new(MemoryStore::new()));
        engine.initialize("pw", level).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_text_message_roundtrip() {
        let engine = engine(PrivacyLevel::Standard).await;
        let now = Utc::now();
        let message = compose_text_message(
            &engine,
            PeerId::from("alice"),
            "hi there",
            Some(Duration::minutes(5)),
            now,
        )
        .await
        .unwrap();

        assert!(message.is_encrypted);
        assert_ne!(message.content, "hi there");
        assert_eq!(message.expires_at, Some(now + Duration::minutes(5)));
        assert_eq!(open_message(&engine, &message).await, "hi there");
    }

    #[tokio::test]
    async fn test_basic_message_is_plain() {
        let engine = engine(PrivacyLevel::Basic).await;
        let message = compose_text_message(&engine, PeerId::from("a"), "plain", None, Utc::now())
            .await
            .unwrap();
        assert!(!message.is_encrypted);
        assert!(message.iv.is_none());
        assert!(message.expires_at.is_none());
        assert_eq!(message.content, "plain");
        assert_eq!(open_message(&engine, &message).await, "plain");
    }

    #[tokio::test]
    async fn test_unreadable_message_renders_placeholder() {
        let alice = engine(PrivacyLevel::Standard).await;
        let bob = engine(PrivacyLevel::Standard).await;
        let message = compose_text_message(&alice, PeerId::from("a"), "for alice", None, Utc::now())
            .await
            .unwrap();
        assert_eq!(open_message(&bob, &message).await, DECRYPTION_FAILED_PLACEHOLDER);

        let mut stripped = message.clone();
        stripped.iv = None;
        assert_eq!(
            open_message(&alice, &stripped).await,
            DECRYPTION_FAILED_PLACEHOLDER
        );
    }

    #[tokio::test]
    async fn test_file_message_carries_share() {
        let engine = engine(PrivacyLevel::Standard).await;
        let share = FileShare {
            id: FileId::new(),
            name: "notes.txt".into(),
            size: 10,
            mime_type: "text/plain".into(),
            chunks: 1,
            chunk_size: FILE_CHUNK_SIZE as u32,
            expires_at: Utc::now() + Duration::hours(1),
            uploader: "ab".repeat(32),
            iv: String::new(),
            key: Some("a2V5".into()),
            protected_key: None,
        };
        let message = compose_file_message(&engine, PeerId::from("a"), &share, None, Utc::now())
            .await
            .unwrap();

        assert_eq!(message.kind, MessageKind::File);
        assert_eq!(message.file_metadata.as_ref().unwrap().name, "notes.txt");
        assert_eq!(open_file_share(&engine, &message).await.unwrap(), share);
    }
}
