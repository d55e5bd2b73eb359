use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;

use chatterlink_core::{
    CoreError, EncryptionEngine, FileDescriptor, FileTransferEngine, RoomDirectory,
};
use chatterlink_net::{ConnectionManager, MemoryNetwork};
use chatterlink_shared::protocol::{RoomMetadata, RoomPolicy};
use chatterlink_shared::sharing::SecretSharingService;
use chatterlink_shared::{Clock, ManualClock, PrivacyLevel, RoomId, RoomType};
use chatterlink_store::MemoryStore;

async fn engine(level: PrivacyLevel) -> EncryptionEngine {
    let engine = EncryptionEngine::new(Arc::new(MemoryStore::new()));
    engine
        .initialize("a long passphrase", level)
        .await
        .unwrap();
    engine
}

async fn directory(clock: &ManualClock) -> (RoomDirectory, ConnectionManager) {
    let store = Arc::new(MemoryStore::new());
    let engine = EncryptionEngine::new(store.clone());
    engine
        .initialize("pw", PrivacyLevel::Standard)
        .await
        .unwrap();
    let connections = ConnectionManager::new(
        Arc::new(MemoryNetwork::new().transport("owner")),
        StdDuration::from_secs(1),
    );
    connections.initialize().await.unwrap();
    let directory =
        RoomDirectory::new(engine, connections.clone(), store, Arc::new(clock.clone())).unwrap();
    (directory, connections)
}

fn public_room(clock: &ManualClock, name: &str, tags: &[&str]) -> RoomMetadata {
    RoomMetadata {
        id: RoomId::new(),
        name: name.into(),
        description: String::new(),
        room_type: RoomType::Public,
        is_private: false,
        owner: "owner".into(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        active_users: 0,
        created_at: clock.now(),
        expires_at: None,
        policy: RoomPolicy::default(),
        encrypted: None,
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn encrypt_decrypt_roundtrip() {
    let plaintexts: [&[u8]; 4] = [b"", b"hello", "gr\u{fc}\u{df}e \u{1f600}".as_bytes(), &[0u8; 4096]];
    let engine = engine(PrivacyLevel::Standard).await;
    for plain in plaintexts {
        let payload = engine.encrypt_message(plain).await.unwrap();
        let opened = engine
            .decrypt_message(&payload.ciphertext, &payload.iv, &payload.key_id)
            .await
            .unwrap();
        assert_eq!(opened, plain);
    }
}

#[tokio::test]
async fn basic_level_encrypt_is_a_no_op() {
    let engine = engine(PrivacyLevel::Basic).await;
    let payload = engine.encrypt_message(b"as is").await.unwrap();
    assert_eq!(payload.ciphertext, "as is");
    assert_eq!(payload.iv, "");
    assert_eq!(payload.key_id, "");

    let text = "gr\u{fc}\u{df}e";
    let payload = engine.encrypt_message(text.as_bytes()).await.unwrap();
    let opened = engine
        .decrypt_message(&payload.ciphertext, &payload.iv, &payload.key_id)
        .await
        .unwrap();
    assert_eq!(opened, text.as_bytes());

    // bytes that are not text are refused, never altered
    assert!(matches!(
        engine.encrypt_message(&[255, 254, 65]).await,
        Err(CoreError::Serialization(_))
    ));
}

#[tokio::test]
async fn file_of_150000_bytes_uploaded_in_reverse_order() {
    let files = FileTransferEngine::new(
        engine(PrivacyLevel::Standard).await,
        Arc::new(ManualClock::default()),
    );
    let data = sample(150_000);
    let share = files
        .prepare_file_upload(
            FileDescriptor {
                name: "big.bin".into(),
                mime_type: "application/octet-stream".into(),
                size: data.len() as u64,
            },
            Duration::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(share.chunks, 3);

    for index in (0..3u32).rev() {
        let start = index as usize * 65_536;
        let end = (start + 65_536).min(data.len());
        files
            .upload_chunk(&share.id, index, &data[start..end])
            .await
            .unwrap();
    }

    let assembled = files.assemble_file(&share.id).unwrap();
    assert_eq!(assembled.bytes.len(), 150_000);
    assert_eq!(assembled.bytes, data);
    assert_eq!(assembled.mime_type, "application/octet-stream");
}

fn permutations(items: &[u32]) -> Vec<Vec<u32>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for (i, &first) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first);
            out.push(tail);
        }
    }
    out
}

#[tokio::test]
async fn assembly_is_independent_of_arrival_order() {
    let clock = Arc::new(ManualClock::default());
    let sender = FileTransferEngine::new(engine(PrivacyLevel::Standard).await, clock.clone());
    let receiver = FileTransferEngine::new(engine(PrivacyLevel::Standard).await, clock);

    let data = sample(200_000);
    let share = sender
        .prepare_file_upload(
            FileDescriptor {
                name: "four.bin".into(),
                mime_type: "application/octet-stream".into(),
                size: data.len() as u64,
            },
            Duration::hours(1),
        )
        .await
        .unwrap();
    let chunks = sender.upload_file(&share.id, &data).await.unwrap();
    assert_eq!(chunks.len(), 4);

    for order in permutations(&[0, 1, 2, 3]) {
        receiver.register_share(share.clone()).await.unwrap();
        for index in order {
            receiver.accept_chunk(chunks[index as usize].clone()).unwrap();
        }
        assert_eq!(receiver.assemble_file(&share.id).unwrap().bytes, data);
        receiver.remove(&share.id);
    }
}

#[tokio::test]
async fn tampered_chunk_is_rejected_before_decryption() {
    let files = FileTransferEngine::new(
        engine(PrivacyLevel::Standard).await,
        Arc::new(ManualClock::default()),
    );
    let share = files
        .prepare_file_upload(
            FileDescriptor {
                name: "x".into(),
                mime_type: "text/plain".into(),
                size: 1000,
            },
            Duration::hours(1),
        )
        .await
        .unwrap();
    let chunk = files.upload_chunk(&share.id, 0, &sample(1000)).await.unwrap();

    for position in [0, 30, chunk.data.len() - 1] {
        let mut tampered = chunk.clone();
        tampered.data[position] ^= 0x80;
        assert!(matches!(
            files.download_chunk(&tampered),
            Err(CoreError::Signature)
        ));
    }
}

#[tokio::test]
async fn third_join_of_a_two_seat_room_fails() {
    let clock = ManualClock::default();
    let (directory, _connections) = directory(&clock).await;
    let mut room = public_room(&clock, "Duo", &[]);
    room.policy.max_participants = 2;
    let id = directory.announce_room(room).await.unwrap().id;

    directory.join_room(&id).await.unwrap();
    directory.join_room(&id).await.unwrap();
    let err = directory.join_room(&id).await.unwrap_err();
    assert!(matches!(err, CoreError::Capacity(_)));
    assert_eq!(directory.get(&id).unwrap().active_users, 2);
}

#[tokio::test]
async fn expired_room_is_excluded_from_search() {
    let clock = ManualClock::default();
    let (directory, _connections) = directory(&clock).await;
    let mut room = public_room(&clock, "Yesterday", &["general"]);
    room.expires_at = Some(clock.now() - Duration::seconds(1));
    let id = directory.announce_room(room).await.unwrap().id;

    assert!(directory.search_rooms(None, None).is_empty());
    assert!(directory
        .search_rooms(Some("yesterday"), Some(&["general".to_string()]))
        .is_empty());
    assert!(directory.get(&id).is_some());
}

#[tokio::test]
async fn general_tag_search() {
    let clock = ManualClock::default();
    let (directory, _connections) = directory(&clock).await;
    let id = directory
        .announce_room(public_room(&clock, "Town square", &["general"]))
        .await
        .unwrap()
        .id;

    let found = directory.search_rooms(None, Some(&["general".to_string()]));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, id);
    assert!(directory.search_rooms(Some("nomatch"), None).is_empty());
}

#[test]
fn three_of_five_shares_reconstruct_the_key() {
    let mut service = SecretSharingService::new();
    service.initialize();
    let key = [0x5au8; 32];
    let shares = service.split_secret_key(&key, 3, 5).unwrap();
    assert_eq!(shares.len(), 5);

    for a in 0..5 {
        for b in a + 1..5 {
            for c in b + 1..5 {
                let subset = [shares[a].clone(), shares[b].clone(), shares[c].clone()];
                let recovered = service.combine_secret_shares(&subset).unwrap();
                assert_eq!(recovered.as_slice(), key.as_slice());
            }
            assert!(service
                .combine_secret_shares(&[shares[a].clone(), shares[b].clone()])
                .is_err());
        }
    }
}
