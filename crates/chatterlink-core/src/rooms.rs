//! Rooms this node created or joined, with their message logs.
//!
//! Public rooms are published through the [`RoomDirectory`] and joined from
//! it. Private rooms never enter the directory's searchable set; the owner
//! hands out signed invite codes and joiners redeem them with
//! [`RoomRegistry::join_with_invite`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use chatterlink_net::ConnectionManager;
use chatterlink_shared::invite::{RoomInvite, INVITE_DURATION_SECS};
use chatterlink_shared::protocol::{Message, RoomMetadata, RoomPolicy};
use chatterlink_shared::{Clock, PeerId, RoomId, RoomType};

use crate::directory::RoomDirectory;
use crate::engine::EncryptionEngine;
use crate::error::{CoreError, Result};
use crate::sweep::Sweepable;

/// Parameters of a new room. Unset limits fall back to [`RoomPolicy`]'s
/// defaults.
#[derive(Debug, Clone)]
pub struct RoomCreation {
    pub name: String,
    pub description: String,
    pub room_type: RoomType,
    pub tags: Vec<String>,
    pub expires_in: Option<Duration>,
    pub policy: RoomPolicy,
}

impl RoomCreation {
    pub fn new(name: impl Into<String>, room_type: RoomType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            room_type,
            tags: Vec::new(),
            expires_in: None,
            policy: RoomPolicy::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn expires_in(mut self, lifetime: Duration) -> Self {
        self.expires_in = Some(lifetime);
        self
    }

    pub fn max_participants(mut self, max: u32) -> Self {
        self.policy.max_participants = max;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CreatedRoom {
    pub metadata: RoomMetadata,
    /// Invite code, for private rooms.
    pub invite: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPeer {
    pub peer: PeerId,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub metadata: RoomMetadata,
    pub messages: Vec<Message>,
    pub peers: HashMap<PeerId, RoomPeer>,
}

impl Room {
    fn new(metadata: RoomMetadata) -> Self {
        Self {
            metadata,
            messages: Vec::new(),
            peers: HashMap::new(),
        }
    }

    fn add_peer(&mut self, peer: PeerId, now: DateTime<Utc>) {
        self.peers
            .entry(peer.clone())
            .or_insert(RoomPeer { peer, joined_at: now });
    }
}

struct Inner {
    rooms: Mutex<HashMap<RoomId, Room>>,
    directory: RoomDirectory,
    engine: EncryptionEngine,
    connections: ConnectionManager,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<Inner>,
}

impl RoomRegistry {
    pub fn new(
        directory: RoomDirectory,
        engine: EncryptionEngine,
        connections: ConnectionManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: Mutex::new(HashMap::new()),
                directory,
                engine,
                connections,
                clock,
            }),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomId, Room>> {
        self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn local_peer(&self) -> Result<PeerId> {
        self.inner
            .connections
            .local_id()
            .await
            .ok_or(CoreError::NotInitialized("connection manager"))
    }

    /// Create a room owned by this node. Public and ephemeral rooms are
    /// announced; private rooms stay local and come with an invite code.
    pub async fn create_room(&self, creation: RoomCreation) -> Result<CreatedRoom> {
        let owner = self.local_peer().await?;
        let now = self.inner.clock.now();
        let is_private = creation.room_type == RoomType::Private;

        let metadata = RoomMetadata {
            id: RoomId::new(),
            name: creation.name,
            description: creation.description,
            room_type: creation.room_type,
            is_private,
            owner: owner.clone(),
            tags: creation.tags,
            active_users: 0,
            created_at: now,
            expires_at: creation.expires_in.map(|lifetime| now + lifetime),
            policy: creation.policy,
            encrypted: None,
        };

        let (metadata, invite) = if is_private {
            let invite = self.invite_code(&metadata, &owner, now).await?;
            (metadata, Some(invite))
        } else {
            (self.inner.directory.announce_room(metadata).await?, None)
        };

        let mut room = Room::new(metadata.clone());
        room.add_peer(owner, now);
        self.rooms().insert(metadata.id, room);
        info!(room = %metadata.id, kind = ?metadata.room_type, "Room created");
        Ok(CreatedRoom { metadata, invite })
    }

    async fn invite_code(
        &self,
        metadata: &RoomMetadata,
        owner: &PeerId,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.inner
            .engine
            .create_room_invite(
                metadata.id,
                &metadata.name,
                owner,
                now,
                Duration::seconds(INVITE_DURATION_SECS),
            )
            .await
    }

    /// Fresh invite code for a private room this node owns.
    pub async fn invite(&self, room_id: &RoomId) -> Result<String> {
        let owner = self.local_peer().await?;
        let metadata = self
            .room(room_id)
            .ok_or_else(|| CoreError::NotFound(format!("room {room_id}")))?;
        if !metadata.is_private || metadata.owner != owner {
            return Err(CoreError::Permission(format!(
                "no invites for room {room_id}"
            )));
        }
        self.invite_code(&metadata, &owner, self.inner.clock.now())
            .await
    }

    /// Join a public room from the directory.
    pub async fn join_room(&self, room_id: &RoomId) -> Result<RoomMetadata> {
        let metadata = self.inner.directory.join_room(room_id).await?;
        self.record_joined(metadata.clone(), self.local_peer().await?);
        Ok(metadata)
    }

    /// Redeem an invite code: check its signature and expiry, then connect
    /// to the room owner.
    pub async fn join_with_invite(&self, code: &str) -> Result<RoomMetadata> {
        let invite = RoomInvite::decode(code)?;
        let now = self.inner.clock.now();
        invite.verify(now)?;

        let payload = invite.payload;
        let owner = PeerId::new(payload.owner);
        self.inner.connections.connect_to_peer(&owner).await?;

        let room_id = RoomId(payload.room_id);
        let metadata = self.room(&room_id).unwrap_or(RoomMetadata {
            id: room_id,
            name: payload.room_name,
            description: String::new(),
            room_type: RoomType::Private,
            is_private: true,
            owner,
            tags: Vec::new(),
            active_users: 0,
            created_at: payload.created_at,
            expires_at: None,
            policy: RoomPolicy::default(),
            encrypted: None,
        });
        self.record_joined(metadata.clone(), self.local_peer().await?);
        info!(room = %room_id, "Joined private room");
        Ok(metadata)
    }

    fn record_joined(&self, metadata: RoomMetadata, local: PeerId) {
        let now = self.inner.clock.now();
        let mut rooms = self.rooms();
        let owner = metadata.owner.clone();
        let room = rooms
            .entry(metadata.id)
            .or_insert_with(|| Room::new(metadata.clone()));
        room.metadata = metadata;
        room.add_peer(owner, now);
        room.add_peer(local, now);
    }

    /// Forget a room locally, giving back its directory slot if it was
    /// joined from there.
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        let room = self
            .rooms()
            .remove(room_id)
            .ok_or_else(|| CoreError::NotFound(format!("room {room_id}")))?;

        let local = self.local_peer().await?;
        if !room.metadata.is_private && room.metadata.owner != local {
            match self.inner.directory.leave_room(room_id) {
                Ok(_) | Err(CoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(room = %room_id, "Left room");
        Ok(())
    }

    /// Add a message to a room's log. Encrypted messages must carry their
    /// iv and key id.
    pub fn append_message(&self, room_id: &RoomId, message: Message) -> Result<()> {
        message.validate()?;
        let mut rooms = self.rooms();
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| CoreError::NotFound(format!("room {room_id}")))?;
        let now = self.inner.clock.now();
        room.add_peer(message.sender.clone(), now);
        room.messages.push(message);
        Ok(())
    }

    /// Messages of a room in arrival order.
    pub fn messages(&self, room_id: &RoomId) -> Vec<Message> {
        self.rooms()
            .get(room_id)
            .map(|r| r.messages.clone())
            .unwrap_or_default()
    }

    pub fn room(&self, room_id: &RoomId) -> Option<RoomMetadata> {
        self.rooms().get(room_id).map(|r| r.metadata.clone())
    }

    pub fn peers(&self, room_id: &RoomId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .rooms()
            .get(room_id)
            .map(|r| r.peers.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms().keys().copied().collect()
    }

    /// Drop messages whose lifetime ended. Returns how many were dropped.
    pub fn purge_expired_messages(&self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        for room in self.rooms().values_mut() {
            let before = room.messages.len();
            room.messages.retain(|m| !m.is_expired(now));
            purged += before - room.messages.len();
        }
        purged
    }
}

impl Sweepable for RoomRegistry {
    fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.purge_expired_messages(now);
        let mut rooms = self.rooms();
        let before = rooms.len();
        rooms.retain(|_, room| !room.metadata.is_expired(now));
        Ok(purged + before - rooms.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::compose_text_message;
    use chatterlink_net::MemoryNetwork;
    use chatterlink_shared::{ManualClock, PrivacyLevel};
    use chatterlink_store::MemoryStore;
    use std::time::Duration as StdDuration;

    struct Peer {
        registry: RoomRegistry,
        directory: RoomDirectory,
        engine: EncryptionEngine,
    }

    async fn peer(network: &MemoryNetwork, name: &str, clock: &ManualClock) -> Peer {
        let store = Arc::new(MemoryStore::new());
        let engine = EncryptionEngine::new(store.clone());
        engine.initialize("pw", PrivacyLevel::Standard).await.unwrap();
        let connections = ConnectionManager::new(
            Arc::new(network.transport(name)),
            StdDuration::from_secs(1),
        );
        connections.initialize().await.unwrap();
        let directory = RoomDirectory::new(
            engine.clone(),
            connections.clone(),
            store,
            Arc::new(clock.clone()),
        )
        .unwrap();
        let registry = RoomRegistry::new(
            directory.clone(),
            engine.clone(),
            connections,
            Arc::new(clock.clone()),
        );
        Peer {
            registry,
            directory,
            engine,
        }
    }

    #[tokio::test]
    async fn test_create_public_room_uses_defaults() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::default();
        let alice = peer(&network, "alice", &clock).await;

        let created = alice
            .registry
            .create_room(RoomCreation::new("Lobby", RoomType::Public).tags(["general"]))
            .await
            .unwrap();
        assert!(created.invite.is_none());
        assert_eq!(created.metadata.policy, RoomPolicy::default());
        assert_eq!(created.metadata.policy.max_participants, 50);
        assert_eq!(created.metadata.active_users, 0);
        assert!(created.metadata.encrypted.is_some());
        assert_eq!(alice.directory.search_rooms(None, None).len(), 1);
        assert_eq!(alice.registry.peers(&created.metadata.id), vec![PeerId::from("alice")]);
    }

    #[tokio::test]
    async fn test_private_room_invite_flow() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::default();
        let alice = peer(&network, "alice", &clock).await;
        let bob = peer(&network, "bob", &clock).await;

        let created = alice
            .registry
            .create_room(RoomCreation::new("Back room", RoomType::Private))
            .await
            .unwrap();
        let code = created.invite.unwrap();
        assert!(alice.directory.search_rooms(None, None).is_empty());
        assert!(alice.directory.get(&created.metadata.id).is_none());

        let joined = bob.registry.join_with_invite(&code).await.unwrap();
        assert_eq!(joined.id, created.metadata.id);
        assert_eq!(joined.name, "Back room");
        assert!(joined.is_private);
        assert_eq!(
            bob.registry.peers(&joined.id),
            vec![PeerId::from("alice"), PeerId::from("bob")]
        );

        assert!(matches!(
            bob.registry.invite(&joined.id).await,
            Err(CoreError::Permission(_))
        ));
        assert!(alice.registry.invite(&created.metadata.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_invite_rejections() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::default();
        let alice = peer(&network, "alice", &clock).await;
        let bob = peer(&network, "bob", &clock).await;

        let code = alice
            .registry
            .create_room(RoomCreation::new("Vault", RoomType::Private))
            .await
            .unwrap()
            .invite
            .unwrap();

        assert!(matches!(
            bob.registry.join_with_invite("not-a-code").await,
            Err(CoreError::Permission(_))
        ));

        clock.advance(Duration::seconds(INVITE_DURATION_SECS + 1));
        assert!(matches!(
            bob.registry.join_with_invite(&code).await,
            Err(CoreError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn test_join_and_leave_public_room() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::default();
        let alice = peer(&network, "alice", &clock).await;
        let bob = peer(&network, "bob", &clock).await;

        let created = alice
            .registry
            .create_room(RoomCreation::new("Lobby", RoomType::Public))
            .await
            .unwrap();
        // bob learns about the room the way an announcement would deliver it
        bob.directory
            .ingest_announcement(created.metadata.clone())
            .unwrap();

        let joined = bob.registry.join_room(&created.metadata.id).await.unwrap();
        assert_eq!(joined.active_users, 1);
        assert!(bob.registry.room(&joined.id).is_some());

        bob.registry.leave_room(&joined.id).await.unwrap();
        assert!(bob.registry.room(&joined.id).is_none());
        assert_eq!(bob.directory.get(&joined.id).unwrap().active_users, 0);
        assert!(matches!(
            bob.registry.leave_room(&joined.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_message_log_and_expiry() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::default();
        let alice = peer(&network, "alice", &clock).await;
        let id = alice
            .registry
            .create_room(RoomCreation::new("Chat", RoomType::Public))
            .await
            .unwrap()
            .metadata
            .id;

        let lasting = compose_text_message(&alice.engine, "alice".into(), "stays", None, clock.now())
            .await
            .unwrap();
        let fleeting = compose_text_message(
            &alice.engine,
            "alice".into(),
            "goes",
            Some(Duration::seconds(10)),
            clock.now(),
        )
        .await
        .unwrap();
        alice.registry.append_message(&id, lasting.clone()).unwrap();
        alice.registry.append_message(&id, fleeting).unwrap();
        assert_eq!(alice.registry.messages(&id).len(), 2);

        let mut broken = lasting.clone();
        broken.key_id = None;
        assert!(matches!(
            alice.registry.append_message(&id, broken),
            Err(CoreError::Serialization(_))
        ));
        assert!(matches!(
            alice.registry.append_message(&RoomId::new(), lasting.clone()),
            Err(CoreError::NotFound(_))
        ));

        clock.advance(Duration::seconds(11));
        assert_eq!(alice.registry.purge_expired_messages(clock.now()), 1);
        assert_eq!(alice.registry.messages(&id), vec![lasting]);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_rooms() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::default();
        let alice = peer(&network, "alice", &clock).await;
        alice
            .registry
            .create_room(RoomCreation::new("Pop-up", RoomType::Ephemeral).expires_in(Duration::minutes(5)))
            .await
            .unwrap();
        alice
            .registry
            .create_room(RoomCreation::new("Forever", RoomType::Public))
            .await
            .unwrap();

        clock.advance(Duration::minutes(6));
        assert_eq!(alice.registry.sweep(clock.now()).unwrap(), 1);
        assert_eq!(alice.registry.room_ids().len(), 1);
    }
}
