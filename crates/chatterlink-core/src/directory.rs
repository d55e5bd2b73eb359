//! Room Directory.
//!
//! A local cache of room metadata that doubles as this node's slice of the
//! room DHT. Rooms enter the cache when announced locally or received from a
//! peer, and leave it when they expire.
//!
//! Every announcement seals the descriptive fields into an
//! [`EncryptedEnvelope`]. Public rooms additionally keep those fields in the
//! clear so they stay searchable; private rooms only travel with the sealed
//! copy and never show up in search.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use chatterlink_net::{ConnectionManager, NetError};
use chatterlink_shared::protocol::{EncryptedEnvelope, RoomMetadata, WireMessage};
use chatterlink_shared::{Clock, RoomId};
use chatterlink_store::KeyValueStore;

use crate::engine::EncryptionEngine;
use crate::error::{CoreError, Result};
use crate::sweep::Sweepable;

/// Key-value entry holding the persisted public room set.
pub const ROOMS_KEY: &str = "dht_rooms";

struct Inner {
    rooms: Mutex<HashMap<RoomId, RoomMetadata>>,
    engine: EncryptionEngine,
    connections: ConnectionManager,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct RoomDirectory {
    inner: Arc<Inner>,
}

impl RoomDirectory {
    /// Build the directory, restoring the persisted public rooms that have
    /// not expired yet.
    pub fn new(
        engine: EncryptionEngine,
        connections: ConnectionManager,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let now = clock.now();
        let persisted: Vec<RoomMetadata> = store.get_json(ROOMS_KEY)?.unwrap_or_default();
        let total = persisted.len();
        let rooms: HashMap<RoomId, RoomMetadata> = persisted
            .into_iter()
            .filter(|room| !room.is_expired(now))
            .map(|room| (room.id, room))
            .collect();
        debug!(restored = rooms.len(), dropped = total - rooms.len(), "Room directory loaded");

        Ok(Self {
            inner: Arc::new(Inner {
                rooms: Mutex::new(rooms),
                engine,
                connections,
                store,
                clock,
            }),
        })
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomId, RoomMetadata>> {
        self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, rooms: &HashMap<RoomId, RoomMetadata>) -> Result<()> {
        let public: Vec<&RoomMetadata> = rooms.values().filter(|r| !r.is_private).collect();
        self.inner.store.set_json(ROOMS_KEY, &public)?;
        Ok(())
    }

    /// Seal the room's descriptive fields, cache and persist it, then send
    /// it to every open session. Returns the metadata as stored.
    pub async fn announce_room(&self, mut room: RoomMetadata) -> Result<RoomMetadata> {
        room.encrypted = Some(self.seal_descriptor(&room).await?);

        {
            let mut rooms = self.rooms();
            rooms.insert(room.id, room.clone());
            self.persist(&rooms)?;
        }

        let announcement = WireMessage::RoomAnnouncement {
            metadata: room.broadcast_view(),
        };
        let reached = match self.inner.connections.broadcast_to_peers(&announcement).await {
            Ok(reached) => reached,
            Err(NetError::NotInitialized) => 0,
            Err(e) => return Err(e.into()),
        };
        info!(room = %room.id, private = room.is_private, reached, "Room announced");
        Ok(room)
    }

    async fn seal_descriptor(&self, room: &RoomMetadata) -> Result<EncryptedEnvelope> {
        let descriptor = serde_json::to_vec(&room.descriptor())?;
        let payload = self.inner.engine.encrypt_message(&descriptor).await?;

        let signature = match self.inner.engine.sign_data(payload.ciphertext.as_bytes()).await {
            Ok(sig) => Some(STANDARD.encode(sig)),
            Err(CoreError::NotInitialized(_)) => None,
            Err(e) => return Err(e),
        };

        Ok(EncryptedEnvelope {
            iv: payload.iv,
            data: payload.ciphertext,
            key_id: payload.key_id,
            signature,
        })
    }

    /// Take in an announcement received from a peer. Expired metadata is
    /// ignored; anything else replaces the cached entry with the same id.
    pub fn ingest_announcement(&self, room: RoomMetadata) -> Result<bool> {
        if room.is_expired(self.inner.clock.now()) {
            debug!(room = %room.id, "Ignoring expired announcement");
            return Ok(false);
        }
        let mut rooms = self.rooms();
        let id = room.id;
        let private = room.is_private;
        rooms.insert(id, room);
        if !private {
            self.persist(&rooms)?;
        }
        debug!(room = %id, "Announcement ingested");
        Ok(true)
    }

    /// Public, unexpired rooms, newest first. `query` matches name or
    /// description case-insensitively; `tags` matches rooms carrying at least
    /// one of them.
    pub fn search_rooms(&self, query: Option<&str>, tags: Option<&[String]>) -> Vec<RoomMetadata> {
        let now = self.inner.clock.now();
        let mut results: Vec<RoomMetadata> = self
            .rooms()
            .values()
            .filter(|room| !room.is_private && !room.is_expired(now))
            .filter(|room| query.map_or(true, |q| room.matches_query(q)))
            .filter(|room| tags.map_or(true, |t| room.matches_any_tag(t)))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results
    }

    pub fn get(&self, room_id: &RoomId) -> Option<RoomMetadata> {
        self.rooms().get(room_id).cloned()
    }

    fn check_joinable(&self, room_id: &RoomId, now: DateTime<Utc>) -> Result<RoomMetadata> {
        let rooms = self.rooms();
        let room = rooms
            .get(room_id)
            .ok_or_else(|| CoreError::NotFound(format!("room {room_id}")))?;
        validate_join(room, now)?;
        Ok(room.clone())
    }

    /// Join a public room: connect to its owner and take one participant
    /// slot.
    pub async fn join_room(&self, room_id: &RoomId) -> Result<RoomMetadata> {
        let room = self.check_joinable(room_id, self.inner.clock.now())?;

        self.inner.connections.connect_to_peer(&room.owner).await?;

        // the room may have filled up or expired while we were connecting
        let now = self.inner.clock.now();
        let mut rooms = self.rooms();
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| CoreError::NotFound(format!("room {room_id}")))?;
        validate_join(room, now)?;
        room.active_users += 1;
        let joined = room.clone();
        self.persist(&rooms)?;

        info!(room = %room_id, active = joined.active_users, "Joined room");
        Ok(joined)
    }

    /// Give back a participant slot taken by [`join_room`](Self::join_room).
    pub fn leave_room(&self, room_id: &RoomId) -> Result<RoomMetadata> {
        let mut rooms = self.rooms();
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| CoreError::NotFound(format!("room {room_id}")))?;
        room.active_users = room.active_users.saturating_sub(1);
        let left = room.clone();
        self.persist(&rooms)?;
        debug!(room = %room_id, active = left.active_users, "Left room");
        Ok(left)
    }

    pub fn len(&self) -> usize {
        self.rooms().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms().is_empty()
    }
}

fn validate_join(room: &RoomMetadata, now: DateTime<Utc>) -> Result<()> {
    if room.is_private {
        return Err(CoreError::Permission(format!(
            "room {} is private and can only be joined with an invite",
            room.id
        )));
    }
    if room.is_expired(now) {
        return Err(CoreError::Expired(format!("room {}", room.id)));
    }
    if room.is_full() {
        return Err(CoreError::Capacity(format!(
            "room {} is full ({} participants)",
            room.id, room.policy.max_participants
        )));
    }
    Ok(())
}

impl Sweepable for RoomDirectory {
    fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut rooms = self.rooms();
        let before = rooms.len();
        rooms.retain(|_, room| !room.is_expired(now));
        let removed = before - rooms.len();
        if removed > 0 {
            if let Err(e) = self.persist(&rooms) {
                warn!(error = %e, "Failed to persist swept room set");
                return Err(e);
            }
        }
        Ok(removed)
    }
}
