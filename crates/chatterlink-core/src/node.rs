//! A complete node: every service wired to the others.
//!
//! Inbound wire messages reach the node through the Connection Manager's
//! handlers, which only queue them. A single bridge task drains that queue in
//! arrival order, hands each message to the owning service and emits a
//! [`NodeEvent`].

use std::sync::{Arc, Mutex};

use chrono::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatterlink_net::{AnonymizingTransport, ConnectionManager, HandlerId, Transport};
use chatterlink_shared::protocol::{FileShare, Message, WireMessage};
use chatterlink_shared::{Clock, PeerId, RoomId};
use chatterlink_store::{BlobStore, KeyValueStore};

use crate::config::NodeConfig;
use crate::directory::RoomDirectory;
use crate::engine::EncryptionEngine;
use crate::error::{CoreError, Result};
use crate::events::{emit_event, NodeEvent, EVENT_BUFFER};
use crate::files::{FileDescriptor, FileTransferEngine};
use crate::messages::compose_text_message;
use crate::rooms::RoomRegistry;
use crate::sweep::{spawn_sweeper, SweepHandle, Sweepable};
use crate::vault::FileVault;

/// External collaborators a node runs on.
pub struct NodeBackends {
    pub store: Arc<dyn KeyValueStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub transport: Arc<dyn Transport>,
    pub anonymizer: Option<Arc<dyn AnonymizingTransport>>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct Running {
    handlers: Vec<HandlerId>,
    bridge: Option<JoinHandle<()>>,
    sweepers: Vec<SweepHandle>,
}

pub struct Node {
    config: NodeConfig,
    engine: EncryptionEngine,
    connections: ConnectionManager,
    directory: RoomDirectory,
    rooms: RoomRegistry,
    files: FileTransferEngine,
    vault: FileVault,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<NodeEvent>,
    running: Mutex<Running>,
}

impl Node {
    pub fn new(config: NodeConfig, backends: NodeBackends) -> Result<Self> {
        let NodeBackends {
            store,
            blobs,
            transport,
            anonymizer,
            clock,
        } = backends;

        let mut engine = EncryptionEngine::new(store.clone());
        if let Some(anonymizer) = anonymizer {
            engine = engine.with_anonymizer(anonymizer, config.hidden_service_port);
        }
        let connections = ConnectionManager::new(transport, config.connect_timeout);
        let directory = RoomDirectory::new(
            engine.clone(),
            connections.clone(),
            store.clone(),
            clock.clone(),
        )?;
        let rooms = RoomRegistry::new(
            directory.clone(),
            engine.clone(),
            connections.clone(),
            clock.clone(),
        );
        let files = FileTransferEngine::new(engine.clone(), clock.clone());
        let vault = FileVault::new(engine.clone(), blobs, store);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            config,
            engine,
            connections,
            directory,
            rooms,
            files,
            vault,
            clock,
            events,
            running: Mutex::new(Running::default()),
        })
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Initialize the engine at the configured level, bring up the local
    /// endpoint, start the sweepers and dial the bootstrap peers.
    pub async fn start(&self, password: &str) -> Result<PeerId> {
        self.engine
            .initialize(password, self.config.privacy_level)
            .await?;
        let local = match self.connections.initialize().await {
            Ok(local) => local,
            Err(e) => {
                self.engine.cleanup().await;
                return Err(e.into());
            }
        };

        self.start_bridge();
        self.start_sweepers();

        for peer in &self.config.bootstrap_peers {
            match self.connections.connect_to_peer(peer).await {
                Ok(()) => info!(peer = %peer, "Connected to bootstrap peer"),
                Err(e) => warn!(peer = %peer, error = %e, "Bootstrap peer unreachable"),
            }
        }

        info!(
            local = %local,
            level = %self.config.privacy_level,
            hidden = ?self.engine.hidden_address().await,
            "Node started"
        );
        Ok(local)
    }

    fn start_bridge(&self) {
        let (tx, rx) = mpsc::unbounded_channel();

        let directory = self.directory.clone();
        let events = self.events.clone();
        let room_handler = self.connections.on_room_update(move |metadata| {
            match directory.ingest_announcement(metadata.clone()) {
                Ok(true) => emit_event(
                    &events,
                    NodeEvent::RoomDiscovered {
                        room: metadata.clone(),
                    },
                ),
                Ok(false) => {}
                Err(e) => warn!(room = %metadata.id, error = %e, "Failed to ingest announcement"),
            }
        });

        let message_handler = self.connections.on_message(move |peer, message| {
            if matches!(message, WireMessage::RoomAnnouncement { .. }) {
                return;
            }
            if tx.send((peer.clone(), message.clone())).is_err() {
                debug!(peer = %peer, "Inbound bridge stopped");
            }
        });

        let bridge = tokio::spawn(bridge_loop(
            rx,
            self.rooms.clone(),
            self.files.clone(),
            self.events.clone(),
        ));

        let mut running = self.running();
        running.handlers.extend([room_handler, message_handler]);
        if let Some(old) = running.bridge.replace(bridge) {
            old.abort();
        }
    }

    fn start_sweepers(&self) {
        let interval = self.config.sweep_interval;
        let targets: [(&'static str, Arc<dyn Sweepable>); 3] = [
            ("rooms", Arc::new(self.directory.clone())),
            ("room-log", Arc::new(self.rooms.clone())),
            ("files", Arc::new(self.files.clone())),
        ];
        let handles: Vec<SweepHandle> = targets
            .into_iter()
            .map(|(name, target)| spawn_sweeper(name, interval, self.clock.clone(), target))
            .collect();
        self.running().sweepers = handles;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    async fn local_peer(&self) -> Result<PeerId> {
        self.connections
            .local_id()
            .await
            .ok_or(CoreError::NotInitialized("connection manager"))
    }

    /// Post a text message to a room and relay it to the open sessions.
    pub async fn send_room_message(&self, room_id: &RoomId, text: &str) -> Result<Message> {
        if self.rooms.room(room_id).is_none() {
            return Err(CoreError::NotFound(format!("room {room_id}")));
        }
        let message = compose_text_message(
            &self.engine,
            self.local_peer().await?,
            text,
            self.config.message_lifetime,
            self.clock.now(),
        )
        .await?;
        self.rooms.append_message(room_id, message.clone())?;
        self.connections
            .broadcast_to_room(*room_id, serde_json::to_value(&message)?)
            .await?;
        Ok(message)
    }

    pub async fn send_direct_message(&self, peer: &PeerId, text: &str) -> Result<Message> {
        let message = compose_text_message(
            &self.engine,
            self.local_peer().await?,
            text,
            self.config.message_lifetime,
            self.clock.now(),
        )
        .await?;
        self.connections
            .send_to_peer(
                peer,
                &WireMessage::Chat {
                    message: message.clone(),
                },
            )
            .await?;
        Ok(message)
    }

    /// Upload a file and offer it, chunk by chunk, to every open session.
    pub async fn share_file(
        &self,
        name: &str,
        mime_type: &str,
        bytes: &[u8],
        expires_in: Duration,
    ) -> Result<FileShare> {
        let share = self
            .files
            .prepare_file_upload(
                FileDescriptor {
                    name: name.to_string(),
                    mime_type: mime_type.to_string(),
                    size: bytes.len() as u64,
                },
                expires_in,
            )
            .await?;
        let chunks = self.files.upload_file(&share.id, bytes).await?;

        let reached = self
            .connections
            .broadcast_to_peers(&WireMessage::FileOffer {
                share: share.clone(),
            })
            .await?;
        for chunk in chunks {
            self.connections
                .broadcast_to_peers(&WireMessage::FileChunk { chunk })
                .await?;
        }
        info!(file = %share.id, reached, "File shared");
        Ok(share)
    }

    /// Stop background work, close every session and drop key material.
    pub async fn shutdown(&self) {
        let running = std::mem::take(&mut *self.running());
        for id in running.handlers {
            self.connections.remove_handler(id);
        }
        if let Some(bridge) = running.bridge {
            bridge.abort();
        }
        drop(running.sweepers);

        self.connections.disconnect().await;
        self.engine.cleanup().await;
        info!("Node stopped");
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn engine(&self) -> &EncryptionEngine {
        &self.engine
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn files(&self) -> &FileTransferEngine {
        &self.files
    }

    pub fn vault(&self) -> &FileVault {
        &self.vault
    }
}

async fn bridge_loop(
    mut rx: mpsc::UnboundedReceiver<(PeerId, WireMessage)>,
    rooms: RoomRegistry,
    files: FileTransferEngine,
    events: broadcast::Sender<NodeEvent>,
) {
    while let Some((peer, message)) = rx.recv().await {
        match message {
            WireMessage::Chat { message } => {
                if let Err(e) = message.validate() {
                    warn!(peer = %peer, error = %e, "Dropping malformed chat message");
                    continue;
                }
                emit_event(&events, NodeEvent::ChatReceived { from: peer, message });
            }
            WireMessage::RoomRelay { room_id, data } => {
                let message: Message = match serde_json::from_value(data) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(peer = %peer, room = %room_id, error = %e, "Ignoring room payload");
                        continue;
                    }
                };
                match rooms.append_message(&room_id, message.clone()) {
                    Ok(()) => emit_event(
                        &events,
                        NodeEvent::RoomMessage {
                            room_id,
                            from: peer,
                            message,
                        },
                    ),
                    Err(CoreError::NotFound(_)) => {
                        debug!(room = %room_id, "Message for a room we are not in");
                    }
                    Err(e) => warn!(peer = %peer, room = %room_id, error = %e, "Dropping room message"),
                }
            }
            WireMessage::FileOffer { share } => match files.register_share(share.clone()).await {
                Ok(()) => emit_event(&events, NodeEvent::FileOffered { from: peer, share }),
                Err(e) => warn!(peer = %peer, file = %share.id, error = %e, "Rejected file offer"),
            },
            WireMessage::FileChunk { chunk } => {
                let file_id = chunk.file_id;
                let index = chunk.index;
                if let Err(e) = files.accept_chunk(chunk) {
                    warn!(peer = %peer, file = %file_id, index, error = %e, "Rejected file chunk");
                    continue;
                }
                let complete = files
                    .share(&file_id)
                    .is_some_and(|s| files.buffered_chunks(&file_id) == s.chunks as usize);
                if complete {
                    emit_event(&events, NodeEvent::FileReady { file_id });
                }
            }
            WireMessage::RoomAnnouncement { .. } | WireMessage::Unknown => {}
        }
    }
}
