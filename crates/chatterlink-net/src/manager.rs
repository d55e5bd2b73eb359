//! Connection Manager.
//!
//! Owns the session table and the local endpoint. Each open session gets one
//! reader task that forwards its frames, in arrival order, into a single
//! channel; one dispatch loop drains that channel, decodes wire messages and
//! invokes the registered handlers. Per-session order is therefore preserved,
//! with no ordering across sessions.

use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatterlink_shared::protocol::{RoomMetadata, WireMessage};
use chatterlink_shared::{PeerId, RoomId, SessionState};

use crate::error::{NetError, Result};
use crate::session::{SessionSender, SessionTable};
use crate::transport::{Endpoint, EndpointGuard, Link, Transport};

const INBOUND_BUFFER: usize = 1024;

/// How long a send may wait on a full session buffer before the session
/// counts as failed.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub type HandlerId = u64;

type MessageHandler = Arc<dyn Fn(&PeerId, &WireMessage) + Send + Sync>;
type RoomHandler = Arc<dyn Fn(&RoomMetadata) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: HandlerId,
    message: Vec<(HandlerId, MessageHandler)>,
    room: Vec<(HandlerId, RoomHandler)>,
}

enum Inbound {
    Frame {
        peer: PeerId,
        bytes: Vec<u8>,
    },
    Closed {
        peer: PeerId,
        generation: u64,
    },
}

struct Runtime {
    local_id: PeerId,
    inbound_tx: mpsc::Sender<Inbound>,
    accept_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
    _endpoint: EndpointGuard,
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.dispatch_task.abort();
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    sessions: RwLock<SessionTable>,
    handlers: StdRwLock<Handlers>,
    runtime: Mutex<Option<Runtime>>,
}

/// Cheaply clonable handle to the node's peer sessions.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                connect_timeout,
                sessions: RwLock::new(SessionTable::new()),
                handlers: StdRwLock::new(Handlers::default()),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Bring up the local endpoint and start the accept and dispatch loops.
    /// Repeated calls return the same id without re-initializing.
    pub async fn initialize(&self) -> Result<PeerId> {
        let mut runtime = self.inner.runtime.lock().await;
        if let Some(rt) = runtime.as_ref() {
            return Ok(rt.local_id.clone());
        }

        let Endpoint {
            local_id,
            incoming,
            guard,
        } = self.inner.transport.bind().await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let dispatch_task = tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), inbound_rx));
        let accept_task = tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            incoming,
            inbound_tx.clone(),
        ));

        info!(local = %local_id, "Connection manager initialized");
        *runtime = Some(Runtime {
            local_id: local_id.clone(),
            inbound_tx,
            accept_task,
            dispatch_task,
            _endpoint: guard,
        });
        Ok(local_id)
    }

    pub async fn local_id(&self) -> Option<PeerId> {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.local_id.clone())
    }

    async fn runtime_handles(&self) -> Result<(PeerId, mpsc::Sender<Inbound>)> {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| (rt.local_id.clone(), rt.inbound_tx.clone()))
            .ok_or(NetError::NotInitialized)
    }

    /// Open an outbound session to `peer`. Returns once the session is open;
    /// does nothing if one already is.
    pub async fn connect_to_peer(&self, peer: &PeerId) -> Result<()> {
        let (local_id, inbound_tx) = self.runtime_handles().await?;
        if *peer == local_id {
            return Ok(());
        }

        let generation = {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.is_open(peer) {
                return Ok(());
            }
            sessions.begin_connecting(peer).ok_or_else(|| {
                NetError::connection(peer, "connection attempt already in progress")
            })?
        };

        debug!(peer = %peer, "Dialing peer");
        let dialed = tokio::time::timeout(
            self.inner.connect_timeout,
            self.inner.transport.dial(&local_id, peer),
        )
        .await;

        let link = match dialed {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.inner.sessions.write().await.close(peer, Some(generation));
                warn!(peer = %peer, error = %e, "Connection failed");
                return Err(e);
            }
            Err(_) => {
                self.inner.sessions.write().await.close(peer, Some(generation));
                let secs = self.inner.connect_timeout.as_secs();
                warn!(peer = %peer, secs, "Connection timed out");
                return Err(NetError::Timeout {
                    peer: peer.clone(),
                    secs,
                });
            }
        };

        let Link { tx, rx, .. } = link;
        let reader = spawn_reader(peer.clone(), generation, rx, inbound_tx);
        let mut sessions = self.inner.sessions.write().await;
        match sessions.mark_open(peer, generation, tx, reader) {
            Ok(()) => {
                info!(peer = %peer, generation, "Session open");
                Ok(())
            }
            Err(reader) => {
                reader.abort();
                // an inbound session from the same peer won the race
                if sessions.is_open(peer) {
                    Ok(())
                } else {
                    Err(NetError::connection(peer, "session closed while connecting"))
                }
            }
        }
    }

    /// Send `message` to every open session. Sessions that are closed, or
    /// that stay full for [`SEND_TIMEOUT`], are dropped; returns how many
    /// sessions accepted the frame.
    pub async fn broadcast_to_peers(&self, message: &WireMessage) -> Result<usize> {
        self.runtime_handles().await?;
        let bytes = message.to_bytes()?;
        let senders = self.inner.sessions.read().await.open_senders();

        let results = join_all(senders.iter().map(|s| send_frame(s, bytes.clone()))).await;

        let mut reached = 0;
        let mut failed = Vec::new();
        for (sender, result) in senders.iter().zip(results) {
            match result {
                Ok(()) => reached += 1,
                Err(reason) => failed.push((sender, reason)),
            }
        }

        if !failed.is_empty() {
            let mut sessions = self.inner.sessions.write().await;
            for (sender, reason) in failed {
                if sessions.close(&sender.peer, Some(sender.generation)) {
                    warn!(peer = %sender.peer, reason, "Dropped session after failed send");
                }
            }
        }

        debug!(reached, "Broadcast sent");
        Ok(reached)
    }

    /// Relay a room-scoped payload to every open session.
    pub async fn broadcast_to_room(&self, room_id: RoomId, data: serde_json::Value) -> Result<usize> {
        self.broadcast_to_peers(&WireMessage::RoomRelay { room_id, data })
            .await
    }

    pub async fn send_to_peer(&self, peer: &PeerId, message: &WireMessage) -> Result<()> {
        self.runtime_handles().await?;
        let sender = self
            .inner
            .sessions
            .read()
            .await
            .sender(peer)
            .ok_or_else(|| NetError::NotConnected(peer.clone()))?;

        if let Err(reason) = send_frame(&sender, message.to_bytes()?).await {
            self.inner
                .sessions
                .write()
                .await
                .close(peer, Some(sender.generation));
            warn!(peer = %peer, reason, "Dropped session after failed send");
            return Err(NetError::connection(peer, reason));
        }
        Ok(())
    }

    /// Register a handler for every decoded inbound message.
    pub fn on_message(
        &self,
        handler: impl Fn(&PeerId, &WireMessage) + Send + Sync + 'static,
    ) -> HandlerId {
        self.with_handlers(|h| {
            h.next_id += 1;
            h.message.push((h.next_id, Arc::new(handler)));
            h.next_id
        })
    }

    /// Register a handler for inbound room announcements.
    pub fn on_room_update(
        &self,
        handler: impl Fn(&RoomMetadata) + Send + Sync + 'static,
    ) -> HandlerId {
        self.with_handlers(|h| {
            h.next_id += 1;
            h.room.push((h.next_id, Arc::new(handler)));
            h.next_id
        })
    }

    /// Unregister a handler. Returns whether it was registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.with_handlers(|h| {
            let before = h.message.len() + h.room.len();
            h.message.retain(|(hid, _)| *hid != id);
            h.room.retain(|(hid, _)| *hid != id);
            before != h.message.len() + h.room.len()
        })
    }

    fn with_handlers<R>(&self, f: impl FnOnce(&mut Handlers) -> R) -> R {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut handlers)
    }

    /// Close every session and release the local endpoint. Safe to call when
    /// already disconnected.
    pub async fn disconnect(&self) {
        let runtime = self.inner.runtime.lock().await.take();
        let closed = self.inner.sessions.write().await.close_all();
        if let Some(runtime) = runtime {
            info!(local = %runtime.local_id, closed, "Disconnected");
        }
    }

    pub async fn session_state(&self, peer: &PeerId) -> Option<SessionState> {
        self.inner.sessions.read().await.state(peer)
    }

    pub async fn open_peers(&self) -> Vec<PeerId> {
        self.inner.sessions.read().await.open_peers()
    }
}

async fn send_frame(sender: &SessionSender, bytes: Vec<u8>) -> std::result::Result<(), &'static str> {
    match tokio::time::timeout(SEND_TIMEOUT, sender.tx.send(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err("session closed"),
        Err(_) => Err("session stalled"),
    }
}

fn spawn_reader(
    peer: PeerId,
    generation: u64,
    mut rx: mpsc::Receiver<Vec<u8>>,
    inbound_tx: mpsc::Sender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let frame = Inbound::Frame {
                peer: peer.clone(),
                bytes,
            };
            if inbound_tx.send(frame).await.is_err() {
                return;
            }
        }
        let _ = inbound_tx.send(Inbound::Closed { peer, generation }).await;
    })
}

async fn accept_loop(
    inner: Weak<Inner>,
    mut incoming: mpsc::Receiver<Link>,
    inbound_tx: mpsc::Sender<Inbound>,
) {
    while let Some(Link { peer, tx, rx }) = incoming.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let reader_peer = peer.clone();
        let reader_tx = inbound_tx.clone();
        let generation = inner.sessions.write().await.insert_open(&peer, tx, move |g| {
            spawn_reader(reader_peer, g, rx, reader_tx)
        });
        info!(peer = %peer, generation, "Accepted inbound session");
    }
}

async fn dispatch_loop(inner: Weak<Inner>, mut inbound_rx: mpsc::Receiver<Inbound>) {
    while let Some(event) = inbound_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Inbound::Frame { peer, bytes } => inner.dispatch(&peer, &bytes),
            Inbound::Closed { peer, generation } => {
                if inner.sessions.write().await.close(&peer, Some(generation)) {
                    info!(peer = %peer, "Session closed by remote");
                }
            }
        }
    }
}

impl Inner {
    fn dispatch(&self, peer: &PeerId, bytes: &[u8]) {
        let message = match WireMessage::from_bytes(bytes) {
            Ok(WireMessage::Unknown) => {
                debug!(peer = %peer, "Ignoring message of unknown type");
                return;
            }
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Ignoring undecodable frame");
                return;
            }
        };

        let (message_handlers, room_handlers) = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            (
                handlers
                    .message
                    .iter()
                    .map(|(_, h)| Arc::clone(h))
                    .collect::<Vec<_>>(),
                handlers
                    .room
                    .iter()
                    .map(|(_, h)| Arc::clone(h))
                    .collect::<Vec<_>>(),
            )
        };

        if let WireMessage::RoomAnnouncement { metadata } = &message {
            for handler in &room_handlers {
                handler(metadata);
            }
        }
        for handler in &message_handlers {
            handler(peer, &message);
        }
    }
}
