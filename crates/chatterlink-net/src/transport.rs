//! Transport abstraction for peer sessions.
//!
//! A transport hands the connection manager [`Link`]s: a pair of frame
//! channels connected to one remote peer. Implementations own the socket
//! plumbing (framing, encryption) behind those channels; a closed channel
//! means the underlying connection is gone.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use chatterlink_shared::PeerId;

use crate::error::{NetError, Result};

/// Per-link frame buffer depth.
pub const LINK_BUFFER: usize = 256;

/// An established, bidirectional frame pipe to one peer.
pub struct Link {
    pub peer: PeerId,
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

/// A bound local endpoint. Dropping the guard stops accepting connections.
pub struct Endpoint {
    pub local_id: PeerId,
    pub incoming: mpsc::Receiver<Link>,
    pub guard: EndpointGuard,
}

impl Endpoint {
    pub fn new(
        local_id: PeerId,
        incoming: mpsc::Receiver<Link>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            local_id,
            incoming,
            guard: EndpointGuard {
                release: Some(Box::new(release)),
            },
        }
    }
}

pub struct EndpointGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bring up the local endpoint and start accepting links.
    async fn bind(&self) -> Result<Endpoint>;

    /// Open a link to `peer`. May wait indefinitely; callers apply timeouts.
    async fn dial(&self, local: &PeerId, peer: &PeerId) -> Result<Link>;
}

/// Build the two ends of an in-process link.
pub fn link_pair(a: PeerId, b: PeerId) -> (Link, Link) {
    let (a_tx, a_rx) = mpsc::channel(LINK_BUFFER);
    let (b_tx, b_rx) = mpsc::channel(LINK_BUFFER);
    (
        // held by `a`, talks to `b`
        Link {
            peer: b,
            tx: a_tx,
            rx: b_rx,
        },
        Link {
            peer: a,
            tx: b_tx,
            rx: a_rx,
        },
    )
}

// ---------------------------------------------------------------------------
// In-memory network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Hub {
    listeners: HashMap<PeerId, mpsc::Sender<Link>>,
    blackholes: HashSet<PeerId>,
}

/// Shared in-process network. Every [`MemoryTransport`] created from it
/// can reach the others by name.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, addr: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            addr: PeerId::new(addr),
        }
    }

    /// Dials to `peer` never complete.
    pub fn blackhole(&self, peer: &PeerId) {
        self.with_hub(|hub| {
            hub.blackholes.insert(peer.clone());
        });
    }

    fn with_hub<R>(&self, f: impl FnOnce(&mut Hub) -> R) -> R {
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut hub)
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(&self) -> Result<Endpoint> {
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        self.network.with_hub(|hub| {
            hub.listeners.insert(self.addr.clone(), tx);
        });
        debug!(addr = %self.addr, "memory endpoint bound");

        let network = self.network.clone();
        let addr = self.addr.clone();
        Ok(Endpoint::new(self.addr.clone(), rx, move || {
            network.with_hub(|hub| {
                hub.listeners.remove(&addr);
            });
        }))
    }

    async fn dial(&self, local: &PeerId, peer: &PeerId) -> Result<Link> {
        let (listener, blackholed) = self.network.with_hub(|hub| {
            (
                hub.listeners.get(peer).cloned(),
                hub.blackholes.contains(peer),
            )
        });

        if blackholed {
            std::future::pending::<()>().await;
        }

        let listener = listener.ok_or_else(|| NetError::connection(peer, "no such peer"))?;
        let (ours, theirs) = link_pair(local.clone(), peer.clone());
        listener
            .send(theirs)
            .await
            .map_err(|_| NetError::connection(peer, "peer stopped accepting"))?;
        Ok(ours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_dial_and_exchange() {
        let net = MemoryNetwork::new();
        let alice = net.transport("alice");
        let bob = net.transport("bob");

        let mut bob_ep = bob.bind().await.unwrap();
        let mut link = alice
            .dial(&PeerId::from("alice"), &PeerId::from("bob"))
            .await
            .unwrap();
        let mut accepted = bob_ep.incoming.recv().await.unwrap();
        assert_eq!(accepted.peer, PeerId::from("alice"));

        link.tx.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(accepted.rx.recv().await.unwrap(), b"ping");
        accepted.tx.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(link.rx.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_fails() {
        let net = MemoryNetwork::new();
        let alice = net.transport("alice");
        let err = alice
            .dial(&PeerId::from("alice"), &PeerId::from("nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_dropping_endpoint_unbinds() {
        let net = MemoryNetwork::new();
        let bob = net.transport("bob");
        let ep = bob.bind().await.unwrap();
        drop(ep);

        let alice = net.transport("alice");
        assert!(alice
            .dial(&PeerId::from("alice"), &PeerId::from("bob"))
            .await
            .is_err());
    }
}
