//! Peer session tracking.
//!
//! Every session moves `Connecting -> Open -> Closed` (or straight from
//! `Connecting` to `Closed`). Closed sessions are removed from the table, so a
//! later connection to the same peer starts a fresh entry with a new
//! generation number. Generations let late events from a replaced session be
//! told apart from the current one.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chatterlink_shared::{PeerId, SessionState};

/// One tracked peer session.
#[derive(Debug)]
pub struct PeerSession {
    pub peer: PeerId,
    pub state: SessionState,
    pub generation: u64,
    /// Set once the session is open.
    pub established_at: Option<Instant>,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl PeerSession {
    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                peer = %self.peer,
                from = ?self.state,
                to = ?next,
                "Rejected session transition"
            );
            return false;
        }
        debug!(peer = %self.peer, from = ?self.state, to = ?next, "Session transition");
        self.state = next;
        true
    }

    fn shut(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.tx = None;
        self.transition(SessionState::Closed);
    }
}

/// What a session writer needs to send on an open session.
#[derive(Debug, Clone)]
pub struct SessionSender {
    pub peer: PeerId,
    pub generation: u64,
    pub tx: mpsc::Sender<Vec<u8>>,
}

/// Table of live sessions keyed by peer id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<PeerId, PeerSession>,
    next_generation: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Start an outbound attempt. Returns the new generation, or `None` if a
    /// session to `peer` is already connecting or open.
    pub fn begin_connecting(&mut self, peer: &PeerId) -> Option<u64> {
        if self.sessions.contains_key(peer) {
            return None;
        }
        let generation = self.allocate_generation();
        debug!(peer = %peer, generation, "Session connecting");
        self.sessions.insert(
            peer.clone(),
            PeerSession {
                peer: peer.clone(),
                state: SessionState::Connecting,
                generation,
                established_at: None,
                tx: None,
                reader: None,
            },
        );
        Some(generation)
    }

    /// Complete an outbound attempt. Fails (returning the reader so the
    /// caller can stop it) if the attempt was closed or replaced meanwhile.
    pub fn mark_open(
        &mut self,
        peer: &PeerId,
        generation: u64,
        tx: mpsc::Sender<Vec<u8>>,
        reader: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let Some(session) = self
            .sessions
            .get_mut(peer)
            .filter(|s| s.generation == generation)
        else {
            return Err(reader);
        };
        if !session.transition(SessionState::Open) {
            return Err(reader);
        }
        session.tx = Some(tx);
        session.reader = Some(reader);
        session.established_at = Some(Instant::now());
        Ok(())
    }

    /// Register an accepted inbound session as open, replacing whatever was
    /// tracked for that peer before. `spawn_reader` receives the new
    /// generation.
    pub fn insert_open(
        &mut self,
        peer: &PeerId,
        tx: mpsc::Sender<Vec<u8>>,
        spawn_reader: impl FnOnce(u64) -> JoinHandle<()>,
    ) -> u64 {
        if let Some(mut old) = self.sessions.remove(peer) {
            debug!(peer = %peer, generation = old.generation, "Replacing session");
            old.shut();
        }
        let generation = self.allocate_generation();
        self.sessions.insert(
            peer.clone(),
            PeerSession {
                peer: peer.clone(),
                state: SessionState::Open,
                generation,
                established_at: Some(Instant::now()),
                tx: Some(tx),
                reader: Some(spawn_reader(generation)),
            },
        );
        debug!(peer = %peer, generation, "Session open (inbound)");
        generation
    }

    /// Close and remove the session for `peer`. With a generation, only that
    /// exact session is closed. Returns whether anything was removed.
    pub fn close(&mut self, peer: &PeerId, generation: Option<u64>) -> bool {
        let matches = self
            .sessions
            .get(peer)
            .is_some_and(|s| generation.map_or(true, |g| s.generation == g));
        if !matches {
            return false;
        }
        if let Some(mut session) = self.sessions.remove(peer) {
            session.shut();
        }
        true
    }

    /// Close every session. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let count = self.sessions.len();
        for (_, mut session) in self.sessions.drain() {
            session.shut();
        }
        count
    }

    pub fn state(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer).map(|s| s.state)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.state(peer) == Some(SessionState::Open)
    }

    pub fn sender(&self, peer: &PeerId) -> Option<SessionSender> {
        let session = self.sessions.get(peer)?;
        Some(SessionSender {
            peer: session.peer.clone(),
            generation: session.generation,
            tx: session.tx.clone()?,
        })
    }

    /// Snapshot of the senders of every open session.
    pub fn open_senders(&self) -> Vec<SessionSender> {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Open)
            .filter_map(|s| {
                Some(SessionSender {
                    peer: s.peer.clone(),
                    generation: s.generation,
                    tx: s.tx.clone()?,
                })
            })
            .collect()
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Open)
            .map(|s| s.peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn open_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Open)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_reader() -> JoinHandle<()> {
        tokio::spawn(std::future::pending())
    }

    #[tokio::test]
    async fn test_outbound_lifecycle() {
        let mut table = SessionTable::new();
        let peer = PeerId::from("bob");
        let (tx, _rx) = mpsc::channel(1);

        let generation = table.begin_connecting(&peer).unwrap();
        assert_eq!(table.state(&peer), Some(SessionState::Connecting));
        assert!(table.begin_connecting(&peer).is_none());
        assert!(table.open_senders().is_empty());

        table.mark_open(&peer, generation, tx, idle_reader()).unwrap();
        assert!(table.is_open(&peer));
        assert!(table.get(&peer).unwrap().established_at.is_some());
        assert_eq!(table.open_peers(), vec![peer.clone()]);

        assert!(table.close(&peer, Some(generation)));
        assert_eq!(table.state(&peer), None);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_connecting_can_close_without_opening() {
        let mut table = SessionTable::new();
        let peer = PeerId::from("bob");
        let generation = table.begin_connecting(&peer).unwrap();
        assert!(table.close(&peer, Some(generation)));

        // a late open for the closed attempt is refused
        let (tx, _rx) = mpsc::channel(1);
        let reader = table
            .mark_open(&peer, generation, tx, idle_reader())
            .unwrap_err();
        reader.abort();
        assert_eq!(table.state(&peer), None);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let mut table = SessionTable::new();
        let peer = PeerId::from("carol");
        let (tx, _rx) = mpsc::channel(1);

        let first = table.insert_open(&peer, tx.clone(), |_| idle_reader());
        let second = table.insert_open(&peer, tx, |_| idle_reader());
        assert_ne!(first, second);
        assert_eq!(table.len(), 1);

        assert!(!table.close(&peer, Some(first)));
        assert!(table.is_open(&peer));
        assert!(table.close(&peer, None));
    }

    #[tokio::test]
    async fn test_close_all() {
        let mut table = SessionTable::new();
        let (tx, _rx) = mpsc::channel(1);
        table.insert_open(&PeerId::from("a"), tx.clone(), |_| idle_reader());
        table.insert_open(&PeerId::from("b"), tx, |_| idle_reader());
        table.begin_connecting(&PeerId::from("c"));

        assert_eq!(table.open_count(), 2);
        assert_eq!(table.close_all(), 3);
        assert!(table.is_empty());
        assert_eq!(table.close_all(), 0);
    }
}
