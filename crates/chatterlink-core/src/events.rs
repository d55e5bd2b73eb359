use serde::Serialize;
use tokio::sync::broadcast;

use chatterlink_shared::protocol::{FileShare, Message, RoomMetadata};
use chatterlink_shared::{FileId, PeerId, RoomId};

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_BUFFER: usize = 256;

/// What a node surfaces to its embedder as peers talk to it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NodeEvent {
    /// Direct chat message from a peer.
    ChatReceived { from: PeerId, message: Message },

    /// Message relayed into a room this node is part of.
    RoomMessage {
        room_id: RoomId,
        from: PeerId,
        message: Message,
    },

    /// Room announcement taken into the directory.
    RoomDiscovered { room: RoomMetadata },

    FileOffered { from: PeerId, share: FileShare },

    /// Every chunk of an offered file has been received and verified.
    FileReady { file_id: FileId },
}

pub fn emit_event(tx: &broadcast::Sender<NodeEvent>, event: NodeEvent) {
    if tx.send(event).is_err() {
        tracing::trace!("No event subscribers");
    }
}
