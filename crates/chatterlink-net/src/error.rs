use thiserror::Error;

use chatterlink_shared::error::{NoiseError, ProtocolError};
use chatterlink_shared::PeerId;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Connection to {peer} failed: {reason}")]
    Connection { peer: PeerId, reason: String },

    #[error("Connection to {peer} timed out after {secs}s")]
    Timeout { peer: PeerId, secs: u64 },

    #[error("Connection manager is not initialized")]
    NotInitialized,

    #[error("No open session with {0}")]
    NotConnected(PeerId),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Handshake error: {0}")]
    Handshake(#[from] NoiseError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Tor error: {0}")]
    Tor(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    pub fn connection(peer: &PeerId, reason: impl Into<String>) -> Self {
        Self::Connection {
            peer: peer.clone(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
