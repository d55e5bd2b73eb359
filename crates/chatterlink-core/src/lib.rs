//! # chatterlink-core
//!
//! The node-level services of Chatterlink:
//!
//! - **Encryption Engine**: tiered key management, message sealing,
//!   signatures, key splitting and post-quantum file-key protection
//! - **Room Directory**: announce, search, join and expire rooms
//! - **Room registry**: rooms this node is in, invites and message logs
//! - **File Transfer Engine**: chunked, signed, encrypted file transfer
//! - **File vault**: encrypted files in the content-addressed blob store
//! - **Node**: the composition root that wires them to the Connection
//!   Manager and runs the periodic sweeps

pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod events;
pub mod files;
pub mod logging;
pub mod messages;
pub mod node;
pub mod rooms;
pub mod sweep;
pub mod vault;

#[cfg(test)]
mod testing;

pub use config::NodeConfig;
pub use directory::RoomDirectory;
pub use engine::{EncryptedPayload, EncryptionEngine, FileKey};
pub use error::{CoreError, Result};
pub use events::NodeEvent;
pub use files::{AssembledFile, FileDescriptor, FileTransferEngine};
pub use node::{Node, NodeBackends};
pub use rooms::{CreatedRoom, Room, RoomCreation, RoomRegistry};
pub use sweep::{spawn_sweeper, SweepHandle, Sweepable};
pub use vault::{FileVault, StoredFile};
