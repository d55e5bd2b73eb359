//! Peer sessions for Chatterlink: the transport abstraction, a Noise-secured
//! TCP transport, an in-process transport, the Tor-backed anonymizing
//! transport and the Connection Manager that ties them together.

pub mod error;
pub mod manager;
pub mod session;
pub mod tcp;
pub mod tor;
pub mod transport;

pub use error::{NetError, Result};
pub use manager::{ConnectionManager, HandlerId};
pub use session::{PeerSession, SessionSender, SessionTable};
pub use tcp::TcpTransport;
pub use tor::{AnonymizingTransport, FetchResponse, TorConfig, TorController, TorService};
pub use transport::{Endpoint, Link, MemoryNetwork, MemoryTransport, Transport};
