//! Types and cryptographic primitives shared by every Chatterlink crate.

pub mod clock;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod invite;
pub mod noise;
pub mod protocol;
pub mod quantum;
pub mod sharing;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{FileId, PeerId, PrivacyLevel, RoomId, RoomType, SessionState};
