use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Peer identity = transport address string (host:port, onion address, or
// an in-memory hub name)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RoomId(pub Uuid);

impl RoomId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How much protection content gets.
///
/// - `Basic`: no content encryption.
/// - `Standard`: authenticated symmetric encryption and signatures.
/// - `Maximum`: standard plus key splitting, post-quantum file keys and
///   anonymized transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    Basic,
    #[default]
    Standard,
    Maximum,
}

impl PrivacyLevel {
    pub fn encrypts(self) -> bool {
        !matches!(self, Self::Basic)
    }
}

impl FromStr for PrivacyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "maximum" => Ok(Self::Maximum),
            other => Err(format!("unknown privacy level: {other}")),
        }
    }
}

impl fmt::Display for PrivacyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Maximum => "maximum",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Public,
    Private,
    Ephemeral,
}

/// Lifecycle of a peer session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Closed)
                | (Self::Open, Self::Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Open));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Open.can_transition_to(Connecting));
    }

    #[test]
    fn test_privacy_level_parse() {
        assert_eq!("Maximum".parse::<PrivacyLevel>().unwrap(), PrivacyLevel::Maximum);
        assert_eq!(" basic ".parse::<PrivacyLevel>().unwrap(), PrivacyLevel::Basic);
        assert!("paranoid".parse::<PrivacyLevel>().is_err());
        assert!(!PrivacyLevel::Basic.encrypts());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let peer = PeerId::from("127.0.0.1:4100");
        assert_eq!(serde_json::to_string(&peer).unwrap(), "\"127.0.0.1:4100\"");

        let room = RoomId::new();
        assert_eq!(serde_json::to_string(&room).unwrap(), format!("\"{}\"", room.0));
    }
}
