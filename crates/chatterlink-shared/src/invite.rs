use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{self, Identity};

/// Default lifetime of a private room invite (24 hours)
pub const INVITE_DURATION_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvitePayload {
    pub room_id: Uuid,
    pub room_name: String,
    /// Peer address of the room owner, dialed on join.
    pub owner: String,
    pub inviter_pubkey: [u8; 32],
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Signed, copiable invitation to a private room. Private rooms never show
/// up in directory search; this token is their only join path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInvite {
    pub payload: InvitePayload,
    pub signature: Vec<u8>,
}

impl RoomInvite {
    pub fn create(
        identity: &Identity,
        room_id: Uuid,
        room_name: String,
        owner: String,
        now: DateTime<Utc>,
        valid_for: Duration,
    ) -> Result<Self, InviteError> {
        let payload = InvitePayload {
            room_id,
            room_name,
            owner,
            inviter_pubkey: identity.public_key_bytes(),
            created_at: now,
            expires_at: now + valid_for,
        };
        let signature = identity.sign_bytes(&payload.signed_bytes()?);
        Ok(Self { payload, signature })
    }

    /// Copiable code: bincode of the whole token, base64url without padding.
    pub fn encode(&self) -> Result<String, InviteError> {
        let bytes = bincode::serialize(self).map_err(|_| InviteError::InvalidFormat)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(code: &str) -> Result<Self, InviteError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(code.trim())
            .map_err(|_| InviteError::Base64Decode)?;
        bincode::deserialize(&bytes).map_err(|_| InviteError::InvalidFormat)
    }

    /// Expiry first, then the inviter's signature over the payload.
    pub fn verify(&self, now: DateTime<Utc>) -> Result<(), InviteError> {
        if now > self.payload.expires_at {
            return Err(InviteError::Expired);
        }
        let signed = self.payload.signed_bytes()?;
        if identity::verify(&self.payload.inviter_pubkey, &signed, &self.signature) {
            Ok(())
        } else {
            Err(InviteError::InvalidSignature)
        }
    }
}

impl InvitePayload {
    fn signed_bytes(&self) -> Result<Vec<u8>, InviteError> {
        bincode::serialize(self).map_err(|_| InviteError::InvalidFormat)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("Invalid invite format")]
    InvalidFormat,

    #[error("Invite has expired")]
    Expired,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Base64 decode error")]
    Base64Decode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite(identity: &Identity, now: DateTime<Utc>) -> RoomInvite {
        RoomInvite::create(
            identity,
            Uuid::new_v4(),
            "secret-room".to_string(),
            "10.0.0.7:4100".to_string(),
            now,
            Duration::seconds(INVITE_DURATION_SECS),
        )
        .unwrap()
    }

    #[test]
    fn test_invite_roundtrip() {
        let identity = Identity::generate();
        let now = Utc::now();
        let token = invite(&identity, now);

        let code = token.encode().unwrap();
        let decoded = RoomInvite::decode(&code).expect("decode should work");
        decoded.verify(now).expect("verify should pass");

        assert_eq!(decoded.payload, token.payload);
        assert_eq!(decoded.payload.inviter_pubkey, identity.public_key_bytes());
    }

    #[test]
    fn test_invite_tampered_fails() {
        let identity = Identity::generate();
        let now = Utc::now();
        let mut bad_token = invite(&identity, now);
        bad_token.payload.owner = "6.6.6.6:4100".to_string();
        assert!(matches!(
            bad_token.verify(now),
            Err(InviteError::InvalidSignature)
        ));
    }

    #[test]
    fn test_invite_expired() {
        let identity = Identity::generate();
        let now = Utc::now();
        let token = invite(&identity, now);
        let later = now + Duration::seconds(INVITE_DURATION_SECS + 1);
        assert!(matches!(token.verify(later), Err(InviteError::Expired)));
    }

    #[test]
    fn test_garbage_code() {
        assert!(RoomInvite::decode("%%%").is_err());
        assert!(RoomInvite::decode("AAAA").is_err());
    }
}
