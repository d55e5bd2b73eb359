use thiserror::Error;

use chatterlink_net::NetError;
use chatterlink_shared::error::{CryptoError, ProtocolError, QuantumError, SharingError};
use chatterlink_shared::invite::InviteError;
use chatterlink_store::StoreError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Encryption setup failed: {0}")]
    CryptoInit(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Signature verification failed")]
    Signature,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Incomplete transfer: {received} of {expected} chunks")]
    IncompleteTransfer { received: usize, expected: u32 },

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<NetError> for CoreError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::NotInitialized => Self::NotInitialized("connection manager"),
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        Self::Decryption(e.to_string())
    }
}

impl From<QuantumError> for CoreError {
    fn from(e: QuantumError) -> Self {
        Self::Decryption(e.to_string())
    }
}

impl From<SharingError> for CoreError {
    fn from(e: SharingError) -> Self {
        match e {
            SharingError::NotInitialized => Self::NotInitialized("secret sharing service"),
            other => Self::CryptoInit(other.to_string()),
        }
    }
}

impl From<InviteError> for CoreError {
    fn from(e: InviteError) -> Self {
        match e {
            InviteError::Expired => Self::Expired("invite".into()),
            InviteError::InvalidSignature => Self::Signature,
            other => Self::Permission(other.to_string()),
        }
    }
}

impl From<ProtocolError> for CoreError {
    fn from(e: ProtocolError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for CoreError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Decryption(format!("malformed base64: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
