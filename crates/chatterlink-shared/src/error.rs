use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encoding error: {0}")]
    Encoding(String),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,
}

#[derive(Error, Debug)]
pub enum NoiseError {
    #[error("Noise handshake error: {0}")]
    Handshake(String),

    #[error("Noise transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QuantumError {
    #[error("Malformed post-quantum key material")]
    InvalidKey,

    #[error("Hybrid ciphertext is truncated")]
    Truncated,

    #[error("Hybrid decryption failed")]
    DecryptionFailed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SharingError {
    #[error("Secret sharing service is not initialized")]
    NotInitialized,

    #[error("Invalid split parameters: threshold {threshold}, total {total}")]
    InvalidParameters { threshold: u8, total: u8 },

    #[error("Not enough shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },

    #[error("Shares come from different splits")]
    InconsistentShares,

    #[error("Duplicate share index {0}")]
    DuplicateShare(u8),

    #[error("Malformed share: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Encrypted message {0} is missing its iv or key id")]
    MissingEncryptionParams(uuid::Uuid),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
