/// Application name
pub const APP_NAME: &str = "Chatterlink";

/// Wire protocol version, sent in the session hello frame
pub const PROTOCOL_VERSION: &str = "chatterlink/1";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Password salt size in bytes
pub const SALT_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 iteration count for the master key
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Fixed size of a file chunk in bytes (64 KiB)
pub const FILE_CHUNK_SIZE: usize = 65_536;

/// Largest file a share may declare (2 GiB)
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Master key split under the maximum privacy level
pub const KEY_SHARE_THRESHOLD: u8 = 3;
pub const KEY_SHARE_TOTAL: u8 = 5;

/// Room defaults
pub const DEFAULT_MAX_PARTICIPANTS: u32 = 50;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_FILE_RETENTION_SECS: i64 = 24 * 60 * 60;

/// Interval between expiry sweeps
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// Outbound session establishment timeout
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Largest frame accepted on a session (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Port exposed through the anonymizing overlay
pub const HIDDEN_SERVICE_PORT: u16 = 8080;

/// Default TCP listen address for the node
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4100";

/// Tor defaults
pub const DEFAULT_TOR_CONTROL_ADDR: &str = "127.0.0.1:9051";
pub const DEFAULT_TOR_SOCKS_ADDR: &str = "127.0.0.1:9050";

/// Rendered in place of a message that failed to decrypt
pub const DECRYPTION_FAILED_PLACEHOLDER: &str = "[Encrypted message - decryption failed]";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_HYBRID_KEY: &str = "chatterlink-hybrid-key-v1";
pub const KDF_CONTEXT_STORE_KEY: &str = "chatterlink-store-key-v1";
