//! Node configuration loaded from environment variables.
//!
//! All settings have defaults so a node can start with zero configuration
//! for local development.

use std::path::PathBuf;
use std::time::Duration;

use chatterlink_net::TorConfig;
use chatterlink_shared::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_FILE_SIZE, HIDDEN_SERVICE_PORT,
    SWEEP_INTERVAL_SECS,
};
use chatterlink_shared::{PeerId, PrivacyLevel};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// TCP address the node listens on.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:4100`
    pub listen_addr: String,

    /// Address peers should dial to reach this node, when it differs from
    /// the listen address.
    /// Env: `ADVERTISED_ADDR`
    pub advertised_addr: Option<String>,

    /// Directory holding the key-value database.
    /// Env: `DATA_DIR`
    /// Default: the platform data directory.
    pub data_dir: Option<PathBuf>,

    /// Filesystem path where encrypted blobs are stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Maximum blob size in bytes.
    pub max_blob_size: usize,

    /// Env: `PRIVACY_LEVEL` (basic / standard / maximum)
    /// Default: `standard`
    pub privacy_level: PrivacyLevel,

    /// Password the master key is derived from.
    /// Env: `CHATTERLINK_PASSWORD`
    pub password: Option<String>,

    /// Tor control port, SOCKS proxy and control password.
    /// Env: `TOR_CONTROL_ADDR`, `TOR_SOCKS_ADDR`, `TOR_CONTROL_PASSWORD`
    pub tor: TorConfig,

    /// Virtual port of the hidden endpoint published at the maximum level.
    /// Env: `HIDDEN_SERVICE_PORT`
    /// Default: `8080`
    pub hidden_service_port: u16,

    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: `60`
    pub sweep_interval: Duration,

    /// Env: `CONNECT_TIMEOUT_SECS`
    /// Default: `30`
    pub connect_timeout: Duration,

    /// Lifetime of outgoing chat messages (`0` keeps them forever).
    /// Env: `MESSAGE_LIFETIME_SECS`
    pub message_lifetime: Option<chrono::Duration>,

    /// Peers dialed at startup (comma separated addresses).
    /// Env: `BOOTSTRAP_PEERS`
    pub bootstrap_peers: Vec<PeerId>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            advertised_addr: None,
            data_dir: None,
            blob_storage_path: PathBuf::from("./blobs"),
            max_blob_size: DEFAULT_MAX_FILE_SIZE as usize,
            privacy_level: PrivacyLevel::default(),
            password: None,
            tor: TorConfig::default(),
            hidden_service_port: HIDDEN_SERVICE_PORT,
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            message_lifetime: None,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Some(addr) = lookup("ADVERTISED_ADDR").filter(|a| !a.is_empty()) {
            config.advertised_addr = Some(addr);
        }

        if let Some(path) = lookup("DATA_DIR") {
            config.data_dir = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(level) = lookup("PRIVACY_LEVEL") {
            match level.parse::<PrivacyLevel>() {
                Ok(parsed) => config.privacy_level = parsed,
                Err(_) => tracing::warn!(value = %level, "Invalid PRIVACY_LEVEL, using default"),
            }
        }

        if let Some(password) = lookup("CHATTERLINK_PASSWORD").filter(|p| !p.is_empty()) {
            config.password = Some(password);
        }

        // -- Tor --

        if let Some(addr) = lookup("TOR_CONTROL_ADDR") {
            config.tor.control_addr = addr;
        }

        if let Some(addr) = lookup("TOR_SOCKS_ADDR") {
            config.tor.socks_addr = addr;
        }

        if let Some(password) = lookup("TOR_CONTROL_PASSWORD").filter(|p| !p.is_empty()) {
            config.tor.control_password = Some(password);
        }

        if let Some(port) = parse_var::<u16>(&lookup, "HIDDEN_SERVICE_PORT") {
            config.hidden_service_port = port;
        }

        // hidden service traffic lands on the listen port
        if let Some(port) = config
            .listen_addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
        {
            config.tor.target_port = port;
        }

        // -- Timing --

        if let Some(secs) = parse_var::<u64>(&lookup, "SWEEP_INTERVAL_SECS") {
            if secs == 0 {
                tracing::warn!("SWEEP_INTERVAL_SECS must be positive, using default");
            } else {
                config.sweep_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<i64>(&lookup, "MESSAGE_LIFETIME_SECS") {
            config.message_lifetime = (secs > 0).then(|| chrono::Duration::seconds(secs));
        }

        if let Some(peers) = lookup("BOOTSTRAP_PEERS") {
            config.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PeerId::from)
                .collect();
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid numeric setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> NodeConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]);
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.privacy_level, PrivacyLevel::Standard);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.tor.target_port, 4100);
        assert!(config.message_lifetime.is_none());
        assert!(config.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("LISTEN_ADDR", "127.0.0.1:5000"),
            ("PRIVACY_LEVEL", "maximum"),
            ("HIDDEN_SERVICE_PORT", "9999"),
            ("MESSAGE_LIFETIME_SECS", "3600"),
            ("BOOTSTRAP_PEERS", "10.0.0.1:4100, 10.0.0.2:4100,,"),
            ("TOR_CONTROL_PASSWORD", "secret"),
        ]);
        assert_eq!(config.privacy_level, PrivacyLevel::Maximum);
        assert_eq!(config.hidden_service_port, 9999);
        assert_eq!(config.tor.target_port, 5000);
        assert_eq!(config.tor.control_password.as_deref(), Some("secret"));
        assert_eq!(config.message_lifetime, Some(chrono::Duration::hours(1)));
        assert_eq!(
            config.bootstrap_peers,
            vec![PeerId::from("10.0.0.1:4100"), PeerId::from("10.0.0.2:4100")]
        );
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("PRIVACY_LEVEL", "paranoid"),
            ("SWEEP_INTERVAL_SECS", "0"),
            ("CONNECT_TIMEOUT_SECS", "soon"),
        ]);
        assert_eq!(config.privacy_level, PrivacyLevel::Standard);
        assert_eq!(config.sweep_interval, Duration::from_secs(SWEEP_INTERVAL_SECS));
        assert_eq!(config.connect_timeout, Duration::from_secs(CONNECT_TIMEOUT_SECS));
    }
}
