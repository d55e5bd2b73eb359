//! Anonymizing transport over a local Tor daemon.
//!
//! The control port (control-spec.txt) is used to authenticate and publish an
//! ephemeral onion service; peer connections go through Tor's SOCKS5 proxy,
//! and HTTP fetches through `reqwest` with a `socks5h` proxy so names resolve
//! inside Tor.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use chatterlink_shared::constants::{
    DEFAULT_TOR_CONTROL_ADDR, DEFAULT_TOR_SOCKS_ADDR, HIDDEN_SERVICE_PORT,
};

use crate::error::{NetError, Result};

/// Response body and status of an anonymized HTTP fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// An overlay that hides where traffic comes from.
#[async_trait]
pub trait AnonymizingTransport: Send + Sync {
    /// Connect to the overlay. Calling it again after success is a no-op.
    async fn initialize(&self) -> Result<()>;

    /// Publish a hidden endpoint on `port` and return its address.
    async fn create_hidden_endpoint(&self, port: u16) -> Result<String>;

    /// Open a stream to `address` (`host:port`, or a bare host using the
    /// hidden service port).
    async fn connect(&self, address: &str) -> Result<TcpStream>;

    async fn fetch(&self, url: &str) -> Result<FetchResponse>;

    /// Withdraw published endpoints and drop the overlay connection.
    async fn cleanup(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TorConfig {
    pub control_addr: String,
    pub socks_addr: String,
    pub control_password: Option<String>,
    /// Local port hidden-service traffic is forwarded to.
    pub target_port: u16,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            control_addr: DEFAULT_TOR_CONTROL_ADDR.to_string(),
            socks_addr: DEFAULT_TOR_SOCKS_ADDR.to_string(),
            control_password: None,
            target_port: HIDDEN_SERVICE_PORT,
        }
    }
}

// ---------------------------------------------------------------------------
// Control port
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ProtocolInfo {
    auth_methods: Vec<String>,
    cookie_file: Option<String>,
}

impl ProtocolInfo {
    fn parse(lines: &[String]) -> Self {
        let mut info = Self::default();
        for line in lines {
            let Some(auth) = line.strip_prefix("AUTH ") else {
                continue;
            };
            if let Some(start) = auth.find("METHODS=") {
                let rest = &auth[start + 8..];
                let end = rest.find(' ').unwrap_or(rest.len());
                info.auth_methods = rest[..end].split(',').map(String::from).collect();
            }
            if let Some(start) = auth.find("COOKIEFILE=\"") {
                let rest = &auth[start + 12..];
                if let Some(end) = rest.find('"') {
                    info.cookie_file = Some(rest[..end].to_string());
                }
            }
        }
        info
    }

    fn supports(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// Line-oriented client for Tor's control port.
pub struct TorController {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    authenticated: bool,
}

impl TorController {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetError::Tor(format!("failed to reach control port {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            authenticated: false,
        })
    }

    /// Send one command and collect the payload of its `250` reply lines.
    async fn command(&mut self, cmd: &str) -> Result<Vec<String>> {
        self.writer.write_all(format!("{cmd}\r\n").as_bytes()).await?;
        self.writer.flush().await?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(NetError::Tor("control port closed the connection".into()));
            }
            let line = line.trim_end();
            if line.len() < 4 {
                continue;
            }

            let (code, rest) = line.split_at(3);
            if !code.starts_with('2') {
                return Err(NetError::Tor(format!("control port error: {line}")));
            }
            lines.push(rest[1..].to_string());
            if rest.starts_with(' ') {
                break;
            }
        }
        Ok(lines)
    }

    /// Authenticate with a password when given, otherwise with whatever
    /// PROTOCOLINFO offers (cookie, then null).
    pub async fn authenticate(&mut self, password: Option<&str>) -> Result<()> {
        if let Some(password) = password {
            self.command(&format!("AUTHENTICATE \"{}\"", escape_tor_string(password)))
                .await?;
            self.authenticated = true;
            info!("Authenticated with Tor control port (password)");
            return Ok(());
        }

        let info = ProtocolInfo::parse(&self.command("PROTOCOLINFO 1").await?);
        debug!(methods = ?info.auth_methods, cookie = ?info.cookie_file, "Tor auth methods");

        if info.supports("COOKIE") || info.supports("SAFECOOKIE") {
            if let Some(path) = info.cookie_file.as_deref().filter(|p| Path::new(p).exists()) {
                let cookie = tokio::fs::read(path).await?;
                match self
                    .command(&format!("AUTHENTICATE {}", hex::encode(cookie)))
                    .await
                {
                    Ok(_) => {
                        self.authenticated = true;
                        info!("Authenticated with Tor control port (cookie)");
                        return Ok(());
                    }
                    Err(e) => warn!(path = %path, error = %e, "Cookie authentication failed"),
                }
            }
        }

        if info.supports("NULL") {
            self.command("AUTHENTICATE").await?;
            self.authenticated = true;
            info!("Authenticated with Tor control port");
            return Ok(());
        }

        Err(NetError::Tor("no usable control port authentication".into()))
    }

    /// Publish an ephemeral v3 onion service and return its service id.
    pub async fn add_onion(&mut self, virtual_port: u16, target_port: u16) -> Result<String> {
        if !self.authenticated {
            return Err(NetError::Tor("not authenticated".into()));
        }

        let response = self
            .command(&format!(
                "ADD_ONION NEW:ED25519-V3 Flags=DiscardPK Port={virtual_port},127.0.0.1:{target_port}"
            ))
            .await?;
        let service_id = response
            .iter()
            .find_map(|line| line.strip_prefix("ServiceID="))
            .map(str::to_string)
            .ok_or_else(|| NetError::Tor("no ServiceID in response".into()))?;

        info!(service_id = %service_id, virtual_port, target_port, "Created onion service");
        Ok(service_id)
    }

    pub async fn del_onion(&mut self, service_id: &str) -> Result<()> {
        if !self.authenticated {
            return Err(NetError::Tor("not authenticated".into()));
        }
        self.command(&format!("DEL_ONION {service_id}")).await?;
        info!(service_id = %service_id, "Removed onion service");
        Ok(())
    }
}

fn escape_tor_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

// ---------------------------------------------------------------------------
// SOCKS5
// ---------------------------------------------------------------------------

/// Open a stream to `host:port` through a SOCKS5 proxy using the domain
/// address type, so `.onion` names are resolved by the proxy.
pub async fn socks5_connect(socks_addr: &str, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(socks_addr)
        .await
        .map_err(|e| NetError::Tor(format!("failed to reach SOCKS proxy {socks_addr}: {e}")))?;

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting != [0x05, 0x00] {
        return Err(NetError::Tor("SOCKS5 authentication rejected".into()));
    }

    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(NetError::Tor("hostname too long".into()));
    }
    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host_bytes.len() as u8]);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        return Err(NetError::Tor("invalid SOCKS5 version in reply".into()));
    }
    if reply[1] != 0x00 {
        return Err(NetError::Tor(format!(
            "SOCKS5 connect failed: error code {}",
            reply[1]
        )));
    }

    // bound address, ignored
    let skip = match reply[3] {
        0x01 => 6,
        0x04 => 18,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(NetError::Tor(format!(
                "invalid SOCKS5 address type {other}"
            )))
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

fn split_host_port(address: &str) -> Result<(&str, u16)> {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| NetError::Tor(format!("invalid port in {address}")))?;
            Ok((host, port))
        }
        None => Ok((address, HIDDEN_SERVICE_PORT)),
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TorState {
    controller: Option<TorController>,
    http: Option<reqwest::Client>,
    onion_address: Option<String>,
    services: Vec<String>,
}

/// [`AnonymizingTransport`] backed by a local Tor daemon.
pub struct TorService {
    config: TorConfig,
    state: Mutex<TorState>,
}

impl TorService {
    pub fn new(config: TorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TorState::default()),
        }
    }

    /// The first onion address published through this service.
    pub async fn onion_address(&self) -> Option<String> {
        self.state.lock().await.onion_address.clone()
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.controller.is_some()
    }

    async fn publish(&self, state: &mut TorState, port: u16) -> Result<String> {
        let controller = state.controller.as_mut().ok_or(NetError::NotInitialized)?;
        let service_id = controller.add_onion(port, self.config.target_port).await?;
        let address = format!("{service_id}.onion");
        state.services.push(service_id);
        state.onion_address.get_or_insert_with(|| address.clone());
        Ok(address)
    }
}

#[async_trait]
impl AnonymizingTransport for TorService {
    async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.controller.is_some() {
            return Ok(());
        }

        let mut controller = TorController::connect(&self.config.control_addr).await?;
        controller
            .authenticate(self.config.control_password.as_deref())
            .await?;

        let proxy = reqwest::Proxy::all(format!("socks5h://{}", self.config.socks_addr))?;
        let http = reqwest::Client::builder().proxy(proxy).build()?;

        state.controller = Some(controller);
        state.http = Some(http);
        info!(control = %self.config.control_addr, "Tor service initialized");
        Ok(())
    }

    async fn create_hidden_endpoint(&self, port: u16) -> Result<String> {
        let mut state = self.state.lock().await;
        self.publish(&mut state, port).await
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        if !self.is_initialized().await {
            return Err(NetError::NotInitialized);
        }
        let (host, port) = split_host_port(address)?;
        debug!(host = %host, port, "Connecting through Tor");
        socks5_connect(&self.config.socks_addr, host, port).await
    }

    async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        let client = self
            .state
            .lock()
            .await
            .http
            .clone()
            .ok_or(NetError::NotInitialized)?;
        let response = client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(FetchResponse { status, body })
    }

    async fn cleanup(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let services = std::mem::take(&mut state.services);
        if let Some(controller) = state.controller.as_mut() {
            for service_id in services {
                if let Err(e) = controller.del_onion(&service_id).await {
                    warn!(service_id = %service_id, error = %e, "Failed to remove onion service");
                }
            }
        }
        *state = TorState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal control port: NULL auth, hands out one fixed service id.
    async fn fake_control_port() -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut seen = Vec::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                let reply = if line.starts_with("PROTOCOLINFO") {
                    "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250 OK\r\n".to_string()
                } else if line.starts_with("ADD_ONION") {
                    "250-ServiceID=abcdefexample\r\n250 OK\r\n".to_string()
                } else if line.starts_with("BOGUS") {
                    "510 Unrecognized command\r\n".to_string()
                } else {
                    "250 OK\r\n".to_string()
                };
                seen.push(line);
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[test]
    fn test_parse_protocol_info() {
        let lines = vec![
            "PROTOCOLINFO 1".to_string(),
            "AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/run/tor/control.authcookie\"".to_string(),
            "OK".to_string(),
        ];
        let info = ProtocolInfo::parse(&lines);
        assert!(info.supports("COOKIE"));
        assert!(!info.supports("NULL"));
        assert_eq!(
            info.cookie_file.as_deref(),
            Some("/run/tor/control.authcookie")
        );
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("abc.onion:4100").unwrap(), ("abc.onion", 4100));
        assert_eq!(
            split_host_port("abc.onion").unwrap(),
            ("abc.onion", HIDDEN_SERVICE_PORT)
        );
        assert!(split_host_port("abc.onion:http").is_err());
    }

    #[tokio::test]
    async fn test_controller_flow() {
        let (addr, server) = fake_control_port().await;
        let mut controller = TorController::connect(&addr).await.unwrap();

        assert!(controller.add_onion(80, 4100).await.is_err());
        controller.authenticate(None).await.unwrap();
        let id = controller.add_onion(80, 4100).await.unwrap();
        assert_eq!(id, "abcdefexample");
        controller.del_onion(&id).await.unwrap();
        assert!(controller.command("BOGUS").await.is_err());

        drop(controller);
        let seen = server.await.unwrap();
        assert_eq!(seen[0], "PROTOCOLINFO 1");
        assert_eq!(seen[1], "AUTHENTICATE");
        assert!(seen[2].starts_with("ADD_ONION NEW:ED25519-V3"));
        assert!(seen[2].ends_with("Port=80,127.0.0.1:4100"));
        assert_eq!(seen[3], "DEL_ONION abcdefexample");
    }

    #[tokio::test]
    async fn test_password_auth_is_escaped() {
        let (addr, server) = fake_control_port().await;
        let mut controller = TorController::connect(&addr).await.unwrap();
        controller.authenticate(Some("pa\"ss")).await.unwrap();
        drop(controller);
        let seen = server.await.unwrap();
        assert_eq!(seen[0], "AUTHENTICATE \"pa\\\"ss\"");
    }

    #[tokio::test]
    async fn test_socks5_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut host = vec![0u8; head[4] as usize];
            stream.read_exact(&mut host).await.unwrap();
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                .await
                .unwrap();
            stream.write_all(b"tunnel").await.unwrap();
            (String::from_utf8(host).unwrap(), u16::from_be_bytes(port))
        });

        let mut stream = socks5_connect(&socks_addr, "peer.onion", 8080)
            .await
            .unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");

        let (host, port) = server.await.unwrap();
        assert_eq!(host, "peer.onion");
        assert_eq!(port, 8080);
    }

    #[tokio::test]
    async fn test_service_requires_initialize() {
        let service = TorService::new(TorConfig::default());
        assert!(matches!(
            service.connect("peer.onion:80").await,
            Err(NetError::NotInitialized)
        ));
        assert!(matches!(
            service.fetch("http://example.onion/").await,
            Err(NetError::NotInitialized)
        ));
        // cleanup without initialize is fine
        service.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_initialize_and_cleanup() {
        let (control_addr, server) = fake_control_port().await;
        let service = TorService::new(TorConfig {
            control_addr,
            ..TorConfig::default()
        });

        service.initialize().await.unwrap();
        service.initialize().await.unwrap();
        assert!(service.onion_address().await.is_none());
        let address = service
            .create_hidden_endpoint(HIDDEN_SERVICE_PORT)
            .await
            .unwrap();
        assert_eq!(address, "abcdefexample.onion");
        assert_eq!(service.onion_address().await.as_deref(), Some(address.as_str()));

        service.cleanup().await.unwrap();
        assert!(service.onion_address().await.is_none());
        assert!(!service.is_initialized().await);

        let seen = server.await.unwrap();
        assert_eq!(
            seen.iter().filter(|l| l.starts_with("ADD_ONION")).count(),
            1
        );
        assert_eq!(seen.last().map(String::as_str), Some("DEL_ONION abcdefexample"));
    }
}
