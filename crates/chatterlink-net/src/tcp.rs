//! Noise-secured TCP transport.
//!
//! Framing: every frame is a little-endian `u32` length followed by the
//! payload. The three Noise XX handshake messages travel as plain frames;
//! afterwards each frame holds one sealed application message. The dialer's
//! first sealed frame is a [`Hello`] naming the address it listens on, which
//! becomes its peer id on the accepting side.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snow::TransportState;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chatterlink_shared::constants::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use chatterlink_shared::noise;
use chatterlink_shared::PeerId;

use crate::error::{NetError, Result};
use crate::tor::AnonymizingTransport;
use crate::transport::{Endpoint, Link, Transport, LINK_BUFFER};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    version: String,
    peer: PeerId,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge(data.len()));
    }
    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge(len));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

async fn handshake_initiator(
    stream: &mut TcpStream,
    static_key: &[u8; 32],
) -> Result<TransportState> {
    let mut hs = noise::build_initiator(static_key)?;
    write_frame(stream, &noise::write_handshake(&mut hs)?).await?;
    noise::read_handshake(&mut hs, &read_frame(stream).await?)?;
    write_frame(stream, &noise::write_handshake(&mut hs)?).await?;
    Ok(noise::into_transport(hs)?)
}

async fn handshake_responder(
    stream: &mut TcpStream,
    static_key: &[u8; 32],
) -> Result<TransportState> {
    let mut hs = noise::build_responder(static_key)?;
    noise::read_handshake(&mut hs, &read_frame(stream).await?)?;
    write_frame(stream, &noise::write_handshake(&mut hs)?).await?;
    noise::read_handshake(&mut hs, &read_frame(stream).await?)?;
    Ok(noise::into_transport(hs)?)
}

/// Move an established session onto a reader task and a writer task that
/// pump between the socket and the link channels.
fn spawn_pumps(stream: TcpStream, state: TransportState, peer: PeerId) -> Link {
    let (mut reader, mut writer) = stream.into_split();
    let state = Arc::new(Mutex::new(state));
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(LINK_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(LINK_BUFFER);

    let write_state = Arc::clone(&state);
    let write_peer = peer.clone();
    let read_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let sealed = {
                let mut noise_state = write_state.lock().unwrap_or_else(|e| e.into_inner());
                noise::seal_frame(&mut noise_state, &frame)
            };
            let sealed = match sealed {
                Ok(s) => s,
                Err(e) => {
                    warn!(peer = %write_peer, error = %e, "Failed to seal frame");
                    break;
                }
            };
            if let Err(e) = write_frame(&mut writer, &sealed).await {
                debug!(peer = %write_peer, error = %e, "Write failed, closing link");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let sealed = match read_frame(&mut reader).await {
                Ok(f) => f,
                Err(e) => {
                    debug!(peer = %read_peer, error = %e, "Read ended");
                    break;
                }
            };
            let opened = {
                let mut noise_state = state.lock().unwrap_or_else(|e| e.into_inner());
                noise::open_frame(&mut noise_state, &sealed)
            };
            match opened {
                Ok(plain) => {
                    if in_tx.send(plain).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(peer = %read_peer, error = %e, "Dropping link after bad frame");
                    break;
                }
            }
        }
    });

    Link {
        peer,
        tx: out_tx,
        rx: in_rx,
    }
}

async fn seal_one(state: &mut TransportState, stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    let sealed = noise::seal_frame(state, data)?;
    write_frame(stream, &sealed).await
}

async fn open_one(state: &mut TransportState, stream: &mut TcpStream) -> Result<Vec<u8>> {
    let sealed = read_frame(stream).await?;
    Ok(noise::open_frame(state, &sealed)?)
}

/// TCP transport with a per-process Noise static key.
pub struct TcpTransport {
    listen_addr: String,
    advertised: Option<PeerId>,
    static_key: [u8; 32],
    anonymizer: Option<Arc<dyn AnonymizingTransport>>,
}

impl TcpTransport {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            advertised: None,
            static_key: noise::generate_static_key(),
            anonymizer: None,
        }
    }

    /// Address other peers should dial to reach this node (defaults to the
    /// bound socket address).
    pub fn with_advertised_id(mut self, id: PeerId) -> Self {
        self.advertised = Some(id);
        self
    }

    /// Route every outbound dial through an anonymizing overlay.
    pub fn with_anonymizer(mut self, anonymizer: Arc<dyn AnonymizingTransport>) -> Self {
        self.anonymizer = Some(anonymizer);
        self
    }

    async fn accept_one(mut stream: TcpStream, static_key: [u8; 32]) -> Result<Link> {
        let mut state = handshake_responder(&mut stream, &static_key).await?;
        let hello: Hello = serde_json::from_slice(&open_one(&mut state, &mut stream).await?)
            .map_err(|e| NetError::Protocol(e.into()))?;
        if hello.version != PROTOCOL_VERSION {
            warn!(peer = %hello.peer, version = %hello.version, "Peer speaks a different protocol version");
        }
        Ok(spawn_pumps(stream, state, hello.peer))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self) -> Result<Endpoint> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local_id = match &self.advertised {
            Some(id) => id.clone(),
            None => PeerId::new(listener.local_addr()?.to_string()),
        };
        info!(local = %local_id, "TCP endpoint listening");

        let (incoming_tx, incoming_rx) = mpsc::channel(LINK_BUFFER);
        let static_key = self.static_key;
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let incoming_tx = incoming_tx.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(
                        HANDSHAKE_TIMEOUT,
                        TcpTransport::accept_one(stream, static_key),
                    )
                    .await
                    {
                        Ok(Ok(link)) => {
                            debug!(addr = %addr, peer = %link.peer, "Accepted session");
                            let _ = incoming_tx.send(link).await;
                        }
                        Ok(Err(e)) => debug!(addr = %addr, error = %e, "Inbound handshake failed"),
                        Err(_) => debug!(addr = %addr, "Inbound handshake timed out"),
                    }
                });
            }
        });

        Ok(Endpoint::new(local_id, incoming_rx, move || accept_task.abort()))
    }

    async fn dial(&self, local: &PeerId, peer: &PeerId) -> Result<Link> {
        let mut stream = match &self.anonymizer {
            Some(anonymizer) => anonymizer.connect(peer.as_str()).await?,
            None => TcpStream::connect(peer.as_str())
                .await
                .map_err(|e| NetError::connection(peer, e.to_string()))?,
        };

        let mut state = handshake_initiator(&mut stream, &self.static_key).await?;
        let hello = serde_json::to_vec(&Hello {
            version: PROTOCOL_VERSION.to_string(),
            peer: local.clone(),
        })
        .map_err(|e| NetError::Protocol(e.into()))?;
        seal_one(&mut state, &mut stream, &hello).await?;

        debug!(peer = %peer, "Outbound session established");
        Ok(spawn_pumps(stream, state, peer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_session_exchange() {
        let server = TcpTransport::new("127.0.0.1:0");
        let mut endpoint = server.bind().await.unwrap();
        let server_id = endpoint.local_id.clone();

        let client = TcpTransport::new("127.0.0.1:0");
        let client_id = PeerId::from("127.0.0.1:9");
        let mut link = client.dial(&client_id, &server_id).await.unwrap();

        let mut accepted = endpoint.incoming.recv().await.unwrap();
        assert_eq!(accepted.peer, client_id);

        let big: Vec<u8> = (0..150_000u32).map(|n| n as u8).collect();
        link.tx.send(b"hello".to_vec()).await.unwrap();
        link.tx.send(big.clone()).await.unwrap();
        assert_eq!(accepted.rx.recv().await.unwrap(), b"hello");
        assert_eq!(accepted.rx.recv().await.unwrap(), big);

        accepted.tx.send(b"back".to_vec()).await.unwrap();
        assert_eq!(link.rx.recv().await.unwrap(), b"back");
    }

    #[tokio::test]
    async fn test_closed_link_ends_stream() {
        let server = TcpTransport::new("127.0.0.1:0");
        let mut endpoint = server.bind().await.unwrap();
        let server_id = endpoint.local_id.clone();

        let client = TcpTransport::new("127.0.0.1:0");
        let link = client
            .dial(&PeerId::from("client"), &server_id)
            .await
            .unwrap();
        let mut accepted = endpoint.incoming.recv().await.unwrap();

        drop(link);
        assert!(accepted.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let client = TcpTransport::new("127.0.0.1:0");
        // port 1 on loopback is essentially never listening
        let err = client
            .dial(&PeerId::from("me"), &PeerId::from("127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_frame_limit() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        });
        assert!(matches!(
            read_frame(&mut b).await,
            Err(NetError::FrameTooLarge(_))
        ));
    }
}
