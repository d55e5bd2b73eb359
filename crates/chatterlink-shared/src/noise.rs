//! Noise XX session encryption used by the TCP transport.
//!
//! A Noise transport message is capped at 65535 bytes, so application frames
//! are split into fragments, each encrypted separately and prefixed with its
//! own big-endian `u16` length.

use snow::{Builder, HandshakeState, TransportState};

use crate::error::NoiseError;

const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest Noise message on the wire.
pub const MAX_NOISE_MESSAGE: usize = 65_535;

const TAG_LEN: usize = 16;
const MAX_FRAGMENT_PLAINTEXT: usize = MAX_NOISE_MESSAGE - TAG_LEN;

pub fn generate_static_key() -> [u8; 32] {
    x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng).to_bytes()
}

fn builder<'a>() -> Result<Builder<'a>, NoiseError> {
    Ok(Builder::new(
        NOISE_PATTERN
            .parse()
            .map_err(|e| NoiseError::Handshake(format!("{e}")))?,
    ))
}

pub fn build_initiator(local_private_key: &[u8; 32]) -> Result<HandshakeState, NoiseError> {
    builder()?
        .local_private_key(local_private_key)
        .build_initiator()
        .map_err(|e| NoiseError::Handshake(format!("{e}")))
}

pub fn build_responder(local_private_key: &[u8; 32]) -> Result<HandshakeState, NoiseError> {
    builder()?
        .local_private_key(local_private_key)
        .build_responder()
        .map_err(|e| NoiseError::Handshake(format!("{e}")))
}

pub fn write_handshake(state: &mut HandshakeState) -> Result<Vec<u8>, NoiseError> {
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    let len = state
        .write_message(&[], &mut buf)
        .map_err(|e| NoiseError::Handshake(format!("{e}")))?;
    buf.truncate(len);
    Ok(buf)
}

pub fn read_handshake(state: &mut HandshakeState, message: &[u8]) -> Result<(), NoiseError> {
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    state
        .read_message(message, &mut buf)
        .map_err(|e| NoiseError::Handshake(format!("{e}")))?;
    Ok(())
}

pub fn into_transport(state: HandshakeState) -> Result<TransportState, NoiseError> {
    state
        .into_transport_mode()
        .map_err(|e| NoiseError::Transport(format!("{e}")))
}

/// Encrypt an application frame into one or more length-prefixed fragments.
pub fn seal_frame(transport: &mut TransportState, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let mut out = Vec::with_capacity(plaintext.len() + TAG_LEN * 2 + 4);
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];

    // an empty frame still produces one fragment
    let fragments: Vec<&[u8]> = if plaintext.is_empty() {
        vec![plaintext]
    } else {
        plaintext.chunks(MAX_FRAGMENT_PLAINTEXT).collect()
    };

    for fragment in fragments {
        let len = transport
            .write_message(fragment, &mut buf)
            .map_err(|e| NoiseError::Transport(format!("{e}")))?;
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&buf[..len]);
    }
    Ok(out)
}

/// Reverse of [`seal_frame`].
pub fn open_frame(transport: &mut TransportState, sealed: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let mut out = Vec::with_capacity(sealed.len());
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    let mut rest = sealed;

    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(NoiseError::Transport("truncated fragment header".into()));
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if rest.len() < 2 + len {
            return Err(NoiseError::Transport("truncated fragment".into()));
        }
        let n = transport
            .read_message(&rest[2..2 + len], &mut buf)
            .map_err(|e| NoiseError::Transport(format!("{e}")))?;
        out.extend_from_slice(&buf[..n]);
        rest = &rest[2 + len..];
    }
    Ok(out)
}
