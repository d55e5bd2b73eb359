//! Post-quantum hybrid exchange: Kyber-1024 key encapsulation keying
//! XChaCha20-Poly1305.
//!
//! Hybrid ciphertext layout: `kem_ciphertext || nonce || aead_ciphertext`.
//! The KEM ciphertext is bound as associated data, so flipping a bit in
//! any part of the message fails authentication.

use pqcrypto_kyber::kyber1024;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use zeroize::Zeroizing;

use crate::constants::{KDF_CONTEXT_HYBRID_KEY, NONCE_SIZE};
use crate::crypto::{derive_subkey, generate_nonce, nonce_from_slice, open, seal};
use crate::error::QuantumError;

pub struct PqKeyPair {
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for PqKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PqKeyPair")
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

pub fn generate_keypair() -> PqKeyPair {
    let (pk, sk) = kyber1024::keypair();
    PqKeyPair {
        public_key: pk.as_bytes().to_vec(),
        secret_key: Zeroizing::new(sk.as_bytes().to_vec()),
    }
}

/// Returns `(shared_secret, kem_ciphertext)`.
pub fn encapsulate(public_key: &[u8]) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), QuantumError> {
    let pk = kyber1024::PublicKey::from_bytes(public_key).map_err(|_| QuantumError::InvalidKey)?;
    let (ss, ct) = kyber1024::encapsulate(&pk);
    Ok((Zeroizing::new(ss.as_bytes().to_vec()), ct.as_bytes().to_vec()))
}

pub fn decapsulate(
    ciphertext: &[u8],
    secret_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, QuantumError> {
    let ct = kyber1024::Ciphertext::from_bytes(ciphertext).map_err(|_| QuantumError::Truncated)?;
    let sk = kyber1024::SecretKey::from_bytes(secret_key).map_err(|_| QuantumError::InvalidKey)?;
    let ss = kyber1024::decapsulate(&ct, &sk);
    Ok(Zeroizing::new(ss.as_bytes().to_vec()))
}

pub fn hybrid_encrypt(data: &[u8], public_key: &[u8]) -> Result<Vec<u8>, QuantumError> {
    let (shared_secret, kem_ct) = encapsulate(public_key)?;
    let key = Zeroizing::new(derive_subkey(KDF_CONTEXT_HYBRID_KEY, &shared_secret));
    let nonce = generate_nonce();

    let sealed =
        seal(&key, &nonce, data, &kem_ct).map_err(|_| QuantumError::DecryptionFailed)?;

    let mut out = Vec::with_capacity(kem_ct.len() + NONCE_SIZE + sealed.len());
    out.extend_from_slice(&kem_ct);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn hybrid_decrypt(data: &[u8], secret_key: &[u8]) -> Result<Vec<u8>, QuantumError> {
    let kem_len = kyber1024::ciphertext_bytes();
    if data.len() < kem_len + NONCE_SIZE {
        return Err(QuantumError::Truncated);
    }

    let (kem_ct, rest) = data.split_at(kem_len);
    let (nonce, sealed) = rest.split_at(NONCE_SIZE);

    let shared_secret = decapsulate(kem_ct, secret_key)?;
    let key = Zeroizing::new(derive_subkey(KDF_CONTEXT_HYBRID_KEY, &shared_secret));
    let nonce = nonce_from_slice(nonce).map_err(|_| QuantumError::Truncated)?;

    open(&key, &nonce, sealed, kem_ct).map_err(|_| QuantumError::DecryptionFailed)
}
