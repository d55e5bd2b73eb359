use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::IdentityError;

/// Ed25519 signing identity for one engine session.
///
/// Regenerated on every initialization; the hex public key doubles as the
/// uploader id on file shares.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn sign_bytes(&self, message: &[u8]) -> Vec<u8> {
        self.sign(message).to_bytes().to_vec()
    }
}

/// Strict check: tells a bad key apart from a bad signature.
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    VerifyingKey::from_bytes(pubkey_bytes)
        .map_err(|_| IdentityError::InvalidKeyBytes)?
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

/// Lenient check over raw bytes. Any malformed input yields `false`.
pub fn verify(pubkey: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let (Ok(pubkey), Ok(signature)) = (
        <[u8; 32]>::try_from(pubkey),
        Signature::from_slice(signature),
    ) else {
        return false;
    };
    verify_signature(&pubkey, message, &signature).is_ok()
}

/// Same as [`verify`], with the public key in hex form.
pub fn verify_hex(pubkey_hex: &str, message: &[u8], signature: &[u8]) -> bool {
    hex::decode(pubkey_hex).is_ok_and(|pubkey| verify(&pubkey, message, signature))
}
