//! Threshold secret sharing (Shamir over GF(256)).
//!
//! Every byte of the secret gets its own random polynomial of degree
//! `threshold - 1`; share `x` holds the evaluations at `x` (1..=total).
//! Reconstruction is Lagrange interpolation at zero. Shares carry no MAC
//! or hash of the secret, so fewer than `threshold` of them reveal nothing.

use std::collections::{BTreeMap, HashSet};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::SharingError;
use crate::types::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyShare {
    /// Random tag shared by all shares of one split.
    pub split_id: [u8; 16],
    pub threshold: u8,
    pub total: u8,
    /// Evaluation point, never zero.
    pub index: u8,
    pub data: Vec<u8>,
}

impl KeyShare {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SharingError> {
        bincode::serialize(self).map_err(|e| SharingError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SharingError> {
        bincode::deserialize(bytes).map_err(|e| SharingError::Malformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// GF(256) arithmetic, reduction polynomial x^8 + x^4 + x^3 + x + 1
// ---------------------------------------------------------------------------

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    product
}

// a^254 == a^-1 for a != 0
fn gf_inv(a: u8) -> u8 {
    let mut result = 1u8;
    let mut base = a;
    let mut exp = 254u8;
    while exp != 0 {
        if exp & 1 != 0 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

fn eval_poly(coefficients: &[u8], x: u8) -> u8 {
    // Horner, highest degree first
    coefficients
        .iter()
        .rev()
        .fold(0u8, |acc, &c| gf_mul(acc, x) ^ c)
}

/// Split `secret` into `total` shares, any `threshold` of which recombine it.
pub fn split_secret(secret: &[u8], threshold: u8, total: u8) -> Result<Vec<KeyShare>, SharingError> {
    if threshold == 0 || total == 0 || threshold > total {
        return Err(SharingError::InvalidParameters { threshold, total });
    }

    let mut split_id = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut split_id);

    let mut shares: Vec<KeyShare> = (1..=total)
        .map(|index| KeyShare {
            split_id,
            threshold,
            total,
            index,
            data: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coefficients = Zeroizing::new(vec![0u8; threshold as usize]);
    for &byte in secret {
        coefficients[0] = byte;
        rand::rngs::OsRng.fill_bytes(&mut coefficients[1..]);
        for share in shares.iter_mut() {
            share.data.push(eval_poly(&coefficients, share.index));
        }
    }

    Ok(shares)
}

/// Recombine shares produced by one [`split_secret`] call.
pub fn combine_shares(shares: &[KeyShare]) -> Result<Zeroizing<Vec<u8>>, SharingError> {
    let first = shares.first().ok_or(SharingError::InsufficientShares { got: 0, need: 1 })?;

    let mut seen = HashSet::new();
    for share in shares {
        if share.split_id != first.split_id
            || share.threshold != first.threshold
            || share.total != first.total
            || share.data.len() != first.data.len()
        {
            return Err(SharingError::InconsistentShares);
        }
        if share.index == 0 || share.index > share.total {
            return Err(SharingError::Malformed(format!("index {}", share.index)));
        }
        if !seen.insert(share.index) {
            return Err(SharingError::DuplicateShare(share.index));
        }
    }

    let need = first.threshold as usize;
    if shares.len() < need {
        return Err(SharingError::InsufficientShares {
            got: shares.len(),
            need,
        });
    }

    let used = &shares[..need];

    // Lagrange basis at x = 0: l_i = prod_{j != i} x_j / (x_j - x_i)
    // (subtraction is xor in GF(2^8))
    let basis: Vec<u8> = used
        .iter()
        .map(|si| {
            used.iter()
                .filter(|sj| sj.index != si.index)
                .fold(1u8, |acc, sj| {
                    gf_mul(acc, gf_mul(sj.index, gf_inv(sj.index ^ si.index)))
                })
        })
        .collect();

    let mut secret = Zeroizing::new(vec![0u8; first.data.len()]);
    for (pos, out) in secret.iter_mut().enumerate() {
        *out = used
            .iter()
            .zip(&basis)
            .fold(0u8, |acc, (share, &l)| acc ^ gf_mul(share.data[pos], l));
    }
    Ok(secret)
}

/// Owns the split/combine lifecycle for the engine's strictest level.
#[derive(Debug, Default)]
pub struct SecretSharingService {
    initialized: bool,
}

impl SecretSharingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self) {
        self.initialized = true;
        debug!("Secret sharing service initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn split_secret_key(
        &self,
        key: &[u8],
        threshold: u8,
        total: u8,
    ) -> Result<Vec<KeyShare>, SharingError> {
        self.ensure_ready()?;
        split_secret(key, threshold, total)
    }

    pub fn combine_secret_shares(
        &self,
        shares: &[KeyShare],
    ) -> Result<Zeroizing<Vec<u8>>, SharingError> {
        self.ensure_ready()?;
        combine_shares(shares)
    }

    /// Pair shares with participants, one share each, in order. Shares
    /// beyond the participant count stay unassigned. Delivering them is
    /// left to the caller.
    pub fn distribute_shares(
        &self,
        shares: &[KeyShare],
        participants: &[PeerId],
    ) -> Result<BTreeMap<PeerId, KeyShare>, SharingError> {
        self.ensure_ready()?;
        Ok(participants
            .iter()
            .cloned()
            .zip(shares.iter().cloned())
            .collect())
    }

    pub fn cleanup(&mut self) {
        if self.initialized {
            debug!("Secret sharing service torn down");
        }
        self.initialized = false;
    }

    fn ensure_ready(&self) -> Result<(), SharingError> {
        if self.initialized {
            Ok(())
        } else {
            Err(SharingError::NotInitialized)
        }
    }
}
