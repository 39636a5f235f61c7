//! Witness keys and recoverable signatures
//!
//! Witnesses sign 32-byte keccak prehashes with secp256k1. Signatures are the
//! 65-byte `r || s || v` form so the signer identity can be recovered without
//! shipping the public key alongside every message.

use alloy_primitives::{Address, B256, FixedBytes};
use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use std::fmt;
use thiserror::Error;

use crate::WitnessId;

/// Recoverable ECDSA signature (r, s, v concatenated)
pub type WitnessSignature = FixedBytes<65>;

/// Witness key errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Secret key bytes are not a valid scalar
    #[error("invalid witness secret key")]
    InvalidSecret,

    /// Signing failed
    #[error("signing failed")]
    Signing,

    /// Signature bytes could not be parsed
    #[error("malformed signature")]
    MalformedSignature,

    /// Public key recovery failed
    #[error("signer recovery failed")]
    Recovery,
}

/// A witness signing key
#[derive(Clone)]
pub struct WitnessKey {
    signing: SigningKey,
    id: WitnessId,
}

impl fmt::Debug for WitnessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WitnessKey").field("id", &self.id).finish_non_exhaustive()
    }
}

impl WitnessKey {
    /// Load a key from 32 secret bytes
    pub fn from_bytes(secret: &[u8]) -> Result<Self, KeyError> {
        let signing = SigningKey::from_slice(secret).map_err(|_| KeyError::InvalidSecret)?;
        Ok(Self::from_signing_key(signing))
    }

    /// Wrap an existing signing key
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let id = id_from_verifying_key(signing.verifying_key());
        Self { signing, id }
    }

    /// The witness identity of this key
    pub const fn id(&self) -> WitnessId {
        self.id
    }

    /// Sign a 32-byte prehash
    pub fn sign(&self, prehash: &B256) -> Result<WitnessSignature, KeyError> {
        let (signature, recovery_id) = self
            .signing
            .sign_prehash_recoverable(prehash.as_slice())
            .map_err(|_| KeyError::Signing)?;

        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = recovery_id.to_byte();
        Ok(FixedBytes(bytes))
    }
}

/// Recover the witness that produced `signature` over `prehash`
pub fn recover_signer(prehash: &B256, signature: &WitnessSignature) -> Result<WitnessId, KeyError> {
    let parsed =
        Signature::from_slice(&signature[..64]).map_err(|_| KeyError::MalformedSignature)?;
    let recovery_id = RecoveryId::from_byte(signature[64]).ok_or(KeyError::MalformedSignature)?;
    let key = VerifyingKey::recover_from_prehash(prehash.as_slice(), &parsed, recovery_id)
        .map_err(|_| KeyError::Recovery)?;

    Ok(id_from_verifying_key(&key))
}

fn id_from_verifying_key(key: &VerifyingKey) -> WitnessId {
    let point = key.as_affine().to_encoded_point(false);
    // skip the 0x04 SEC1 tag
    Address::from_raw_public_key(&point.as_bytes()[1..])
}
