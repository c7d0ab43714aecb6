//! Node identity: IDs are derived from Ed25519 public keys and never
//! assigned independently.

use ed25519_dalek::{PUBLIC_KEY_LENGTH, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{ConsensusError, ConsensusResult};

/// Prefix shared by every node ID.
pub const NODE_ID_PREFIX: &str = "node-";

/// Derive the canonical node ID for a public key.
pub fn node_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    format!("{NODE_ID_PREFIX}{}", hex::encode(&digest[..16]))
}

/// Validate raw public key bytes as an Ed25519 verifying key.
pub fn parse_public_key(bytes: &[u8]) -> ConsensusResult<VerifyingKey> {
    let raw: &[u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
        ConsensusError::InvalidPublicKey(format!(
            "expected {PUBLIC_KEY_LENGTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(raw).map_err(|e| ConsensusError::InvalidPublicKey(e.to_string()))
}
