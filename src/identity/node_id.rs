//! 32-byte node identifier derived from SHA-256(pubkey).

use secp256k1::XOnlyPublicKey;
use std::fmt;
use std::str::FromStr;

use super::{sha256, IdentityError};

/// 32-byte node identifier derived from SHA-256(pubkey).
///
/// Hashing the public key prevents grinding attacks that exploit
/// secp256k1's algebraic structure. Equality of node ids defines peer
/// identity: the server never admits two connections with the same id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Create a NodeId from a 32-byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a NodeId from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        if slice.len() != 32 {
            return Err(IdentityError::InvalidNodeIdLength(slice.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Derive a NodeId from an x-only public key.
    pub fn from_pubkey(pubkey: &XOnlyPublicKey) -> Self {
        Self(sha256(&pubkey.serialize()))
    }

    /// Generate a random NodeId.
    ///
    /// Used as a lookup target when asking the discovery table to walk
    /// towards a uniformly random point of the id space.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form (first 8 bytes) used in log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}
