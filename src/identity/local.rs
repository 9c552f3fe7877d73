//! Local node identity with signing capability.

use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use std::fmt;

use super::{IdentityError, NodeId};

/// A local node identity consisting of a keypair and the derived node id.
///
/// The identity holds the secp256k1 keypair and signs the challenge
/// digests exchanged during the transport identity handshake.
#[derive(Clone)]
pub struct Identity {
    keypair: Keypair,
    node_id: NodeId,
}

impl Identity {
    /// Create a new random identity.
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut secret_bytes);
        let secret_key = SecretKey::from_slice(&secret_bytes)
            .expect("32 random bytes is a valid secret key");
        Self::from_secret_key(secret_key)
    }

    /// Create an identity from an existing keypair.
    pub fn from_keypair(keypair: Keypair) -> Self {
        let (pubkey, _parity) = keypair.x_only_public_key();
        let node_id = NodeId::from_pubkey(&pubkey);
        Self { keypair, node_id }
    }

    /// Create an identity from a secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        Self::from_keypair(keypair)
    }

    /// Create an identity from secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let secret_key = SecretKey::from_slice(bytes)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Create an identity from a hex-encoded secret key.
    pub fn from_secret_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim())?;
        let secret_key = SecretKey::from_slice(&bytes)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Return the secret key as lowercase hex.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_key().secret_bytes())
    }

    /// Return the x-only public key.
    pub fn pubkey(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    /// Return the node id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Sign a 32-byte digest with this identity's secret key.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> secp256k1::schnorr::Signature {
        let secp = Secp256k1::new();
        secp.sign_schnorr(digest, &self.keypair)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
