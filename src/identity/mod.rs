//! Node identity system.
//!
//! Every node is identified by a [`NodeId`] derived from its secp256k1
//! public key via SHA-256. The local [`Identity`] holds the keypair and
//! signs transport handshake challenges; remote peers are known only by
//! their `NodeId`.

mod local;
mod node_id;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use local::Identity;
pub use node_id::NodeId;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(#[from] secp256k1::Error),

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("invalid node id length: expected 32, got {0}")]
    InvalidNodeIdLength(usize),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Compute SHA-256 hash of data.
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_derivation_is_stable() {
        let identity = Identity::generate();
        let id_again = NodeId::from_pubkey(&identity.pubkey());
        assert_eq!(*identity.node_id(), id_again);
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.node_id(), b.node_id());
    }

    #[test]
    fn test_identity_roundtrip_through_hex() {
        let identity = Identity::generate();
        let hex_secret = identity.secret_hex();
        let restored = Identity::from_secret_hex(&hex_secret).unwrap();
        assert_eq!(identity.node_id(), restored.node_id());
    }

    #[test]
    fn test_sign_and_verify_digest() {
        let identity = Identity::generate();
        let digest = sha256(b"handshake challenge");
        let sig = identity.sign_digest(&digest);

        let secp = secp256k1::Secp256k1::new();
        assert!(secp.verify_schnorr(&sig, &digest, &identity.pubkey()).is_ok());

        // A different digest must not verify.
        let other = sha256(b"something else");
        assert!(secp.verify_schnorr(&sig, &other, &identity.pubkey()).is_err());
    }

    #[test]
    fn test_node_id_from_slice_length_check() {
        assert!(matches!(
            NodeId::from_slice(&[0u8; 31]),
            Err(IdentityError::InvalidNodeIdLength(31))
        ));
        assert!(NodeId::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_node_id_hex_parse() {
        let identity = Identity::generate();
        let id = *identity.node_id();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        assert!("zz".parse::<NodeId>().is_err());
        assert!("abcd".parse::<NodeId>().is_err());
    }

}
