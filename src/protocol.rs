//! Protocol handshake types: capabilities, the hello message exchanged
//! after the encryption handshake, and the disconnect reason codes the
//! transport serializes on close.

use crate::identity::NodeId;
use crate::peer::Peer;
use crate::transport::Transport;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Version of the base wire protocol spoken before any sub-protocol.
pub const BASE_PROTOCOL_VERSION: u32 = 1;

/// Errors decoding protocol handshake payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("handshake payload truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("handshake field is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown disconnect reason code: 0x{0:02x}")]
    UnknownDisconnectReason(u8),
}

/// A `(name, version)` pair advertised during the protocol handshake.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cap {
    pub name: String,
    pub version: u32,
}

impl Cap {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A sub-protocol declared on the server.
///
/// Matching protocols are launched for each admitted peer. The runner is
/// the opaque session body: it owns the peer's message stream until the
/// session ends and reports the disconnect reason.
#[derive(Clone)]
pub struct Protocol {
    /// Protocol name announced in the capability list.
    pub name: String,
    /// Protocol version announced in the capability list.
    pub version: u32,
    /// Session body executed for peers that share this capability.
    pub runner: Option<Arc<dyn ProtocolRunner>>,
}

impl Protocol {
    /// The capability advertised for this protocol.
    pub fn cap(&self) -> Cap {
        Cap::new(self.name.clone(), self.version)
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("has_runner", &self.runner.is_some())
            .finish()
    }
}

/// The session body run for an admitted peer.
///
/// Blocks until the peer's session ends and returns the reason. The
/// transport is exclusively owned for the duration of the call; the peer
/// driver closes it afterwards.
#[async_trait]
pub trait ProtocolRunner: Send + Sync {
    async fn run(&self, peer: Arc<Peer>, transport: &mut dyn Transport) -> DisconnectReason;
}

/// Count capabilities shared between our protocols and a remote's list.
///
/// A match requires both name and version to agree.
pub fn count_matching_protocols(ours: &[Protocol], theirs: &[Cap]) -> usize {
    ours.iter()
        .filter(|p| theirs.iter().any(|c| c.name == p.name && c.version == p.version))
        .count()
}

// ============================================================================
// Protocol Handshake (hello)
// ============================================================================

/// The hello message exchanged over the established channel.
///
/// Wire format (all integers big-endian):
/// ```text
/// [version:4][id:32][name_len:2][name][cap_count:2]
/// ( [cap_name_len:2][cap_name][cap_version:4] )*
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtoHandshake {
    pub version: u32,
    pub name: String,
    pub caps: Vec<Cap>,
    pub id: NodeId,
}

impl ProtoHandshake {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.name.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_be_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&(self.caps.len() as u16).to_be_bytes());
        for cap in &self.caps {
            out.extend_from_slice(&(cap.name.len() as u16).to_be_bytes());
            out.extend_from_slice(cap.name.as_bytes());
            out.extend_from_slice(&cap.version.to_be_bytes());
        }
        out
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let version = r.read_u32()?;
        let id = NodeId::from_bytes(r.read_array::<32>()?);
        let name = r.read_string()?;
        let cap_count = r.read_u16()? as usize;
        let mut caps = Vec::with_capacity(cap_count.min(64));
        for _ in 0..cap_count {
            let cap_name = r.read_string()?;
            let cap_version = r.read_u32()?;
            caps.push(Cap::new(cap_name, cap_version));
        }
        Ok(Self {
            version,
            name,
            caps,
            id,
        })
    }
}

/// Cursor over a handshake payload.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.data.len() - self.pos < n {
            return Err(ProtocolError::Truncated {
                need: n,
                have: self.data.len() - self.pos,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let b = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

// ============================================================================
// Disconnect Reason Codes
// ============================================================================

/// Reason serialized to the remote when a connection is closed.
///
/// The numeric codes are wire-visible and must not change: remote nodes
/// decode them to learn why they were dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Disconnect was requested by the remote operator.
    Requested = 0x00,
    /// Network-level error (read/write failure).
    NetworkError = 0x01,
    /// Breach of the base wire protocol.
    ProtocolError = 0x02,
    /// No useful shared capability.
    UselessPeer = 0x03,
    /// The peer cap is reached and the connection is neither trusted
    /// nor static.
    TooManyPeers = 0x04,
    /// A connection with the same node id is already admitted.
    AlreadyConnected = 0x05,
    /// Incompatible base protocol version.
    IncompatibleVersion = 0x06,
    /// The advertised identity is invalid.
    InvalidIdentity = 0x07,
    /// The local server is shutting down.
    Quitting = 0x08,
    /// The identity learned from the two handshakes disagrees, or a dialed
    /// node presented a different key than expected.
    UnexpectedIdentity = 0x09,
    /// The remote identity is our own.
    SelfConnect = 0x0a,
    /// Handshake or frame read took too long.
    ReadTimeout = 0x0b,
    /// A sub-protocol reported an unrecoverable error.
    SubprotocolError = 0x10,
}

impl DisconnectReason {
    /// Try to convert from a wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(DisconnectReason::Requested),
            0x01 => Some(DisconnectReason::NetworkError),
            0x02 => Some(DisconnectReason::ProtocolError),
            0x03 => Some(DisconnectReason::UselessPeer),
            0x04 => Some(DisconnectReason::TooManyPeers),
            0x05 => Some(DisconnectReason::AlreadyConnected),
            0x06 => Some(DisconnectReason::IncompatibleVersion),
            0x07 => Some(DisconnectReason::InvalidIdentity),
            0x08 => Some(DisconnectReason::Quitting),
            0x09 => Some(DisconnectReason::UnexpectedIdentity),
            0x0a => Some(DisconnectReason::SelfConnect),
            0x0b => Some(DisconnectReason::ReadTimeout),
            0x10 => Some(DisconnectReason::SubprotocolError),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::NetworkError => "network error",
            DisconnectReason::ProtocolError => "breach of protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::IncompatibleVersion => "incompatible protocol version",
            DisconnectReason::InvalidIdentity => "invalid identity",
            DisconnectReason::Quitting => "client quitting",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::SelfConnect => "connected to self",
            DisconnectReason::ReadTimeout => "read timeout",
            DisconnectReason::SubprotocolError => "subprotocol error",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn sample_handshake() -> ProtoHandshake {
        ProtoHandshake {
            version: BASE_PROTOCOL_VERSION,
            name: "wharf/v0.1.0".to_string(),
            caps: vec![Cap::new("ledger", 1), Cap::new("sync", 3)],
            id: *Identity::generate().node_id(),
        }
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = sample_handshake();
        let decoded = ProtoHandshake::decode(&hs.encode()).unwrap();
        assert_eq!(hs, decoded);
    }

    #[test]
    fn test_handshake_empty_caps() {
        let mut hs = sample_handshake();
        hs.caps.clear();
        let decoded = ProtoHandshake::decode(&hs.encode()).unwrap();
        assert!(decoded.caps.is_empty());
    }

    #[test]
    fn test_handshake_truncated() {
        let hs = sample_handshake();
        let bytes = hs.encode();
        for cut in [0, 3, 4, 35, bytes.len() - 1] {
            assert!(
                ProtoHandshake::decode(&bytes[..cut]).is_err(),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn test_disconnect_reason_codes_stable() {
        // Wire codes are fixed; remote nodes decode them.
        assert_eq!(DisconnectReason::TooManyPeers.to_byte(), 0x04);
        assert_eq!(DisconnectReason::AlreadyConnected.to_byte(), 0x05);
        assert_eq!(DisconnectReason::Quitting.to_byte(), 0x08);
        assert_eq!(DisconnectReason::UnexpectedIdentity.to_byte(), 0x09);
        assert_eq!(DisconnectReason::SelfConnect.to_byte(), 0x0a);
        assert_eq!(DisconnectReason::ReadTimeout.to_byte(), 0x0b);

        for b in 0u8..=0x10 {
            if let Some(reason) = DisconnectReason::from_byte(b) {
                assert_eq!(reason.to_byte(), b);
            }
        }
        assert!(DisconnectReason::from_byte(0xfe).is_none());
    }

    #[test]
    fn test_count_matching_protocols() {
        let ours = vec![
            Protocol {
                name: "ledger".into(),
                version: 1,
                runner: None,
            },
            Protocol {
                name: "sync".into(),
                version: 3,
                runner: None,
            },
        ];

        let theirs = vec![Cap::new("ledger", 1), Cap::new("sync", 2)];
        assert_eq!(count_matching_protocols(&ours, &theirs), 1);

        let disjoint = vec![Cap::new("xyz", 1)];
        assert_eq!(count_matching_protocols(&ours, &disjoint), 0);

        assert_eq!(count_matching_protocols(&[], &theirs), 0);
    }
}
