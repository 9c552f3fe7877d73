//! Transport capability: the two handshakes plus framed message I/O.
//!
//! The server is generic over the wire: anything implementing
//! [`Transport`] can carry a peer connection. The default is the framed
//! TCP transport in [`framed`], substituted through the server's
//! `new_transport` hook (tests install canned transports the same way).

mod framed;
mod metered;

use crate::identity::{Identity, NodeId};
use crate::protocol::{DisconnectReason, ProtoHandshake, ProtocolError};
use crate::discovery::NodeRecord;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use framed::FramedTransport;
pub use metered::{MeterHandle, MeteredStream};

/// Maximum time allowed for reading a complete message.
/// This is effectively the amount of time a connection can be idle.
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum amount of time allowed for writing a complete message.
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// Grace period for flushing the disconnect frame during close.
pub const DISCONNECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Hard cap on a single frame, header excluded.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Base message codes. Application protocols use codes at or above
// `MSG_USER_BASE`; everything below belongs to the connection layer.
pub const MSG_HELLO: u8 = 0x00;
pub const MSG_DISCONNECT: u8 = 0x01;
pub const MSG_PING: u8 = 0x02;
pub const MSG_PONG: u8 = 0x03;
pub const MSG_USER_BASE: u8 = 0x10;

/// Byte stream a transport can be built over.
///
/// Satisfied by `TcpStream`, the metered accept-loop shim, and the
/// in-memory duplex pipes used in tests.
pub trait SocketStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SocketStream for T {}

/// Errors produced by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("read timed out")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("handshake signature verification failed")]
    SignatureVerificationFailed,

    #[error("unexpected message: expected code 0x{expected:02x}, got 0x{got:02x}")]
    UnexpectedMessage { expected: u8, got: u8 },

    #[error("remote disconnected: {0}")]
    RemoteDisconnected(DisconnectReason),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A single framed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Msg {
    pub fn new(code: u8, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// A disconnect message carrying the reason byte.
    pub fn disconnect(reason: DisconnectReason) -> Self {
        Self::new(MSG_DISCONNECT, vec![reason.to_byte()])
    }

    /// Decode the reason from a disconnect message payload.
    ///
    /// An empty or unknown payload maps to [`DisconnectReason::Requested`],
    /// matching how lenient peers treat bare disconnects.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        self.payload
            .first()
            .and_then(|b| DisconnectReason::from_byte(*b))
            .unwrap_or(DisconnectReason::Requested)
    }
}

/// A peer connection's wire interface.
///
/// The handshake methods gate the connection lifecycle: `do_enc_handshake`
/// establishes the channel and learns the remote [`NodeId`];
/// `do_proto_handshake` exchanges capability lists over it. Message I/O is
/// only valid after the encryption handshake completed.
#[async_trait]
pub trait Transport: Send {
    /// Run the encryption/identity handshake.
    ///
    /// `dial_dest` is set for dialed connections and selects the
    /// initiator role; inbound connections respond.
    async fn do_enc_handshake(
        &mut self,
        identity: &Identity,
        dial_dest: Option<&NodeRecord>,
    ) -> Result<NodeId, TransportError>;

    /// Exchange hello messages and return the remote's.
    async fn do_proto_handshake(
        &mut self,
        our: &ProtoHandshake,
    ) -> Result<ProtoHandshake, TransportError>;

    /// Read one message, bounded by [`FRAME_READ_TIMEOUT`].
    async fn read_msg(&mut self) -> Result<Msg, TransportError>;

    /// Write one message, bounded by [`FRAME_WRITE_TIMEOUT`].
    async fn write_msg(&mut self, msg: Msg) -> Result<(), TransportError>;

    /// Close the connection, telling the remote why when a reason is
    /// given and the handshake state permits.
    async fn close(&mut self, reason: Option<DisconnectReason>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_msg_roundtrip() {
        let msg = Msg::disconnect(DisconnectReason::TooManyPeers);
        assert_eq!(msg.code, MSG_DISCONNECT);
        assert_eq!(msg.disconnect_reason(), DisconnectReason::TooManyPeers);
    }

    #[test]
    fn test_disconnect_msg_lenient_decode() {
        let empty = Msg::new(MSG_DISCONNECT, vec![]);
        assert_eq!(empty.disconnect_reason(), DisconnectReason::Requested);

        let unknown = Msg::new(MSG_DISCONNECT, vec![0xfe]);
        assert_eq!(unknown.disconnect_reason(), DisconnectReason::Requested);
    }
}
