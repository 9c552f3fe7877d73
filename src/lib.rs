//! Wharf: peer-to-peer connection server for blockchain nodes.
//!
//! A long-running process that discovers, dials, accepts, authenticates
//! and drives protocol sessions with remote peers over TCP, while
//! enforcing admission policy, identity verification and graceful
//! shutdown. Node discovery, NAT mapping and the wire codec are consumed
//! as capabilities; defaults suitable for small deployments are built in.

pub mod config;
pub mod dial;
pub mod discovery;
pub mod identity;
pub mod nat;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export identity types
pub use identity::{Identity, IdentityError, NodeId};

// Re-export config types
pub use config::{Config, ConfigError};

// Re-export discovery types
pub use discovery::{DiscoveryTable, NodeRecord, NodeRecordError, StaticTable};

// Re-export protocol types
pub use protocol::{
    count_matching_protocols, Cap, DisconnectReason, ProtoHandshake, Protocol, ProtocolError,
    ProtocolRunner, BASE_PROTOCOL_VERSION,
};

// Re-export transport types
pub use transport::{
    FramedTransport, MeterHandle, MeteredStream, Msg, SocketStream, Transport, TransportError,
    FRAME_READ_TIMEOUT, FRAME_WRITE_TIMEOUT,
};

// Re-export server types
pub use server::{
    ConnFlags, Server, ServerConfig, ServerError, DIAL_HISTORY_EXPIRATION, MAX_ACCEPT_CONNS,
    MAX_ACTIVE_DIAL_TASKS, REFRESH_PEERS_INTERVAL, STATIC_PEER_CHECK_INTERVAL,
};

// Re-export dial types
pub use dial::{Dialer, TcpDialer, DEFAULT_DIAL_TIMEOUT};

// Re-export peer types
pub use peer::Peer;

// Re-export NAT types
pub use nat::{NatError, NatInterface};
