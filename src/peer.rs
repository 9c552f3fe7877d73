//! Admitted peers and the per-peer driver task.
//!
//! A [`Peer`] is the shared handle the run loop keeps in its peer map;
//! the [`PeerDriver`] owns the transport and runs the session until the
//! peer disconnects, then reports back on the `delpeer` channel.

use crate::protocol::{Cap, DisconnectReason, Protocol};
use crate::server::conn::{Conn, ConnFlags};
use crate::transport::{Msg, Transport, TransportError, MSG_DISCONNECT, MSG_PING, MSG_PONG};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// An admitted peer connection.
///
/// Created exclusively by the run loop upon admission; the handle stays
/// valid after the peer disconnects but [`Peer::disconnect`] becomes a
/// no-op once the driver has exited.
pub struct Peer {
    id: crate::identity::NodeId,
    name: String,
    caps: Vec<Cap>,
    flags: ConnFlags,
    remote_addr: SocketAddr,
    disconnect_tx: mpsc::Sender<DisconnectReason>,
}

impl Peer {
    /// Build the peer handle and its driver from an admitted connection.
    ///
    /// `id` is the identity learned during the encryption handshake; the
    /// run loop has already verified it against the admission checks.
    pub(crate) fn new(
        id: crate::identity::NodeId,
        conn: Conn,
        protocols: Vec<Protocol>,
    ) -> (Arc<Peer>, PeerDriver) {
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let peer = Arc::new(Peer {
            id,
            name: conn.name.clone(),
            caps: conn.caps.clone(),
            flags: conn.flags,
            remote_addr: conn.remote_addr,
            disconnect_tx,
        });
        let driver = PeerDriver {
            peer: peer.clone(),
            transport: conn.transport,
            protocols,
            disconnect_rx,
            meter: conn.meter,
        };
        (peer, driver)
    }

    /// The peer's node id.
    pub fn id(&self) -> &crate::identity::NodeId {
        &self.id
    }

    /// The name the peer advertised in its hello.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capabilities the peer advertised in its hello.
    pub fn caps(&self) -> &[Cap] {
        &self.caps
    }

    /// Connection provenance and trust flags.
    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    /// Whether the peer is in the trusted set.
    pub fn is_trusted(&self) -> bool {
        self.flags.is(ConnFlags::TRUSTED)
    }

    /// Whether this connection was dialed as a static peer.
    pub fn is_static_dialed(&self) -> bool {
        self.flags.is(ConnFlags::STATIC_DIALED)
    }

    /// Whether this connection was accepted inbound.
    pub fn is_inbound(&self) -> bool {
        self.flags.is(ConnFlags::INBOUND)
    }

    /// Whether this connection came from the discovery table.
    pub fn is_dyn_dialed(&self) -> bool {
        self.flags.is(ConnFlags::DYN_DIALED)
    }

    /// Remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Ask the driver to end the session with the given reason.
    ///
    /// Non-blocking; repeated requests after the first are dropped.
    pub fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.disconnect_tx.try_send(reason);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) {}", self.id.short(), self.name, self.remote_addr)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// A peer driver's exit notification, consumed by the run loop.
pub(crate) struct PeerExit {
    pub peer: Arc<Peer>,
    pub reason: DisconnectReason,
}

/// How a session ended, deciding whether the reason still needs to be
/// written to the remote.
enum SessionEnd {
    /// Ended locally; tell the remote why.
    Local(DisconnectReason),
    /// The remote already knows (it disconnected, or the wire is dead).
    Silent(DisconnectReason),
}

/// Per-peer worker owning the transport.
pub(crate) struct PeerDriver {
    peer: Arc<Peer>,
    transport: Box<dyn Transport>,
    protocols: Vec<Protocol>,
    disconnect_rx: mpsc::Receiver<DisconnectReason>,
    meter: Option<crate::transport::MeterHandle>,
}

impl PeerDriver {
    /// Run the peer's protocol session until it ends.
    ///
    /// Exactly one session runs per peer: the best shared capability with
    /// a configured runner, or an idle keepalive loop when none matches.
    /// Returns the disconnect reason after closing the transport.
    pub(crate) async fn run(self) -> DisconnectReason {
        let PeerDriver {
            peer,
            mut transport,
            protocols,
            mut disconnect_rx,
            meter,
        } = self;

        let runner = select_runner(&protocols, peer.caps());
        if let Some((cap, _)) = &runner {
            debug!(peer = %peer, cap = %cap, "starting protocol session");
        }

        let end = {
            let session = async {
                match &runner {
                    Some((_, r)) => SessionEnd::Local(r.run(peer.clone(), transport.as_mut()).await),
                    None => idle_session(transport.as_mut()).await,
                }
            };
            tokio::select! {
                end = session => end,
                Some(reason) = disconnect_rx.recv() => SessionEnd::Local(reason),
            }
        };

        let reason = match end {
            SessionEnd::Local(reason) => {
                transport.close(Some(reason)).await;
                reason
            }
            SessionEnd::Silent(reason) => {
                transport.close(None).await;
                reason
            }
        };
        if let Some(meter) = &meter {
            debug!(
                peer = %peer,
                bytes_in = meter.bytes_read(),
                bytes_out = meter.bytes_written(),
                "peer connection closed"
            );
        }
        reason
    }
}

/// Choose the session to run: shared capabilities with a runner, best
/// name first, then highest version.
fn select_runner(
    protocols: &[Protocol],
    remote_caps: &[Cap],
) -> Option<(Cap, Arc<dyn crate::protocol::ProtocolRunner>)> {
    let mut matching: Vec<&Protocol> = protocols
        .iter()
        .filter(|p| p.runner.is_some())
        .filter(|p| {
            remote_caps
                .iter()
                .any(|c| c.name == p.name && c.version == p.version)
        })
        .collect();
    matching.sort_by(|a, b| a.name.cmp(&b.name).then(b.version.cmp(&a.version)));
    matching
        .first()
        .and_then(|p| p.runner.clone().map(|r| (p.cap(), r)))
}

/// Default session body: answer pings and wait for a disconnect.
///
/// Keepalive initiation belongs to protocol runners; without one the
/// connection expires once the frame read timeout elapses.
async fn idle_session(transport: &mut dyn Transport) -> SessionEnd {
    loop {
        let msg = match transport.read_msg().await {
            Ok(msg) => msg,
            Err(TransportError::RemoteDisconnected(reason)) => {
                return SessionEnd::Silent(reason);
            }
            Err(_) => return SessionEnd::Silent(DisconnectReason::NetworkError),
        };
        match msg.code {
            MSG_DISCONNECT => return SessionEnd::Silent(msg.disconnect_reason()),
            MSG_PING => {
                if transport.write_msg(Msg::new(MSG_PONG, vec![])).await.is_err() {
                    return SessionEnd::Silent(DisconnectReason::NetworkError);
                }
            }
            other => {
                trace!(code = other, "ignoring message outside a protocol session");
            }
        }
    }
}
