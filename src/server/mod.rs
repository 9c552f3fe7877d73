//! The peer-to-peer connection server.
//!
//! [`Server`] owns the listener, the dial workers and the run loop, and
//! maintains a bounded population of authenticated peer connections. All
//! peer-set state lives in the run loop; the facade only holds
//! configuration, the lifecycle flags and the channels used to reach it.

pub(crate) mod conn;
mod listener;
mod run_loop;
pub(crate) mod setup;

use crate::dial::{DialState, Dialer, Task, TaskContext, TcpDialer};
use crate::discovery::{DiscoveryTable, NodeRecord};
use crate::identity::{Identity, NodeId};
use crate::nat::{self, NatInterface};
use crate::peer::{Peer, PeerExit};
use crate::protocol::{Protocol, ProtoHandshake, BASE_PROTOCOL_VERSION};
use crate::transport::{FramedTransport, SocketStream, Transport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

pub use conn::ConnFlags;
pub(crate) use run_loop::{RunLoop, RunLoopChannels};

/// Interval between dial-plan refreshes driven by the discovery table.
pub const REFRESH_PEERS_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum interval between checks of the static node list.
pub const STATIC_PEER_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Maximum number of concurrently handshaking inbound connections.
pub const MAX_ACCEPT_CONNS: usize = 50;

/// Maximum number of concurrently dialing outbound connections.
pub const MAX_ACTIVE_DIAL_TASKS: usize = 16;

/// Cooldown between successive dial attempts to the same node.
pub const DIAL_HISTORY_EXPIRATION: Duration = Duration::from_secs(30);

/// Upper bound on a connection's whole setup pipeline.
pub const HANDSHAKE_TIMEOUT: Duration =
    Duration::from_secs(9 * DIAL_HISTORY_EXPIRATION.as_secs());

/// Factory turning an accepted or dialed socket into a transport.
pub type TransportFactory =
    Arc<dyn Fn(Box<dyn SocketStream>) -> Box<dyn Transport> + Send + Sync>;

/// Test hook invoked for every admitted peer.
pub type PeerHook = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;

/// A closure executed by the run loop over the peer map.
pub(crate) struct PeerOp(pub Box<dyn FnOnce(&HashMap<NodeId, Arc<Peer>>) + Send>);

/// Errors surfaced from server lifecycle operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,

    #[error("max_peers must be greater than zero")]
    NoMaxPeers,

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        source: std::io::Error,
    },
}

/// Server configuration. Set the fields before [`Server::start`]; they
/// are not read again after startup.
pub struct ServerConfig {
    /// Local identity (secp256k1 keypair). Required.
    pub identity: Identity,

    /// Maximum number of admitted peers, not counting trusted and
    /// static-dialed connections. Must be greater than zero.
    pub max_peers: usize,

    /// Target number of dynamically discovered peers. Ignored when no
    /// discovery table is configured.
    pub min_connected_peers: usize,

    /// Cap on inbound connections in pre-admission state. Zero selects
    /// [`MAX_ACCEPT_CONNS`].
    pub max_pending_peers: usize,

    /// Node name advertised in the protocol handshake.
    pub name: String,

    /// Cosmetic suffix appended to the advertised name.
    pub extra_data: String,

    /// Pre-configured nodes kept connected at all times.
    pub static_nodes: Vec<NodeRecord>,

    /// Nodes always allowed to connect, even above the peer cap.
    pub trusted_nodes: Vec<NodeRecord>,

    /// Sub-protocols supported by this server.
    pub protocols: Vec<Protocol>,

    /// TCP listen address. `None` disables inbound connections.
    pub listen_addr: Option<String>,

    /// Discovery table used for dynamic dialing. `None` disables it.
    pub discovery_table: Option<Arc<dyn DiscoveryTable>>,

    /// NAT port mapper for the listening port.
    pub nat: Option<Arc<dyn NatInterface>>,

    /// Dialer for outbound connections; defaults to TCP with
    /// [`crate::dial::DEFAULT_DIAL_TIMEOUT`].
    pub dialer: Option<Arc<dyn Dialer>>,

    /// Suppress all outbound dialing.
    pub no_dial: bool,

    /// Transport factory; defaults to [`FramedTransport`]. Tests use
    /// this to inhibit the whole protocol stack.
    pub new_transport: Option<TransportFactory>,

    /// Hook invoked for every admitted peer.
    pub new_peer_hook: Option<PeerHook>,
}

impl ServerConfig {
    /// A configuration with conservative defaults and no listener.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            max_peers: 25,
            min_connected_peers: 8,
            max_pending_peers: 0,
            name: "wharf".to_string(),
            extra_data: String::new(),
            static_nodes: Vec::new(),
            trusted_nodes: Vec::new(),
            protocols: Vec::new(),
            listen_addr: None,
            discovery_table: None,
            nat: None,
            dialer: None,
            no_dial: false,
            new_transport: None,
            new_peer_hook: None,
        }
    }
}

/// State shared with setup drivers and task workers.
pub(crate) struct Shared {
    pub identity: Identity,
    pub our_hello: ProtoHandshake,
    pub new_transport: TransportFactory,
    pub posthandshake_tx: mpsc::Sender<setup::Checkpoint>,
    pub addpeer_tx: mpsc::Sender<setup::Checkpoint>,
    pub quit: watch::Receiver<bool>,
    pub running: Arc<AtomicBool>,
}

/// Wait until the quit signal fires (or its sender is gone).
pub(crate) async fn quit_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Tracks spawned workers for shutdown.
///
/// Every worker holds a guard; [`Server::stop`] drops the prototype and
/// waits for the channel to close, which happens once the last guard is
/// dropped.
pub(crate) struct WaitGroup {
    tx: mpsc::Sender<()>,
}

impl WaitGroup {
    pub(crate) fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Register a worker. The guard must be created before the worker is
    /// spawned and dropped when it exits.
    pub(crate) fn guard(&self) -> WorkerGuard {
        WorkerGuard {
            _tx: self.tx.clone(),
        }
    }

    /// A second handle to the same guard source, for components that
    /// spawn their own workers.
    pub(crate) fn guard_source(&self) -> WaitGroup {
        WaitGroup {
            tx: self.tx.clone(),
        }
    }
}

pub(crate) struct WorkerGuard {
    _tx: mpsc::Sender<()>,
}

/// Channel handles kept by the facade while the server runs.
struct Handles {
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,
    peer_op_tx: mpsc::Sender<PeerOp>,
    add_static_tx: mpsc::Sender<NodeRecord>,
    table: Option<Arc<dyn DiscoveryTable>>,
    wg_rx: mpsc::Receiver<()>,
    wg: WaitGroup,
}

#[derive(Default)]
struct State {
    started: bool,
    local_addr: Option<SocketAddr>,
    handles: Option<Handles>,
}

/// Manages all peer connections.
///
/// Single-use: start once, stop once. All queries go through the run
/// loop, so they reflect a consistent view of the peer map.
pub struct Server {
    config: ServerConfig,
    running: Arc<AtomicBool>,
    state: Mutex<State>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(State::default()),
        }
    }

    /// The local node id.
    pub fn node_id(&self) -> NodeId {
        *self.config.identity.node_id()
    }

    /// Start the server: bind the listener, spawn the run loop and start
    /// dialing. Returns after initialization; the server runs until
    /// [`Server::stop`].
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock().expect("server state lock poisoned");
            if state.started {
                return Err(ServerError::AlreadyStarted);
            }
            state.started = true;
        }
        let result = self.start_inner().await;
        if result.is_err() {
            self.state.lock().expect("server state lock poisoned").started = false;
        }
        result
    }

    async fn start_inner(&self) -> Result<(), ServerError> {
        if self.config.max_peers == 0 {
            return Err(ServerError::NoMaxPeers);
        }
        let identity = self.config.identity.clone();
        let self_id = *identity.node_id();
        info!(id = %self_id.short(), name = %self.config.name, "starting p2p server");

        let (quit_tx, quit_rx) = watch::channel(false);
        let (peer_op_tx, peer_op_rx) = mpsc::channel(1);
        let (add_static_tx, add_static_rx) = mpsc::channel(1);
        let (posthandshake_tx, posthandshake_rx) = mpsc::channel(1);
        let (addpeer_tx, addpeer_rx) = mpsc::channel(1);
        let (delpeer_tx, delpeer_rx) = mpsc::channel::<PeerExit>(1);
        let (taskdone_tx, taskdone_rx) = mpsc::channel::<Task>(MAX_ACTIVE_DIAL_TASKS);
        let (wg, wg_rx) = WaitGroup::new();

        let table = self.config.discovery_table.clone();
        let dialer: Arc<dyn Dialer> = self
            .config
            .dialer
            .clone()
            .unwrap_or_else(|| Arc::new(TcpDialer::default()));
        let new_transport: TransportFactory = self
            .config
            .new_transport
            .clone()
            .unwrap_or_else(|| Arc::new(|socket| Box::new(FramedTransport::new(socket))));

        // Our side of the protocol handshake.
        let mut caps: Vec<_> = self.config.protocols.iter().map(|p| p.cap()).collect();
        caps.sort();
        let advertised_name = if self.config.extra_data.is_empty() {
            self.config.name.clone()
        } else {
            format!("{}/{}", self.config.name, self.config.extra_data)
        };
        let our_hello = ProtoHandshake {
            version: BASE_PROTOCOL_VERSION,
            name: advertised_name,
            caps,
            id: self_id,
        };

        let shared = Arc::new(Shared {
            identity,
            our_hello,
            new_transport,
            posthandshake_tx,
            addpeer_tx,
            quit: quit_rx.clone(),
            running: self.running.clone(),
        });

        // Listener and NAT mapping.
        let mut local_addr = None;
        if let Some(addr) = &self.config.listen_addr {
            let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Listen {
                addr: addr.clone(),
                source: e,
            })?;
            let bound = listener.local_addr().map_err(|e| ServerError::Listen {
                addr: addr.clone(),
                source: e,
            })?;
            local_addr = Some(bound);

            let tokens = if self.config.max_pending_peers > 0 {
                self.config.max_pending_peers
            } else {
                MAX_ACCEPT_CONNS
            };
            let guard = wg.guard();
            let loop_shared = shared.clone();
            let loop_wg = wg.guard_source();
            tokio::spawn(async move {
                let _guard = guard;
                listener::listen_loop(loop_shared, listener, tokens, loop_wg).await;
            });

            if let Some(nat) = &self.config.nat {
                if !bound.ip().is_loopback() {
                    let guard = wg.guard();
                    let nat = nat.clone();
                    let mut nat_quit = quit_rx.clone();
                    let port = bound.port();
                    tokio::spawn(async move {
                        let _guard = guard;
                        nat::map_loop(nat, &mut nat_quit, port, "wharf p2p").await;
                    });
                }
            }
        }

        if self.config.no_dial && self.config.listen_addr.is_none() {
            warn!("neither dialing nor listening, this server will be idle");
        }

        // Dial planner and run loop.
        let dyn_target = if table.is_some() {
            self.config.min_connected_peers
        } else {
            0
        };
        let dial_state = DialState::new(
            &self.config.static_nodes,
            table.clone(),
            dyn_target,
            self_id,
            self.config.no_dial,
        );
        let task_ctx = Arc::new(TaskContext {
            shared: shared.clone(),
            dialer,
            table: table.clone(),
        });

        let run_loop = RunLoop {
            max_peers: self.config.max_peers,
            self_id,
            protocols: self.config.protocols.clone(),
            trusted: self.config.trusted_nodes.iter().map(|n| n.id).collect(),
            dial_state,
            table: table.clone(),
            new_peer_hook: self.config.new_peer_hook.clone(),
            wg: wg.guard_source(),
            task_ctx,
            taskdone_tx,
            delpeer_tx,
            peers: HashMap::new(),
            running_tasks: Vec::new(),
            queued_tasks: Vec::new(),
        };
        let chans = RunLoopChannels {
            quit: quit_rx.clone(),
            add_static_rx,
            peer_op_rx,
            posthandshake_rx,
            addpeer_rx,
            taskdone_rx,
            delpeer_rx,
        };
        let guard = wg.guard();
        tokio::spawn(async move {
            let _guard = guard;
            run_loop.run(chans).await;
        });

        {
            let mut state = self.state.lock().expect("server state lock poisoned");
            state.local_addr = local_addr;
            state.handles = Some(Handles {
                quit_tx,
                quit_rx,
                peer_op_tx,
                add_static_tx,
                table,
                wg_rx,
                wg,
            });
        }
        self.running.store(true, Ordering::SeqCst);
        info!("p2p server running");
        Ok(())
    }

    /// Stop the server and all active peer connections.
    ///
    /// Blocks until every worker spawned by the server has exited.
    /// Idempotent: repeated calls return immediately.
    pub async fn stop(&self) {
        let handles = {
            let mut state = self.state.lock().expect("server state lock poisoned");
            match state.handles.take() {
                Some(handles) => handles,
                None => return,
            }
        };
        self.running.store(false, Ordering::SeqCst);
        info!("stopping p2p server");

        let Handles {
            quit_tx,
            quit_rx,
            peer_op_tx,
            add_static_tx,
            table: _,
            mut wg_rx,
            wg,
        } = handles;

        let _ = quit_tx.send(true);
        // Queries issued from now on fail fast instead of blocking.
        drop(peer_op_tx);
        drop(add_static_tx);
        drop(quit_rx);
        drop(wg);

        // All worker guards share this channel; recv returns None once
        // the last one is dropped.
        while wg_rx.recv().await.is_some() {}
        info!("p2p server stopped");
    }

    /// All connected peers.
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.with_peers(|peers| peers.values().cloned().collect())
            .await
            .unwrap_or_default()
    }

    /// Number of connected peers.
    pub async fn peer_count(&self) -> usize {
        self.with_peers(|peers| peers.len()).await.unwrap_or(0)
    }

    /// Connect to the node and keep the connection until the server is
    /// shut down, reconnecting on failures.
    pub async fn add_peer(&self, node: NodeRecord) {
        let (tx, mut quit) = {
            let state = self.state.lock().expect("server state lock poisoned");
            match &state.handles {
                Some(h) => (h.add_static_tx.clone(), h.quit_rx.clone()),
                None => return,
            }
        };
        tokio::select! {
            _ = tx.send(node) => {}
            _ = quit_signalled(&mut quit) => {}
        }
    }

    /// The local node's endpoint information.
    ///
    /// Taken from the discovery table when one is active, otherwise
    /// synthesized from the listener address; a stopped or non-listening
    /// server reports an unspecified address.
    pub fn local_record(&self) -> NodeRecord {
        let self_id = self.node_id();
        let state = self.state.lock().expect("server state lock poisoned");
        if !self.running.load(Ordering::SeqCst) {
            return NodeRecord::unspecified(self_id);
        }
        if let Some(handles) = &state.handles {
            if let Some(table) = &handles.table {
                return table.local_record();
            }
        }
        match state.local_addr {
            Some(addr) => NodeRecord::new(self_id, addr.ip(), addr.port()),
            None => NodeRecord::unspecified(self_id),
        }
    }

    /// The bound listener address, once started with a listener.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .expect("server state lock poisoned")
            .local_addr
    }

    /// Submit a closure over the peer map to the run loop.
    ///
    /// Returns `None` when the server is not running: queries never
    /// block across shutdown.
    async fn with_peers<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&HashMap<NodeId, Arc<Peer>>) -> R + Send + 'static,
    {
        let (tx, mut quit) = {
            let state = self.state.lock().expect("server state lock poisoned");
            match &state.handles {
                Some(h) => (h.peer_op_tx.clone(), h.quit_rx.clone()),
                None => return None,
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        let op = PeerOp(Box::new(move |peers| {
            let _ = done_tx.send(f(peers));
        }));

        tokio::select! {
            sent = tx.send(op) => {
                if sent.is_err() {
                    return None;
                }
            }
            _ = quit_signalled(&mut quit) => return None,
        }
        tokio::select! {
            result = done_rx => result.ok(),
            _ = quit_signalled(&mut quit) => None,
        }
    }
}
