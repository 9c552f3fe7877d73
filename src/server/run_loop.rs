//! The server run loop: single owner of the peer map and task set.

use super::conn::{Conn, ConnFlags};
use super::setup::{Checkpoint, Verdict};
use super::{quit_signalled, PeerHook, PeerOp, WaitGroup, MAX_ACTIVE_DIAL_TASKS};
use crate::dial::{DialState, Task, TaskContext};
use crate::discovery::{DiscoveryTable, NodeRecord};
use crate::identity::NodeId;
use crate::peer::{Peer, PeerExit};
use crate::protocol::{count_matching_protocols, DisconnectReason, Protocol};
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Channel ends owned by the run loop.
pub(crate) struct RunLoopChannels {
    pub quit: watch::Receiver<bool>,
    pub add_static_rx: mpsc::Receiver<NodeRecord>,
    pub peer_op_rx: mpsc::Receiver<PeerOp>,
    pub posthandshake_rx: mpsc::Receiver<Checkpoint>,
    pub addpeer_rx: mpsc::Receiver<Checkpoint>,
    pub taskdone_rx: mpsc::Receiver<Task>,
    pub delpeer_rx: mpsc::Receiver<PeerExit>,
}

/// State owned exclusively by the run loop.
///
/// Nothing else reads or writes the peer map or the task lists; other
/// components reach them through the channels above.
pub(crate) struct RunLoop {
    pub max_peers: usize,
    pub self_id: NodeId,
    pub protocols: Vec<Protocol>,
    pub trusted: HashSet<NodeId>,
    pub dial_state: DialState,
    pub table: Option<Arc<dyn DiscoveryTable>>,
    pub new_peer_hook: Option<PeerHook>,

    pub wg: WaitGroup,
    pub task_ctx: Arc<TaskContext>,
    pub taskdone_tx: mpsc::Sender<Task>,
    pub delpeer_tx: mpsc::Sender<PeerExit>,

    pub peers: HashMap<NodeId, Arc<Peer>>,
    pub running_tasks: Vec<u64>,
    pub queued_tasks: Vec<Task>,
}

impl RunLoop {
    pub(crate) async fn run(mut self, mut chans: RunLoopChannels) {
        loop {
            // Query the dial planner for new tasks and launch them.
            self.schedule_tasks();

            tokio::select! {
                _ = quit_signalled(&mut chans.quit) => {
                    // The server was stopped. Run the cleanup logic.
                    debug!("run loop spinning down");
                    break;
                }
                Some(node) = chans.add_static_rx.recv() => {
                    // Injected by add_peer; the planner keeps it connected.
                    debug!(peer = %node, "adding static node");
                    self.dial_state.add_static(node);
                }
                Some(op) = chans.peer_op_rx.recv() => {
                    // Peer queries from the facade.
                    (op.0)(&self.peers);
                }
                Some(task) = chans.taskdone_rx.recv() => {
                    debug!(task = %task, "dial task done");
                    self.dial_state.task_done(&task, Instant::now());
                    self.running_tasks.retain(|id| *id != task.id());
                }
                Some(checkpoint) = chans.posthandshake_rx.recv() => {
                    self.handle_posthandshake(checkpoint);
                }
                Some(checkpoint) = chans.addpeer_rx.recv() => {
                    self.handle_addpeer(checkpoint);
                }
                Some(exit) = chans.delpeer_rx.recv() => {
                    debug!(peer = %exit.peer, reason = %exit.reason, "removing p2p peer");
                    self.peers.remove(exit.peer.id());
                }
            }
        }

        // Disconnect all peers.
        for peer in self.peers.values() {
            peer.disconnect(DisconnectReason::Quitting);
        }

        // Terminate discovery. A running lookup will notice soon.
        if let Some(table) = &self.table {
            table.close().await;
        }

        // Wait for peers to shut down. Pending connections and tasks are
        // not handled here; they will notice the quit signal and
        // terminate under the shutdown wait-group.
        debug!(
            pending = self.running_tasks.len(),
            "ignoring pending tasks at spindown"
        );
        while !self.peers.is_empty() {
            match chans.delpeer_rx.recv().await {
                Some(exit) => {
                    debug!(peer = %exit.peer, "removing p2p peer at spindown");
                    self.peers.remove(exit.peer.id());
                }
                None => break,
            }
        }
    }

    /// Start queued tasks, then ask the planner for more until the
    /// active-dial budget is filled.
    fn schedule_tasks(&mut self) {
        let queued = mem::take(&mut self.queued_tasks);
        self.queued_tasks = self.start_tasks(queued);

        if self.running_tasks.len() < MAX_ACTIVE_DIAL_TASKS {
            let new = self.dial_state.new_tasks(
                self.running_tasks.len() + self.queued_tasks.len(),
                &self.peers,
                Instant::now(),
            );
            let rest = self.start_tasks(new);
            self.queued_tasks.extend(rest);
        }
    }

    /// Launch tasks up to the active budget; return the ones that must
    /// wait for a free slot.
    fn start_tasks(&mut self, tasks: Vec<Task>) -> Vec<Task> {
        let mut rest = Vec::new();
        for task in tasks {
            if self.running_tasks.len() >= MAX_ACTIVE_DIAL_TASKS {
                rest.push(task);
                continue;
            }
            debug!(task = %task, "starting task");
            self.running_tasks.push(task.id());

            let ctx = self.task_ctx.clone();
            let done = self.taskdone_tx.clone();
            let guard = self.wg.guard();
            tokio::spawn(async move {
                let _guard = guard;
                task.execute(&ctx).await;
                let _ = done.send(task).await;
            });
        }
        rest
    }

    /// First checkpoint: the remote identity is known but unverified
    /// against the current peer set.
    fn handle_posthandshake(&mut self, checkpoint: Checkpoint) {
        let Checkpoint { mut conn, reply } = checkpoint;

        // Ensure the trusted flag is set before checking the peer cap.
        if let Some(id) = &conn.id {
            if self.trusted.contains(id) {
                conn.flags.insert(ConnFlags::TRUSTED);
            }
        }
        debug!(conn = %conn, "checkpoint posthandshake");

        let verdict = match self.enc_handshake_checks(&conn) {
            Ok(()) => Verdict::Accepted(Some(conn)),
            Err(reason) => Verdict::Rejected(conn, reason),
        };
        let _ = reply.send(verdict);
    }

    /// Second checkpoint: capabilities are known and the identity is
    /// verified; admit the peer or reject it.
    fn handle_addpeer(&mut self, checkpoint: Checkpoint) {
        let Checkpoint { conn, reply } = checkpoint;
        debug!(conn = %conn, "checkpoint addpeer");

        let checks = self.proto_handshake_checks(&conn);
        let verdict = match (checks, conn.id) {
            (Ok(()), Some(id)) => {
                // The handshakes are done and the connection passed all
                // checks: make it a peer and start its driver.
                let (peer, driver) = Peer::new(id, conn, self.protocols.clone());
                self.peers.insert(id, peer.clone());
                debug!(peer = %peer, "adding p2p peer");

                let hook = self.new_peer_hook.clone();
                let delpeer = self.delpeer_tx.clone();
                let guard = self.wg.guard();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Some(hook) = &hook {
                        hook(&peer);
                    }
                    let reason = driver.run().await;
                    // The run loop drains delpeer during shutdown, so
                    // this send must not watch the quit signal.
                    let _ = delpeer.send(PeerExit { peer, reason }).await;
                });
                Verdict::Accepted(None)
            }
            (Err(reason), _) => {
                debug!(conn = %conn, %reason, "not adding peer");
                Verdict::Rejected(conn, reason)
            }
            (Ok(()), None) => Verdict::Rejected(conn, DisconnectReason::InvalidIdentity),
        };

        // The planner assumes dial tasks complete only after the peer is
        // visible in the map: the verdict is sent after the insert above,
        // and the task-done signal fires after the setup driver returns.
        let _ = reply.send(verdict);
    }

    fn enc_handshake_checks(&self, conn: &Conn) -> Result<(), DisconnectReason> {
        let id = match &conn.id {
            Some(id) => id,
            None => return Err(DisconnectReason::InvalidIdentity),
        };
        if !conn.is(ConnFlags::TRUSTED | ConnFlags::STATIC_DIALED)
            && self.peers.len() >= self.max_peers
        {
            return Err(DisconnectReason::TooManyPeers);
        }
        if self.peers.contains_key(id) {
            return Err(DisconnectReason::AlreadyConnected);
        }
        if *id == self.self_id {
            return Err(DisconnectReason::SelfConnect);
        }
        Ok(())
    }

    fn proto_handshake_checks(&self, conn: &Conn) -> Result<(), DisconnectReason> {
        // Drop connections with no matching protocols.
        if !self.protocols.is_empty()
            && count_matching_protocols(&self.protocols, &conn.caps) == 0
        {
            return Err(DisconnectReason::UselessPeer);
        }
        // Repeat the encryption handshake checks: the peer set might
        // have changed between the checkpoints.
        self.enc_handshake_checks(conn)
    }
}
