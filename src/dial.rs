//! Dial scheduling: the planner deciding whom to contact and the tasks
//! that carry the work out.
//!
//! [`DialState`] is owned by the run loop and queried once per loop
//! iteration. It keeps static nodes connected, tops up dynamic peers from
//! the discovery table, and suppresses reconnection churn through a dial
//! history with a fixed cooldown window.

use crate::discovery::{DiscoveryTable, NodeRecord};
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::server::conn::ConnFlags;
use crate::server::setup::setup_conn;
use crate::server::{
    quit_signalled, Shared, DIAL_HISTORY_EXPIRATION, REFRESH_PEERS_INTERVAL,
    STATIC_PEER_CHECK_INTERVAL,
};
use crate::transport::SocketStream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// TCP connect timeout for outbound dials.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Establishes outbound sockets for dial tasks.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dest: &NodeRecord) -> std::io::Result<Box<dyn SocketStream>>;
}

/// Default dialer: plain TCP with [`DEFAULT_DIAL_TIMEOUT`].
pub struct TcpDialer {
    pub timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, dest: &NodeRecord) -> std::io::Result<Box<dyn SocketStream>> {
        match timeout(self.timeout, TcpStream::connect(dest.tcp_addr())).await {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timed out",
            )),
        }
    }
}

/// A unit of work produced by the planner and executed on a worker.
pub(crate) struct Task {
    id: u64,
    pub kind: TaskKind,
}

pub(crate) enum TaskKind {
    /// Attempt a TCP connection to a specific node.
    Dial { flags: ConnFlags, dest: NodeRecord },
    /// Ask the discovery table to refresh its view.
    Lookup,
    /// Block for a duration so future work gets scheduled without
    /// busy-spinning.
    Wait { duration: Duration },
}

/// Everything a task worker needs to carry out its work.
pub(crate) struct TaskContext {
    pub shared: Arc<Shared>,
    pub dialer: Arc<dyn Dialer>,
    pub table: Option<Arc<dyn DiscoveryTable>>,
}

impl Task {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Execute the task to completion. Dial failures are logged, not
    /// surfaced: the planner's cooldown decides whether to retry.
    pub(crate) async fn execute(&self, ctx: &TaskContext) {
        match &self.kind {
            TaskKind::Dial { flags, dest } => match ctx.dialer.dial(dest).await {
                Ok(socket) => {
                    setup_conn(
                        ctx.shared.clone(),
                        socket,
                        dest.tcp_addr(),
                        *flags,
                        Some(*dest),
                        None,
                    )
                    .await;
                }
                Err(e) => {
                    debug!(dest = %dest, error = %e, "dial failed");
                }
            },
            TaskKind::Lookup => {
                if let Some(table) = &ctx.table {
                    table.lookup(NodeId::random()).await;
                }
            }
            TaskKind::Wait { duration } => {
                let mut quit = ctx.shared.quit.clone();
                tokio::select! {
                    _ = sleep(*duration) => {}
                    _ = quit_signalled(&mut quit) => {}
                }
            }
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TaskKind::Dial { flags, dest } => {
                write!(f, "dial task #{} {} {}", self.id, flags, dest)
            }
            TaskKind::Lookup => write!(f, "discovery lookup task #{}", self.id),
            TaskKind::Wait { duration } => {
                write!(f, "wait task #{} {:?}", self.id, duration)
            }
        }
    }
}

/// Why a dial candidate was suppressed.
#[derive(Debug, PartialEq, Eq)]
enum DialSuppression {
    AlreadyDialing,
    AlreadyConnected,
    OwnNode,
    RecentlyDialed,
}

/// Dial history entry: a node must not be re-dialed before `exp`.
struct HistEntry {
    id: NodeId,
    exp: Instant,
}

/// Cooldown cache over recent dial attempts.
#[derive(Default)]
struct DialHistory(Vec<HistEntry>);

impl DialHistory {
    /// Record an attempt, replacing any previous entry for the node.
    fn add(&mut self, id: NodeId, exp: Instant) {
        self.0.retain(|e| e.id != id);
        self.0.push(HistEntry { id, exp });
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.0.iter().any(|e| e.id == *id)
    }

    /// Drop entries whose cooldown has passed.
    fn expire(&mut self, now: Instant) {
        self.0.retain(|e| e.exp > now);
    }

    fn min_expiry(&self) -> Option<Instant> {
        self.0.iter().map(|e| e.exp).min()
    }
}

/// The dial-state planner.
///
/// Only the run loop calls into it, so all state is effectively
/// serialized without locks.
pub(crate) struct DialState {
    static_nodes: HashMap<NodeId, NodeRecord>,
    table: Option<Arc<dyn DiscoveryTable>>,
    max_dyn_dials: usize,
    self_id: NodeId,
    no_dial: bool,

    /// Nodes with a dial task in flight, with the task's flags.
    dialing: HashMap<NodeId, ConnFlags>,
    hist: DialHistory,

    lookup_running: bool,
    last_lookup: Option<Instant>,
    last_static_check: Option<Instant>,

    next_task_id: u64,
}

impl DialState {
    pub(crate) fn new(
        static_nodes: &[NodeRecord],
        table: Option<Arc<dyn DiscoveryTable>>,
        max_dyn_dials: usize,
        self_id: NodeId,
        no_dial: bool,
    ) -> Self {
        Self {
            static_nodes: static_nodes.iter().map(|n| (n.id, *n)).collect(),
            table,
            max_dyn_dials,
            self_id,
            no_dial,
            dialing: HashMap::new(),
            hist: DialHistory::default(),
            lookup_running: false,
            last_lookup: None,
            last_static_check: None,
            next_task_id: 0,
        }
    }

    /// Register a static node added at runtime. Duplicates are ignored,
    /// making repeated `add_peer` calls idempotent. The static check
    /// gate is reset so the new node is dialed on the next tick.
    pub(crate) fn add_static(&mut self, node: NodeRecord) {
        if self.static_nodes.insert(node.id, node).is_none() {
            self.last_static_check = None;
        }
    }

    /// Produce new tasks for the run loop.
    ///
    /// `n_pending` is the number of tasks currently running or queued;
    /// it gates the wait-task fallback so an idle planner wakes up when
    /// the next cooldown expires.
    pub(crate) fn new_tasks(
        &mut self,
        n_pending: usize,
        peers: &HashMap<NodeId, Arc<Peer>>,
        now: Instant,
    ) -> Vec<Task> {
        if self.no_dial {
            return Vec::new();
        }
        self.hist.expire(now);
        let mut tasks = Vec::new();

        // Static nodes, re-checked at most every STATIC_PEER_CHECK_INTERVAL.
        let statics_due = self
            .last_static_check
            .map_or(true, |t| now >= t + STATIC_PEER_CHECK_INTERVAL);
        if statics_due && !self.static_nodes.is_empty() {
            self.last_static_check = Some(now);
            let candidates: Vec<NodeRecord> = self.static_nodes.values().copied().collect();
            for dest in candidates {
                if self.check_dial(&dest.id, peers).is_ok() {
                    self.dialing.insert(dest.id, ConnFlags::STATIC_DIALED);
                    tasks.push(self.make_task(TaskKind::Dial {
                        flags: ConnFlags::STATIC_DIALED,
                        dest,
                    }));
                }
            }
        }

        if let Some(table) = self.table.clone() {
            // Top up dynamic peers from the table.
            let dyn_peers = peers.values().filter(|p| p.is_dyn_dialed()).count();
            let dyn_dialing = self
                .dialing
                .values()
                .filter(|f| f.is(ConnFlags::DYN_DIALED))
                .count();
            let mut need_dyn = self
                .max_dyn_dials
                .saturating_sub(dyn_peers)
                .saturating_sub(dyn_dialing);

            if need_dyn > 0 {
                for dest in table.read_random_nodes(self.max_dyn_dials) {
                    if need_dyn == 0 {
                        break;
                    }
                    // Static nodes have their own schedule.
                    if self.static_nodes.contains_key(&dest.id) {
                        continue;
                    }
                    if self.check_dial(&dest.id, peers).is_ok() {
                        self.dialing.insert(dest.id, ConnFlags::DYN_DIALED);
                        tasks.push(self.make_task(TaskKind::Dial {
                            flags: ConnFlags::DYN_DIALED,
                            dest,
                        }));
                        need_dyn -= 1;
                    }
                }
            }

            // Keep the table warm.
            let lookup_due = self
                .last_lookup
                .map_or(true, |t| now >= t + REFRESH_PEERS_INTERVAL);
            if !self.lookup_running && lookup_due {
                self.lookup_running = true;
                self.last_lookup = Some(now);
                tasks.push(self.make_task(TaskKind::Lookup));
            }
        }

        // Nothing to do now: schedule a wake-up for the next cooldown
        // expiry, static re-check or discovery refresh, so the planner
        // does not depend on unrelated events to make progress.
        if tasks.is_empty() && n_pending == 0 {
            if let Some(at) = self.next_wakeup() {
                tasks.push(self.make_task(TaskKind::Wait {
                    duration: at.saturating_duration_since(now),
                }));
            }
        }

        tasks
    }

    /// The earliest instant at which the planner could have new work.
    fn next_wakeup(&self) -> Option<Instant> {
        let mut wake = self.hist.min_expiry();
        let mut consider = |at: Instant| {
            wake = Some(match wake {
                Some(w) if w <= at => w,
                _ => at,
            });
        };
        if !self.static_nodes.is_empty() {
            if let Some(t) = self.last_static_check {
                consider(t + STATIC_PEER_CHECK_INTERVAL);
            }
        }
        if self.table.is_some() && !self.lookup_running {
            if let Some(t) = self.last_lookup {
                consider(t + REFRESH_PEERS_INTERVAL);
            }
        }
        wake
    }

    /// Consume a task-completion event.
    pub(crate) fn task_done(&mut self, task: &Task, now: Instant) {
        match &task.kind {
            TaskKind::Dial { dest, .. } => {
                self.hist.add(dest.id, now + DIAL_HISTORY_EXPIRATION);
                self.dialing.remove(&dest.id);
            }
            TaskKind::Lookup => {
                self.lookup_running = false;
            }
            TaskKind::Wait { .. } => {}
        }
    }

    fn check_dial(
        &self,
        id: &NodeId,
        peers: &HashMap<NodeId, Arc<Peer>>,
    ) -> Result<(), DialSuppression> {
        if self.dialing.contains_key(id) {
            return Err(DialSuppression::AlreadyDialing);
        }
        if peers.contains_key(id) {
            return Err(DialSuppression::AlreadyConnected);
        }
        if *id == self.self_id {
            return Err(DialSuppression::OwnNode);
        }
        if self.hist.contains(id) {
            return Err(DialSuppression::RecentlyDialed);
        }
        Ok(())
    }

    fn make_task(&mut self, kind: TaskKind) -> Task {
        let id = self.next_task_id;
        self.next_task_id += 1;
        Task { id, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticTable;
    use crate::identity::Identity;

    fn record(port: u16) -> NodeRecord {
        NodeRecord::new(
            *Identity::generate().node_id(),
            "127.0.0.1".parse().unwrap(),
            port,
        )
    }

    fn self_id() -> NodeId {
        *Identity::generate().node_id()
    }

    fn no_peers() -> HashMap<NodeId, Arc<Peer>> {
        HashMap::new()
    }

    fn dial_dests(tasks: &[Task]) -> Vec<NodeRecord> {
        tasks
            .iter()
            .filter_map(|t| match &t.kind {
                TaskKind::Dial { dest, .. } => Some(*dest),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_static_node_dialed_with_static_flag() {
        let node = record(30301);
        let mut state = DialState::new(&[node], None, 0, self_id(), false);

        let tasks = state.new_tasks(0, &no_peers(), Instant::now());
        assert_eq!(tasks.len(), 1);
        match &tasks[0].kind {
            TaskKind::Dial { flags, dest } => {
                assert!(flags.is(ConnFlags::STATIC_DIALED));
                assert_eq!(*dest, node);
            }
            _ => panic!("expected dial task"),
        }
    }

    #[test]
    fn test_cooldown_suppresses_redial() {
        let node = record(30301);
        let mut state = DialState::new(&[node], None, 0, self_id(), false);
        let now = Instant::now();

        let tasks = state.new_tasks(0, &no_peers(), now);
        assert_eq!(dial_dests(&tasks).len(), 1);

        // The dial completes (failed); history starts the cooldown.
        state.task_done(&tasks[0], now);

        // Within the window only a wait task may be produced, timed to
        // the cooldown expiry.
        let later = now + STATIC_PEER_CHECK_INTERVAL + Duration::from_secs(1);
        let tasks = state.new_tasks(0, &no_peers(), later);
        assert!(dial_dests(&tasks).is_empty());
        match tasks.first().map(|t| &t.kind) {
            Some(TaskKind::Wait { duration }) => {
                assert!(*duration <= DIAL_HISTORY_EXPIRATION);
                assert!(*duration > Duration::ZERO);
            }
            _ => panic!("expected wait task"),
        }

        // After the window the node is dialed again.
        let expired = now + DIAL_HISTORY_EXPIRATION + Duration::from_secs(1);
        let tasks = state.new_tasks(0, &no_peers(), expired);
        assert_eq!(dial_dests(&tasks), vec![node]);
    }

    #[test]
    fn test_no_duplicate_dial_while_in_flight() {
        let node = record(30301);
        let mut state = DialState::new(&[node], None, 0, self_id(), false);
        let now = Instant::now();

        let first = state.new_tasks(0, &no_peers(), now);
        assert_eq!(dial_dests(&first).len(), 1);

        // The task has not completed; a later check must not re-dial.
        let later = now + STATIC_PEER_CHECK_INTERVAL + Duration::from_secs(1);
        let second = state.new_tasks(1, &no_peers(), later);
        assert!(dial_dests(&second).is_empty());
    }

    #[test]
    fn test_connected_static_not_redialed() {
        let node = record(30301);
        let mut state = DialState::new(&[node], None, 0, self_id(), false);

        // Fake an existing peer for the node by admitting it under its id.
        let mut peers = no_peers();
        let (peer, _driver) = test_peer(node.id);
        peers.insert(node.id, peer);

        let tasks = state.new_tasks(0, &peers, Instant::now());
        assert!(dial_dests(&tasks).is_empty());
    }

    #[test]
    fn test_self_never_dialed() {
        let me = self_id();
        let node = NodeRecord::new(me, "127.0.0.1".parse().unwrap(), 30301);
        let mut state = DialState::new(&[node], None, 0, me, false);

        let tasks = state.new_tasks(0, &no_peers(), Instant::now());
        assert!(dial_dests(&tasks).is_empty());
    }

    #[test]
    fn test_add_static_is_idempotent() {
        let node = record(30301);
        let mut state = DialState::new(&[], None, 0, self_id(), false);

        state.add_static(node);
        state.add_static(node);

        let tasks = state.new_tasks(0, &no_peers(), Instant::now());
        assert_eq!(dial_dests(&tasks), vec![node]);
    }

    #[test]
    fn test_dynamic_dials_filtered_and_bounded() {
        let me = self_id();
        let static_node = record(30301);
        let connected = record(30302);
        let fresh_a = record(30303);
        let fresh_b = record(30304);
        let own = NodeRecord::new(me, "127.0.0.1".parse().unwrap(), 30305);

        let local = record(1);
        let table = Arc::new(StaticTable::new(
            local,
            vec![static_node, connected, fresh_a, fresh_b, own],
        ));

        let mut state = DialState::new(&[static_node], Some(table), 2, me, false);

        let mut peers = no_peers();
        let (peer, _driver) = test_peer(connected.id);
        peers.insert(connected.id, peer);

        let now = Instant::now();
        let tasks = state.new_tasks(0, &peers, now);
        let dials = dial_dests(&tasks);

        // The static node is dialed statically; dynamically only the two
        // fresh nodes qualify.
        let dyn_dials: Vec<_> = tasks
            .iter()
            .filter_map(|t| match &t.kind {
                TaskKind::Dial { flags, dest } if flags.is(ConnFlags::DYN_DIALED) => Some(*dest),
                _ => None,
            })
            .collect();
        assert_eq!(dyn_dials.len(), 2);
        assert!(dyn_dials.contains(&fresh_a));
        assert!(dyn_dials.contains(&fresh_b));
        assert!(dials.contains(&static_node));

        // A lookup task keeps the table warm.
        assert!(tasks.iter().any(|t| matches!(t.kind, TaskKind::Lookup)));
    }

    #[test]
    fn test_lookup_rate_limited() {
        let local = record(1);
        let table = Arc::new(StaticTable::new(local, vec![]));
        let mut state = DialState::new(&[], Some(table), 1, self_id(), false);
        let now = Instant::now();

        let tasks = state.new_tasks(0, &no_peers(), now);
        let lookups = tasks
            .iter()
            .filter(|t| matches!(t.kind, TaskKind::Lookup))
            .count();
        assert_eq!(lookups, 1);

        // While running, and within the refresh interval, no new lookup.
        let tasks = state.new_tasks(1, &no_peers(), now + Duration::from_secs(1));
        assert!(!tasks.iter().any(|t| matches!(t.kind, TaskKind::Lookup)));

        state.task_done(&Task { id: 0, kind: TaskKind::Lookup }, now);
        let tasks = state.new_tasks(0, &no_peers(), now + Duration::from_secs(1));
        assert!(!tasks.iter().any(|t| matches!(t.kind, TaskKind::Lookup)));

        // After the interval a fresh lookup fires.
        let tasks = state.new_tasks(0, &no_peers(), now + REFRESH_PEERS_INTERVAL + Duration::from_secs(1));
        assert!(tasks.iter().any(|t| matches!(t.kind, TaskKind::Lookup)));
    }

    #[test]
    fn test_no_dial_produces_nothing() {
        let node = record(30301);
        let local = record(1);
        let table = Arc::new(StaticTable::new(local, vec![record(2)]));
        let mut state = DialState::new(&[node], Some(table), 4, self_id(), true);

        let tasks = state.new_tasks(0, &no_peers(), Instant::now());
        assert!(tasks.is_empty());
    }

    /// Build a peer handle (with an inert driver) for planner tests.
    fn test_peer(id: NodeId) -> (Arc<Peer>, crate::peer::PeerDriver) {
        use crate::server::conn::Conn;
        use crate::transport::FramedTransport;

        let (a, _b) = tokio::io::duplex(64);
        let conn = Conn {
            transport: Box::new(FramedTransport::new(Box::new(a))),
            flags: ConnFlags::DYN_DIALED,
            remote_addr: "127.0.0.1:0".parse().unwrap(),
            id: Some(id),
            caps: Vec::new(),
            name: String::new(),
            meter: None,
        };
        Peer::new(id, conn, Vec::new())
    }
}
