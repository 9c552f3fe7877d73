//! Node records and the discovery-table capability.
//!
//! The server consumes node discovery through the [`DiscoveryTable`]
//! trait; a Kademlia-style table lives outside this crate. The built-in
//! [`StaticTable`] serves a fixed bootstrap list, which is enough for
//! dynamic dialing on small deployments and for tests.

use crate::identity::NodeId;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Errors parsing textual node records.
#[derive(Debug, Error)]
pub enum NodeRecordError {
    #[error("invalid node record '{0}': expected <hex id>@<ip>:<tcp>[/<udp>]")]
    InvalidFormat(String),

    #[error("invalid node id in record: {0}")]
    InvalidId(#[from] crate::identity::IdentityError),

    #[error("invalid address in record: {0}")]
    InvalidAddr(#[from] std::net::AddrParseError),

    #[error("invalid port in record: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Network endpoint of a known node.
///
/// Originates from configuration (bootstrap/static/trusted lists) or
/// from the discovery table. Immutable once constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl NodeRecord {
    /// Create a record with equal TCP and UDP ports.
    pub fn new(id: NodeId, ip: IpAddr, tcp_port: u16) -> Self {
        Self {
            id,
            ip,
            tcp_port,
            udp_port: tcp_port,
        }
    }

    /// A record with a zero address, used when neither listener nor
    /// discovery table can provide endpoint information.
    pub fn unspecified(id: NodeId) -> Self {
        Self {
            id,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 0,
            udp_port: 0,
        }
    }

    /// The TCP endpoint used for dialing.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// The UDP endpoint used by discovery.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.udp_port == self.tcp_port {
            write!(f, "{}@{}", self.id, self.tcp_addr())
        } else {
            write!(f, "{}@{}/{}", self.id, self.tcp_addr(), self.udp_port)
        }
    }
}

impl FromStr for NodeRecord {
    type Err = NodeRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id_part, addr_part) = s
            .split_once('@')
            .ok_or_else(|| NodeRecordError::InvalidFormat(s.to_string()))?;
        let id: NodeId = id_part.parse()?;

        // Optional "/udp" suffix after the TCP port.
        let (tcp_part, udp_part) = match addr_part.rsplit_once('/') {
            Some((tcp, udp)) => (tcp, Some(udp)),
            None => (addr_part, None),
        };

        let sock: SocketAddr = tcp_part.parse()?;
        let udp_port = match udp_part {
            Some(p) => p.parse::<u16>()?,
            None => sock.port(),
        };

        Ok(Self {
            id,
            ip: sock.ip(),
            tcp_port: sock.port(),
            udp_port,
        })
    }
}

/// The node-discovery capability consumed by the server.
///
/// Implementations own their own sockets and background refresh; the
/// server only samples live nodes and triggers lookups.
#[async_trait]
pub trait DiscoveryTable: Send + Sync {
    /// Endpoint information for the local node.
    fn local_record(&self) -> NodeRecord;

    /// Fill a sample of up to `max` live nodes, in random order.
    fn read_random_nodes(&self, max: usize) -> Vec<NodeRecord>;

    /// Walk the table towards `target`, refreshing its view.
    async fn lookup(&self, target: NodeId);

    /// Release sockets and background tasks.
    async fn close(&self);
}

/// A discovery table backed by a fixed node list.
///
/// Serves shuffled samples of the configured bootstrap nodes. Lookups
/// are no-ops: the view never grows. Useful for small fixed topologies
/// and as the test table.
pub struct StaticTable {
    local: NodeRecord,
    nodes: Mutex<Vec<NodeRecord>>,
}

impl StaticTable {
    pub fn new(local: NodeRecord, nodes: Vec<NodeRecord>) -> Self {
        Self {
            local,
            nodes: Mutex::new(nodes),
        }
    }

    /// Add a node to the served set, ignoring duplicates and self.
    pub fn insert(&self, record: NodeRecord) {
        if record.id == self.local.id {
            return;
        }
        let mut nodes = self.nodes.lock().expect("static table lock poisoned");
        if !nodes.iter().any(|n| n.id == record.id) {
            nodes.push(record);
        }
    }
}

#[async_trait]
impl DiscoveryTable for StaticTable {
    fn local_record(&self) -> NodeRecord {
        self.local
    }

    fn read_random_nodes(&self, max: usize) -> Vec<NodeRecord> {
        let nodes = self.nodes.lock().expect("static table lock poisoned");
        let mut sample: Vec<NodeRecord> = nodes.clone();
        sample.shuffle(&mut rand::thread_rng());
        sample.truncate(max);
        sample
    }

    async fn lookup(&self, _target: NodeId) {}

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn record(port: u16) -> NodeRecord {
        NodeRecord::new(
            *Identity::generate().node_id(),
            "127.0.0.1".parse().unwrap(),
            port,
        )
    }

    #[test]
    fn test_record_parse_roundtrip() {
        let r = record(30303);
        let parsed: NodeRecord = r.to_string().parse().unwrap();
        assert_eq!(r, parsed);
    }

    #[test]
    fn test_record_parse_split_ports() {
        let id = *Identity::generate().node_id();
        let s = format!("{}@10.0.0.1:30303/30404", id);
        let r: NodeRecord = s.parse().unwrap();
        assert_eq!(r.tcp_port, 30303);
        assert_eq!(r.udp_port, 30404);
        assert_eq!(r.to_string(), s);
    }

    #[test]
    fn test_record_parse_errors() {
        assert!("".parse::<NodeRecord>().is_err());
        assert!("abcd@127.0.0.1:1".parse::<NodeRecord>().is_err());
        let id = *Identity::generate().node_id();
        assert!(format!("{}@nowhere", id).parse::<NodeRecord>().is_err());
        assert!(format!("{}@1.2.3.4:x", id).parse::<NodeRecord>().is_err());
    }

    #[test]
    fn test_static_table_sampling() {
        let local = record(1);
        let nodes: Vec<NodeRecord> = (0..10).map(|i| record(100 + i)).collect();
        let table = StaticTable::new(local, nodes.clone());

        let sample = table.read_random_nodes(4);
        assert_eq!(sample.len(), 4);
        for n in &sample {
            assert!(nodes.contains(n));
        }

        // Asking for more than available returns everything.
        assert_eq!(table.read_random_nodes(64).len(), 10);
    }

    #[test]
    fn test_static_table_insert_dedup() {
        let local = record(1);
        let table = StaticTable::new(local, Vec::new());

        let n = record(2);
        table.insert(n);
        table.insert(n);
        assert_eq!(table.read_random_nodes(16).len(), 1);

        // Self is never served.
        table.insert(local);
        assert_eq!(table.read_random_nodes(16).len(), 1);
    }
}
