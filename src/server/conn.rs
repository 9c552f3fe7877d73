//! Connection descriptor and provenance flags.

use crate::identity::NodeId;
use crate::protocol::{Cap, DisconnectReason};
use crate::transport::{MeterHandle, Transport};
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// Provenance and trust flags of a connection.
///
/// A connection carries exactly one of `DYN_DIALED`, `STATIC_DIALED` or
/// `INBOUND`, and optionally `TRUSTED` (added by the run loop at the
/// first checkpoint). `TRUSTED` and `STATIC_DIALED` exempt the
/// connection from the peer cap.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnFlags(u8);

impl ConnFlags {
    pub const DYN_DIALED: ConnFlags = ConnFlags(1);
    pub const STATIC_DIALED: ConnFlags = ConnFlags(1 << 1);
    pub const INBOUND: ConnFlags = ConnFlags(1 << 2);
    pub const TRUSTED: ConnFlags = ConnFlags(1 << 3);

    /// Test whether any of the given flags is set.
    pub fn is(self, flags: ConnFlags) -> bool {
        self.0 & flags.0 != 0
    }

    /// Add flags to the set.
    pub fn insert(&mut self, flags: ConnFlags) {
        self.0 |= flags.0;
    }
}

impl std::ops::BitOr for ConnFlags {
    type Output = ConnFlags;

    fn bitor(self, rhs: ConnFlags) -> ConnFlags {
        ConnFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for ConnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is(ConnFlags::TRUSTED) {
            parts.push("trusted");
        }
        if self.is(ConnFlags::DYN_DIALED) {
            parts.push("dyn dial");
        }
        if self.is(ConnFlags::STATIC_DIALED) {
            parts.push("static dial");
        }
        if self.is(ConnFlags::INBOUND) {
            parts.push("inbound");
        }
        write!(f, "{}", parts.join(" "))
    }
}

impl fmt::Debug for ConnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnFlags({})", self)
    }
}

/// A connection moving through the two-phase handshake pipeline.
///
/// `id` is populated after the encryption handshake; `caps` and `name`
/// after the protocol handshake. The descriptor travels between the
/// setup driver and the run loop at each checkpoint; on full admission
/// the run loop keeps it and turns it into a peer.
pub(crate) struct Conn {
    pub transport: Box<dyn Transport>,
    pub flags: ConnFlags,
    pub remote_addr: SocketAddr,
    /// Valid after the encryption handshake.
    pub id: Option<NodeId>,
    /// Valid after the protocol handshake.
    pub caps: Vec<Cap>,
    /// Valid after the protocol handshake.
    pub name: String,
    /// Byte counters, present on metered (inbound) sockets.
    pub meter: Option<MeterHandle>,
}

impl Conn {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        flags: ConnFlags,
        remote_addr: SocketAddr,
        meter: Option<MeterHandle>,
    ) -> Self {
        Self {
            transport,
            flags,
            remote_addr,
            id: None,
            caps: Vec::new(),
            name: String::new(),
            meter,
        }
    }

    /// Test connection flags.
    pub(crate) fn is(&self, flags: ConnFlags) -> bool {
        self.flags.is(flags)
    }

    /// Close the underlying transport, reporting the reason to the
    /// remote where one is given.
    pub(crate) async fn close(mut self, reason: Option<DisconnectReason>) {
        self.transport.close(reason).await;
        if let Some(meter) = &self.meter {
            debug!(
                conn = %self,
                bytes_in = meter.bytes_read(),
                bytes_out = meter.bytes_written(),
                "connection closed"
            );
        }
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} conn", self.flags)?;
        if let Some(id) = &self.id {
            write!(f, " {}", id.short())?;
        }
        write!(f, " {}", self.remote_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_membership() {
        let mut flags = ConnFlags::INBOUND;
        assert!(flags.is(ConnFlags::INBOUND));
        assert!(!flags.is(ConnFlags::TRUSTED));

        flags.insert(ConnFlags::TRUSTED);
        assert!(flags.is(ConnFlags::TRUSTED));

        // A combined mask matches when any member is set.
        assert!(flags.is(ConnFlags::TRUSTED | ConnFlags::STATIC_DIALED));
        assert!(!flags.is(ConnFlags::DYN_DIALED | ConnFlags::STATIC_DIALED));
    }

    #[test]
    fn test_flags_display() {
        let flags = ConnFlags::TRUSTED | ConnFlags::INBOUND;
        assert_eq!(flags.to_string(), "trusted inbound");
        assert_eq!(ConnFlags::DYN_DIALED.to_string(), "dyn dial");
    }
}
