//! NAT port-mapping capability.
//!
//! The actual mapping mechanism (UPnP, NAT-PMP, manual router config)
//! lives outside this crate; the server only drives an opportunistic
//! refresh loop that must never block startup or shutdown.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use crate::server::quit_signalled;

/// Mapping lease duration requested from the gateway.
pub const MAPPING_LEASE: Duration = Duration::from_secs(20 * 60);

/// Interval between mapping refreshes, comfortably inside the lease.
const MAPPING_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
#[error("port mapping failed: {0}")]
pub struct NatError(pub String);

/// A NAT port mapper.
#[async_trait]
pub trait NatInterface: Send + Sync {
    /// Map `port` on the gateway to the same local port for `lease`.
    async fn map_port(
        &self,
        protocol: &str,
        port: u16,
        label: &str,
        lease: Duration,
    ) -> Result<(), NatError>;
}

/// Keep the TCP listening port mapped until the quit signal fires.
///
/// Failures are logged and retried on the next refresh; the gateway may
/// simply not support mapping.
pub(crate) async fn map_loop(
    nat: std::sync::Arc<dyn NatInterface>,
    quit: &mut watch::Receiver<bool>,
    port: u16,
    label: &str,
) {
    loop {
        match nat.map_port("tcp", port, label, MAPPING_LEASE).await {
            Ok(()) => debug!(port, "mapped network port"),
            Err(e) => debug!(port, error = %e, "could not map network port"),
        }
        tokio::select! {
            _ = sleep(MAPPING_REFRESH_INTERVAL) => {}
            _ = quit_signalled(quit) => return,
        }
    }
}
