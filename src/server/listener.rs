//! Accept loop for inbound connections.

use super::conn::ConnFlags;
use super::setup::setup_conn;
use super::{quit_signalled, Shared, WaitGroup};
use crate::transport::MeteredStream;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Accept inbound connections, bounded by a semaphore of pre-handshake
/// slots.
///
/// Each accepted socket is wrapped in a byte-metering shim and handed to
/// a setup driver worker; the worker returns its slot on exit, so at
/// most `tokens` connections linger pre-admission. Exits when the quit
/// signal fires or the listener fails.
pub(crate) async fn listen_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    tokens: usize,
    wg: WaitGroup,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "listening for inbound connections");
    }

    let (slot_tx, mut slot_rx) = mpsc::channel::<()>(tokens);
    for _ in 0..tokens {
        slot_tx.try_send(()).expect("slot channel sized to token count");
    }

    let mut quit = shared.quit.clone();
    loop {
        // Acquire a pre-handshake slot before accepting.
        tokio::select! {
            slot = slot_rx.recv() => {
                if slot.is_none() {
                    return;
                }
            }
            _ = quit_signalled(&mut quit) => return,
        }

        let (socket, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "accept failed, closing listener");
                    return;
                }
            },
            _ = quit_signalled(&mut quit) => return,
        };

        debug!(remote = %remote_addr, "accepted connection");
        let (metered, meter) = MeteredStream::new(socket);

        let shared = shared.clone();
        let slots = slot_tx.clone();
        let guard = wg.guard();
        tokio::spawn(async move {
            let _guard = guard;
            setup_conn(
                shared,
                Box::new(metered),
                remote_addr,
                ConnFlags::INBOUND,
                None,
                Some(meter),
            )
            .await;
            let _ = slots.send(()).await;
        });
    }
}
