//! Setup driver: runs the two handshakes for a nascent connection and
//! checkpoints with the run loop for admission.

use super::conn::{Conn, ConnFlags};
use super::{quit_signalled, Shared, HANDSHAKE_TIMEOUT};
use crate::discovery::NodeRecord;
use crate::protocol::DisconnectReason;
use crate::transport::{MeterHandle, SocketStream};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// A rendezvous between a setup driver and the run loop.
///
/// The run loop answers on `reply`: at the first checkpoint an accepted
/// connection is handed back for the protocol handshake; at the second
/// the run loop keeps it and spawns the peer driver.
pub(crate) struct Checkpoint {
    pub conn: Conn,
    pub reply: oneshot::Sender<Verdict>,
}

pub(crate) enum Verdict {
    /// Admitted. `Some` returns the connection to the setup driver
    /// (first checkpoint); `None` means the run loop took ownership
    /// (second checkpoint).
    Accepted(Option<Conn>),
    /// Rejected; the setup driver closes with the reason.
    Rejected(Conn, DisconnectReason),
}

/// Outcome of a quit- and deadline-guarded handshake step.
enum Step<T> {
    Done(T),
    TimedOut,
    Stopped,
}

/// Run `fut` against the shared handshake deadline and the quit signal.
///
/// The deadline bounds the whole setup pipeline; cancelling the step
/// releases its borrow of the connection so it can still be closed with
/// the proper reason.
async fn guarded<F: Future>(
    quit: &mut tokio::sync::watch::Receiver<bool>,
    deadline: Instant,
    fut: F,
) -> Step<F::Output> {
    tokio::select! {
        out = fut => Step::Done(out),
        _ = sleep_until(deadline) => Step::TimedOut,
        _ = quit_signalled(quit) => Step::Stopped,
    }
}

/// Run the handshakes and attempt to add the connection as a peer.
///
/// Returns when the connection has been admitted (the run loop owns it)
/// or the handshakes have failed and the socket is closed. One instance
/// runs per nascent connection, inbound or dialed.
pub(crate) async fn setup_conn(
    shared: Arc<Shared>,
    socket: Box<dyn SocketStream>,
    remote_addr: SocketAddr,
    flags: ConnFlags,
    dial_dest: Option<NodeRecord>,
    meter: Option<MeterHandle>,
) {
    let transport = (shared.new_transport)(socket);
    let mut conn = Conn::new(transport, flags, remote_addr, meter);

    // Prevent leftover pending conns from entering the handshake.
    if !shared.running.load(Ordering::SeqCst) {
        conn.close(None).await;
        return;
    }

    let mut quit = shared.quit.clone();
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    // Encryption handshake: learn the remote identity.
    let id = match guarded(
        &mut quit,
        deadline,
        conn.transport
            .do_enc_handshake(&shared.identity, dial_dest.as_ref()),
    )
    .await
    {
        Step::Done(Ok(id)) => id,
        Step::Done(Err(e)) => {
            debug!(conn = %conn, error = %e, "failed enc handshake");
            conn.close(None).await;
            return;
        }
        Step::TimedOut => {
            debug!(conn = %conn, "enc handshake timed out");
            conn.close(Some(DisconnectReason::ReadTimeout)).await;
            return;
        }
        Step::Stopped => {
            conn.close(None).await;
            return;
        }
    };
    conn.id = Some(id);

    // For dialed connections, check that the remote key matches.
    if let Some(dest) = &dial_dest {
        if id != dest.id {
            debug!(conn = %conn, want = %dest.id.short(), "dialed identity mismatch");
            conn.close(Some(DisconnectReason::UnexpectedIdentity)).await;
            return;
        }
    }

    // First checkpoint: identity known, request first-stage admission.
    conn = match checkpoint(&mut quit, &shared.posthandshake_tx, conn, "posthandshake").await {
        Some(Some(conn)) => conn,
        _ => return,
    };

    // Protocol handshake: learn capabilities.
    let their_hello = match guarded(
        &mut quit,
        deadline,
        conn.transport.do_proto_handshake(&shared.our_hello),
    )
    .await
    {
        Step::Done(Ok(hello)) => hello,
        Step::Done(Err(e)) => {
            debug!(conn = %conn, error = %e, "failed proto handshake");
            conn.close(None).await;
            return;
        }
        Step::TimedOut => {
            debug!(conn = %conn, "proto handshake timed out");
            conn.close(Some(DisconnectReason::ReadTimeout)).await;
            return;
        }
        Step::Stopped => {
            conn.close(None).await;
            return;
        }
    };

    // The identity advertised over the established channel must match
    // the one proven during the encryption handshake.
    if their_hello.id != id {
        debug!(conn = %conn, claimed = %their_hello.id.short(), "wrong proto handshake identity");
        conn.close(Some(DisconnectReason::UnexpectedIdentity)).await;
        return;
    }
    conn.caps = their_hello.caps;
    conn.name = their_hello.name;

    // Second checkpoint: full admission. On acceptance the run loop has
    // already spawned the peer driver.
    checkpoint(&mut quit, &shared.addpeer_tx, conn, "addpeer").await;
}

/// Deliver the connection to the run loop and await the verdict.
///
/// Returns `None` when the connection is gone (rejected and closed, shut
/// down, or owned by the run loop after full admission).
async fn checkpoint(
    quit: &mut tokio::sync::watch::Receiver<bool>,
    stage: &mpsc::Sender<Checkpoint>,
    conn: Conn,
    stage_name: &'static str,
) -> Option<Option<Conn>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = Checkpoint {
        conn,
        reply: reply_tx,
    };

    tokio::select! {
        result = stage.send(request) => {
            if let Err(mpsc::error::SendError(request)) = result {
                // Run loop is gone; dropping the descriptor closes the socket.
                drop(request);
                return None;
            }
        }
        // Cancelling the send drops the descriptor, closing the socket.
        _ = quit_signalled(quit) => return None,
    }

    tokio::select! {
        verdict = reply_rx => match verdict {
            Ok(Verdict::Accepted(conn)) => Some(conn),
            Ok(Verdict::Rejected(conn, reason)) => {
                debug!(conn = %conn, %reason, stage = stage_name, "checkpoint rejected");
                conn.close(Some(reason)).await;
                None
            }
            // Run loop exited while holding the connection; it is
            // dropped there.
            Err(_) => None,
        },
        _ = quit_signalled(quit) => None,
    }
}
