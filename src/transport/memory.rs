//! In-memory connection pair.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`Connection`] trait: two endpoints joined back to back, so frames sent on
//! one arrive in the inbox of the other. It is intended for testing, local
//! execution, and as the reference for endpoint semantics.
//!
//! ## Reference Semantics
//!
//! - Frames are delivered in send order, never dropped or duplicated.
//! - Closing either endpoint closes the pair: both inboxes end and both
//!   endpoints report `Closed`.
//! - `send()` on a closed endpoint fails with `ConnectionClosed`.
//!
//! ## Non-Goals
//!
//! This transport does not emulate handshakes, latency, or partial failures
//! of real sockets.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::{
    // ---
    log_debug,
    log_trace,
    Connection,
    ConnectionBase,
    ConnectionPtr,
    Result,
    RpcError,
};

/// Frames buffered per direction before `send()` waits for the reader.
const PAIR_CAPACITY: usize = 64;

/// One side of an in-memory pair.
struct MemoryConnection {
    // ---
    base: ConnectionBase,
    outbound: mpsc::Sender<Bytes>,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    // ---
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    /// Deliver a frame to the other endpoint's inbox.
    async fn send(&self, frame: Bytes) -> Result<()> {
        // ---
        self.base.ensure_open()?;

        log_trace!(
            "{}: memory send {} bytes to {}",
            self.base.connection_id(),
            frame.len(),
            self.base.peer_id()
        );

        self.outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Close both endpoints of the pair.
    async fn close(&self) -> Result<()> {
        // ---
        self.base.mark_closing();
        if self.base.mark_closed() {
            log_debug!("{}: memory connection closed", self.base.connection_id());
        }
        Ok(())
    }
}

/// Create two connected in-memory endpoints.
///
/// `a_peer` names the remote end as seen by the first endpoint (that is, the
/// second endpoint), and `b_peer` the reverse.
///
/// ```
/// # async fn example() -> duplex_rpc::Result<()> {
/// use bytes::Bytes;
///
/// let (a, b) = duplex_rpc::memory_pair("b", "a");
/// let mut inbox = b.receive()?;
///
/// a.send(Bytes::from_static(b"hello")).await?;
/// assert_eq!(inbox.recv().await, Some(Bytes::from_static(b"hello")));
/// # Ok(())
/// # }
/// ```
pub fn memory_pair(
    a_peer: impl Into<String>,
    b_peer: impl Into<String>,
) -> (ConnectionPtr, ConnectionPtr) {
    // ---
    let (a_tx, a_rx) = mpsc::channel(PAIR_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(PAIR_CAPACITY);

    // One close signal for the pair: closing either side ends both.
    let (closed, _) = watch::channel(false);
    let closed = Arc::new(closed);

    let a = MemoryConnection {
        base: ConnectionBase::new(a_peer, a_rx, closed.clone()),
        outbound: b_tx,
    };
    let b = MemoryConnection {
        base: ConnectionBase::new(b_peer, b_rx, closed),
        outbound: a_tx,
    };

    a.base.mark_open();
    b.base.mark_open();

    log_debug!(
        "memory pair created: {} <-> {}",
        a.base.connection_id(),
        b.base.connection_id()
    );

    (Arc::new(a), Arc::new(b))
}
