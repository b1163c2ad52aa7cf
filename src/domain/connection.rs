// src/domain/connection.rs

//! Connection endpoint abstractions.
//!
//! A connection endpoint owns one open, message-framed duplex channel. It
//! sends binary frames, hands out the stream of received frames exactly once,
//! and reports its lifecycle state. It knows nothing about envelopes,
//! correlation, or timeouts; those live in the peer layer.
//!
//! Concrete implementations live under `src/transport/`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::{ConnectionId, Result, RpcError};

/// Lifecycle of a connection endpoint.
///
/// Transitions only move forward: `Connecting -> Open -> Closing -> Closed`.
/// `Closed` may be entered from any state when the channel fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// The endpoint exists but the channel is not usable yet.
    Connecting = 0,
    /// Frames may be sent and received.
    Open = 1,
    /// A graceful close has been requested.
    Closing = 2,
    /// The channel has ended; nothing more will be sent or received.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Wait until a close signal reads `true` or its sender is gone.
pub(crate) async fn wait_closed(signal: &mut watch::Receiver<bool>) {
    // ---
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// The received-frame sequence of one connection.
///
/// Finite: `recv()` yields `None` once the channel has closed. There is one
/// `Inbox` per endpoint and it cannot be restarted; reconnecting means
/// building a new endpoint.
pub struct Inbox {
    // ---
    frames: mpsc::Receiver<Bytes>,
    closed: watch::Receiver<bool>,
}

impl Inbox {
    /// Build an inbox over a frame channel and the endpoint's close signal.
    pub(crate) fn new(frames: mpsc::Receiver<Bytes>, closed: watch::Receiver<bool>) -> Self {
        Self { frames, closed }
    }

    /// Receive the next frame, or `None` once the connection has closed.
    ///
    /// Frames that arrived before the close signal are still delivered, in
    /// order, before the sequence ends.
    pub async fn recv(&mut self) -> Option<Bytes> {
        // ---
        tokio::select! {
            biased;
            frame = self.frames.recv() => frame,
            _ = wait_closed(&mut self.closed) => self.frames.try_recv().ok(),
        }
    }
}

/// Shared state embedded by every endpoint implementation.
///
/// Default [`Connection`] methods delegate here so implementations only
/// provide `send` and `close`.
///
/// ```ignore
/// struct MyConnection {
///     base: ConnectionBase,
///     // ... channel specific fields
/// }
///
/// impl Connection for MyConnection {
///     fn base(&self) -> &ConnectionBase { &self.base }
///     // send / close ...
/// }
/// ```
pub struct ConnectionBase {
    // ---
    connection_id: ConnectionId,
    peer_id: String,
    state: AtomicU8,
    closed: Arc<watch::Sender<bool>>,
    inbox: Mutex<Option<Inbox>>,
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ConnectionBase {
    /// Create the base for a new endpoint in the `Connecting` state.
    ///
    /// `closed` is the close signal for this endpoint. Two endpoints may share
    /// one signal when closing either side ends both (the memory pair).
    pub fn new(
        peer_id: impl Into<String>,
        frames: mpsc::Receiver<Bytes>,
        closed: Arc<watch::Sender<bool>>,
    ) -> Self {
        // ---
        let inbox = Inbox::new(frames, closed.subscribe());

        Self {
            connection_id: ConnectionId::generate(),
            peer_id: peer_id.into(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            closed,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    /// Identity of this endpoint.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Identity of the remote end, as known locally.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        // ---
        if *self.closed.borrow() {
            return ConnectionState::Closed;
        }
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Connecting -> Open`. Has no effect in any other state.
    pub fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// `Open -> Closing`. Has no effect in any other state.
    pub fn mark_closing(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Enter `Closed` and wake everything waiting on the close signal.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn mark_closed(&self) -> bool {
        // ---
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        !self.closed.send_replace(true)
    }

    /// Fail with [`RpcError::ConnectionClosed`] unless the endpoint is `Open`.
    pub fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            _ => Err(RpcError::ConnectionClosed),
        }
    }

    /// Hand out the received-frame sequence. Succeeds once per endpoint.
    pub fn take_inbox(&self) -> Result<Inbox> {
        lock_ignore_poison(&self.inbox)
            .take()
            .ok_or_else(|| RpcError::Transport("receive() already taken for this connection".into()))
    }

    /// A fresh subscription to this endpoint's close signal.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// A connection endpoint.
///
/// Implementations must ensure that:
/// - `send()` fails with [`RpcError::ConnectionClosed`] unless the endpoint is
///   `Open`.
/// - frames are delivered to the [`Inbox`] in the order the remote sent them.
/// - the inbox ends once the channel is closed from either side.
///
/// The in-memory pair serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    // ---
    /// Shared base state. Each implementation returns `&self.base`.
    fn base(&self) -> &ConnectionBase;

    /// Identity of this endpoint.
    fn connection_id(&self) -> ConnectionId {
        self.base().connection_id()
    }

    /// Identity of the remote end.
    fn peer_id(&self) -> &str {
        self.base().peer_id()
    }

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState {
        self.base().state()
    }

    /// The received-frame sequence. Only the first call succeeds.
    fn receive(&self) -> Result<Inbox> {
        self.base().take_inbox()
    }

    /// Send one binary frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Close the channel gracefully. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn Connection>;
