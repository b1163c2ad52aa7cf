// src/peer/mod.rs
//! Peer handle: one connection, its pending-request table, and its read loop.
//!
//! # Architecture
//!
//! [`Peer::start`] takes the connection's inbox and spawns the dispatcher
//! task. Each [`request`](Peer::request) allocates a correlation id from a
//! per-connection counter, registers a oneshot waiter in the pending table,
//! sends a request envelope and suspends until the dispatcher resolves the
//! waiter, the deadline passes, or the connection dies.
//!
//! The same type backs both the outward client and the server's per-connection
//! handle; the roles only differ in how the connection was obtained.
//!
//! # Concurrency
//!
//! Any number of requests can be in flight at once. The pending table is a
//! mutex-protected map touched only for insert/remove, so the read loop is
//! never blocked behind a waiting caller.

mod dispatcher;
mod pending;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::domain::wait_closed;
use crate::{
    // ---
    log_debug,
    ConnectionId,
    ConnectionPtr,
    CorrelationId,
    CorrelationIdGenerator,
    Envelope,
    HandlerPtr,
    Result,
    RpcError,
};

use dispatcher::Dispatcher;
use pending::{PendingRequests, Waiter};

/// Running peer handle.
///
/// Cheap to clone (internally `Arc`-backed). Dropping the last clone closes
/// the connection and stops the read loop.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    connection: ConnectionPtr,
    pending: Arc<PendingRequests>,
    ids: CorrelationIdGenerator,
    request_timeout: Duration,
    finished: watch::Receiver<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // ---
        self.connection.base().mark_closed();

        let dispatcher = match self.dispatcher.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = dispatcher {
            task.abort();
        }
        // An aborted dispatcher never reaches fail_all; waiters must not hang.
        self.pending.fail_all(RpcError::ConnectionClosed);
    }
}

impl Peer {
    // ---
    /// Take over `connection` and start its read loop.
    ///
    /// `handler` answers requests initiated by the remote side; without one,
    /// such requests are answered with an error envelope. `request_timeout`
    /// is the deadline used by [`request`](Self::request).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] if the connection's inbox was already
    /// taken by another reader.
    pub fn start(
        connection: ConnectionPtr,
        handler: Option<HandlerPtr>,
        request_timeout: Duration,
    ) -> Result<Self> {
        // ---
        let inbox = connection.receive()?;
        let pending = Arc::new(PendingRequests::new());
        let (finished_tx, finished_rx) = watch::channel(false);

        let dispatcher = Dispatcher {
            connection: connection.clone(),
            pending: pending.clone(),
            handler,
            finished: finished_tx,
        };
        let task = tokio::spawn(dispatcher.run(inbox));

        log_debug!(
            "{}: peer started (remote {})",
            connection.connection_id(),
            connection.peer_id()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                connection,
                pending,
                ids: CorrelationIdGenerator::new(),
                request_timeout,
                finished: finished_rx,
                dispatcher: Mutex::new(Some(task)),
            }),
        })
    }

    /// Send a request using the peer's default timeout.
    ///
    /// # Errors
    ///
    /// See [`request_with_timeout`](Self::request_with_timeout).
    pub async fn request(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.request_with_timeout(payload, self.inner.request_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for the matching response.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] if no response arrived in time. A response
    ///   arriving later is discarded.
    /// - [`RpcError::ConnectionClosed`] if the connection was already closed
    ///   or died while waiting.
    /// - [`RpcError::Remote`] if the remote handler failed.
    pub async fn request_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        // ---
        let inner = &self.inner;
        let deadline = time::Instant::now() + timeout;
        let id = inner.ids.next_id();

        // Register before sending: the response may beat us back.
        let mut waiter = inner.pending.register(id)?;

        // The deadline covers the send too; a peer that stops reading must not
        // stall the caller past it.
        let frame = Envelope::request(id, payload.into()).encode();
        match time::timeout_at(deadline, inner.connection.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                inner.pending.remove(id);
                return Err(err);
            }
            Err(_elapsed) => return self.give_up(id, &mut waiter),
        }

        match time::timeout_at(deadline, &mut waiter).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_elapsed) => self.give_up(id, &mut waiter),
        }
    }

    /// Fail `id` with `Timeout` unless a resolution already won the race, in
    /// which case `fail()` is a no-op and the resolution sits in the waiter.
    fn give_up(&self, id: CorrelationId, waiter: &mut Waiter) -> Result<Bytes> {
        // ---
        self.inner.pending.fail(id, RpcError::Timeout);
        match waiter.try_recv() {
            Ok(resolution) => resolution,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Typed convenience over [`request`](Self::request): the request is
    /// serialized to JSON and the response deserialized from JSON.
    ///
    /// # Errors
    ///
    /// Everything `request` returns, plus [`RpcError::Serialization`].
    pub async fn call<TReq, TResp>(&self, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let bytes = serde_json::to_vec(req)?;
        let response = self.request(bytes).await?;
        Ok(serde_json::from_slice(&response)?)
    }

    /// Close the connection. Pending requests fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<()> {
        // ---
        self.inner.connection.close().await?;
        self.closed().await;
        Ok(())
    }

    /// Wait until the read loop has stopped and every pending request has
    /// been failed.
    pub async fn closed(&self) {
        let mut finished = self.inner.finished.clone();
        wait_closed(&mut finished).await;
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.connection.base().ensure_open().is_err()
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    /// Identity of the remote end.
    pub fn peer_id(&self) -> &str {
        self.inner.connection.peer_id()
    }

    /// Identity of the underlying connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection.connection_id()
    }

    /// Default deadline used by [`request`](Self::request).
    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.peer_id())
            .field("connection_id", &self.connection_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{handler_fn, memory_pair};

    fn answer() -> HandlerPtr {
        handler_fn(|payload: Bytes| async move {
            let mut out = payload.to_vec();
            out.extend_from_slice(b"/answer");
            Ok(Bytes::from(out))
        })
    }

    #[tokio::test]
    async fn test_request_round_trip_both_directions() {
        // ---
        let (a, b) = memory_pair("b", "a");
        let left = Peer::start(a, Some(answer()), Duration::from_secs(5)).unwrap();
        let right = Peer::start(b, Some(answer()), Duration::from_secs(5)).unwrap();

        assert_eq!(left.request("ping").await.unwrap(), Bytes::from("ping/answer"));
        assert_eq!(right.request("pong").await.unwrap(), Bytes::from("pong/answer"));
        assert_eq!(left.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_on_same_connection_fails() {
        // ---
        let (a, _b) = memory_pair("b", "a");
        let _first = Peer::start(a.clone(), None, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            Peer::start(a, None, Duration::from_secs(1)),
            Err(RpcError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_handler_replies_with_error() {
        // ---
        let (a, b) = memory_pair("b", "a");
        let left = Peer::start(a, None, Duration::from_secs(5)).unwrap();
        let _right = Peer::start(b, None, Duration::from_secs(5)).unwrap();

        let err = left.request("anyone?").await.unwrap_err();
        assert_eq!(err, RpcError::Remote("no request handler installed".into()));
    }

    #[tokio::test]
    async fn test_typed_call() {
        // ---
        let (a, b) = memory_pair("b", "a");
        let doubler = handler_fn(|payload: Bytes| async move {
            let n: u32 = serde_json::from_slice(&payload)?;
            Ok::<_, RpcError>(Bytes::from(serde_json::to_vec(&(n * 2))?))
        });
        let left = Peer::start(a, None, Duration::from_secs(5)).unwrap();
        let _right = Peer::start(b, Some(doubler), Duration::from_secs(5)).unwrap();

        let doubled: u32 = left.call(&21u32).await.unwrap();
        assert_eq!(doubled, 42);
    }

    #[tokio::test]
    async fn test_close_fails_later_requests() {
        // ---
        let (a, b) = memory_pair("b", "a");
        let left = Peer::start(a, None, Duration::from_secs(5)).unwrap();
        let right = Peer::start(b, Some(answer()), Duration::from_secs(5)).unwrap();

        right.close().await.unwrap();
        left.closed().await;

        assert!(left.is_closed());
        assert_eq!(left.request("x").await.unwrap_err(), RpcError::ConnectionClosed);
    }
}
