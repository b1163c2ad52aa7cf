//! Per-connection read loop.
//!
//! The dispatcher is the only reader of a connection's inbox. For each frame
//! it either resolves a pending request (response and error envelopes) or
//! hands an incoming request to the handler in a task of its own, so a slow
//! handler never holds up the frames behind it.
//!
//! A malformed frame is logged and dropped; one bad frame must not take down
//! unrelated in-flight requests. When the inbox ends the dispatcher marks the
//! connection closed and fails every request still pending on it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::watch;

use super::pending::PendingRequests;
use crate::{
    // ---
    log_debug,
    log_error,
    log_trace,
    log_warn,
    ConnectionPtr,
    CorrelationId,
    Envelope,
    EnvelopeKind,
    HandlerPtr,
    Inbox,
    RpcError,
};

/// Error message sent back when a handler panics instead of returning.
const HANDLER_PANICKED: &str = "request handler panicked";

/// Everything the read loop needs, owned by its task.
pub(super) struct Dispatcher {
    // ---
    pub connection: ConnectionPtr,
    pub pending: Arc<PendingRequests>,
    pub handler: Option<HandlerPtr>,
    pub finished: watch::Sender<bool>,
}

impl Dispatcher {
    /// Drive `inbox` until the connection ends.
    pub async fn run(self, mut inbox: Inbox) {
        // ---
        let connection_id = self.connection.connection_id();

        while let Some(frame) = inbox.recv().await {
            self.dispatch(frame);
        }

        self.connection.base().mark_closed();
        let failed = self.pending.fail_all(RpcError::ConnectionClosed);

        log_debug!(
            "{connection_id}: read loop stopped (peer {}), failed {failed} pending request(s)",
            self.connection.peer_id()
        );

        self.finished.send_replace(true);
    }

    fn dispatch(&self, frame: Bytes) {
        // ---
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(_err) => {
                log_warn!(
                    "{}: dropping malformed frame: {_err}",
                    self.connection.connection_id()
                );
                return;
            }
        };

        log_trace!(
            "{}: received {:?} id={}",
            self.connection.connection_id(),
            envelope.kind,
            envelope.id
        );

        match envelope.kind {
            EnvelopeKind::Response => {
                if !self.pending.complete(envelope.id, envelope.payload) {
                    log_debug!(
                        "{}: discarding response for id {} (not pending)",
                        self.connection.connection_id(),
                        envelope.id
                    );
                }
            }
            EnvelopeKind::Error => {
                let message = envelope.error_message();
                if !self.pending.fail(envelope.id, RpcError::Remote(message)) {
                    log_debug!(
                        "{}: discarding error reply for id {} (not pending)",
                        self.connection.connection_id(),
                        envelope.id
                    );
                }
            }
            EnvelopeKind::Request => self.spawn_handler(envelope.id, envelope.payload),
        }
    }

    fn spawn_handler(&self, id: CorrelationId, payload: Bytes) {
        // ---
        let connection = self.connection.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            let reply = match handler {
                Some(handler) => {
                    let call = AssertUnwindSafe(async move { handler.call(payload).await });
                    match call.catch_unwind().await {
                        Ok(Ok(result)) => Envelope::response(id, result),
                        Ok(Err(err)) => {
                            log_warn!(
                                "{}: request handler failed for id {id}: {err}",
                                connection.connection_id()
                            );
                            let message = match err {
                                RpcError::Remote(message) => message,
                                other => other.to_string(),
                            };
                            Envelope::error(id, message)
                        }
                        Err(_panic) => {
                            log_error!(
                                "{}: request handler panicked for id {id}",
                                connection.connection_id()
                            );
                            Envelope::error(id, HANDLER_PANICKED)
                        }
                    }
                }
                None => Envelope::error(id, "no request handler installed"),
            };

            if let Err(_err) = connection.send(reply.encode()).await {
                log_debug!(
                    "{}: could not send reply for id {id}: {_err}",
                    connection.connection_id()
                );
            }
        });
    }
}
