//! Route table entries.
//!
//! A route binds a request path to a connection handler and an optional
//! pre-accept hook. The hook runs while the upgrade request is still
//! pending, so a rejection never produces an open channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::handshake::server;

use super::peer::PeerHandler;
use crate::{
    // ---
    authenticate,
    ConnectionPtr,
    HandlerPtr,
    HandshakeError,
    RpcServer,
};

/// The HTTP upgrade request as seen by a pre-accept hook.
pub type HandshakeRequest = server::Request;

/// Gate run before the upgrade is accepted. An `Err` rejects with `401`.
pub type PreAcceptHook = Arc<
    dyn Fn(&RpcServer, &HandshakeRequest) -> std::result::Result<(), HandshakeError>
        + Send
        + Sync,
>;

/// Takes ownership of one accepted, authenticated connection.
///
/// `handle` runs in the connection's own task and should return once the
/// connection is finished with.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(&self, server: RpcServer, connection: ConnectionPtr);
}

/// One entry of the server's route table.
#[derive(Clone)]
pub struct Route {
    // ---
    pub(super) path: String,
    pub(super) handler: Arc<dyn ConnectionHandler>,
    pub(super) hook: Option<PreAcceptHook>,
}

impl Route {
    /// Route `path` to a custom connection handler, with no gate.
    pub fn new(path: impl Into<String>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            path: path.into(),
            handler,
            hook: None,
        }
    }

    /// The standard route: authenticate against the server's credential
    /// registry, then run each connection as a registered [`Peer`](crate::Peer)
    /// answering incoming requests with `handler`.
    pub fn peers(path: impl Into<String>, handler: Option<HandlerPtr>) -> Self {
        Self::new(path, Arc::new(PeerHandler::new(handler))).pre_accept_hook(authenticate)
    }

    /// Install a gate for this route, replacing any previous one.
    pub fn pre_accept_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RpcServer, &HandshakeRequest) -> std::result::Result<(), HandshakeError>
            + Send
            + Sync
            + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("gated", &self.hook.is_some())
            .finish()
    }
}
