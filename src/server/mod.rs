//! Accepting side of duplex RPC.
//!
//! [`RpcServer`] binds a listener, upgrades each accepted TCP stream to a
//! WebSocket once its route and gate accept it, and hands the open channel
//! to the route's connection handler in a task of its own. Connections never
//! wait on each other; the peer registry is the only state they share.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use duplex_rpc::{handler_fn, Route, RpcServer, ServerConfig};
//!
//! # async fn example() -> duplex_rpc::Result<()> {
//! let config = ServerConfig::new("127.0.0.1:9000").with_credential("sensor-1", "s3cret");
//! let server = RpcServer::new(config);
//!
//! let echo = handler_fn(|payload: Bytes| async move { Ok(payload) });
//! let handle = server.start(vec![Route::peers("/rpc", Some(echo))]).await?;
//!
//! let sensor = server.wait_for_peer("sensor-1", std::time::Duration::from_secs(30)).await?;
//! let reading = sensor.request("read").await?;
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod peer;
mod route;

pub use route::{ConnectionHandler, HandshakeRequest, PreAcceptHook, Route};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::domain::wait_closed;
use crate::transport::accepted_connection;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    CredentialRegistry,
    Peer,
    Result,
    RpcError,
    ServerConfig,
    PEER_ID_HEADER,
};

/// Peer id recorded for connections on routes whose gate does not require one.
const ANONYMOUS_PEER: &str = "anonymous";

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Duplex RPC server.
///
/// Cheap to clone; clones share the peer registry.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    // ---
    config: ServerConfig,
    peers: Mutex<HashMap<String, Peer>>,
    peers_changed: Notify,
}

impl RpcServer {
    // ---
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                peers: Mutex::new(HashMap::new()),
                peers_changed: Notify::new(),
            }),
        }
    }

    /// Bind `config.bind_addr` and start accepting connections for `routes`.
    ///
    /// Returns once the listener is bound; accepting continues in the
    /// background until [`ServerHandle::shutdown`] is called or the handle
    /// is dropped.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidConfig`] for an empty route table,
    /// [`RpcError::Transport`] if the address cannot be bound.
    pub async fn start(&self, routes: Vec<Route>) -> Result<ServerHandle> {
        // ---
        self.inner.config.validate()?;
        if routes.is_empty() {
            return Err(RpcError::InvalidConfig("at least one route is required".into()));
        }

        let listener = TcpListener::bind(&self.inner.config.bind_addr)
            .await
            .map_err(|err| RpcError::Transport(format!("bind {}: {err}", self.inner.config.bind_addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| RpcError::Transport(err.to_string()))?;

        log_info!("listening on {local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            self.clone(),
            listener,
            Arc::new(routes),
            shutdown_rx,
        ));

        Ok(ServerHandle {
            server: self.clone(),
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// The connected peer registered under `peer_id`.
    pub fn peer(&self, peer_id: &str) -> Option<Peer> {
        lock_ignore_poison(&self.inner.peers).get(peer_id).cloned()
    }

    /// Ids of all connected peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        // ---
        let mut ids: Vec<String> = lock_ignore_poison(&self.inner.peers).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Send a request to one connected peer.
    ///
    /// # Errors
    ///
    /// [`RpcError::UnknownPeer`] if no peer with that id is connected, else
    /// whatever [`Peer::request`] returns.
    pub async fn request_to(&self, peer_id: &str, payload: impl Into<Bytes>) -> Result<Bytes> {
        // ---
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| RpcError::UnknownPeer(peer_id.to_string()))?;
        peer.request(payload).await
    }

    /// Wait until a peer with `peer_id` is connected.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] if it does not connect within `timeout`.
    pub async fn wait_for_peer(&self, peer_id: &str, timeout: Duration) -> Result<Peer> {
        // ---
        let deadline = Instant::now() + timeout;

        loop {
            let changed = self.inner.peers_changed.notified();
            tokio::pin!(changed);
            // Subscribe before checking so a registration in between is not missed.
            changed.as_mut().enable();

            if let Some(peer) = self.peer(peer_id) {
                if !peer.is_closed() {
                    return Ok(peer);
                }
            }

            if time::timeout_at(deadline, changed).await.is_err() {
                return Err(RpcError::Timeout);
            }
        }
    }

    pub fn credentials(&self) -> &CredentialRegistry {
        &self.inner.config.credentials
    }

    /// Deadline for requests sent to peers.
    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }

    /// Register `peer` under its id. A newer connection from the same id
    /// replaces the older one.
    pub(crate) fn register_peer(&self, peer: Peer) {
        // ---
        let previous =
            lock_ignore_poison(&self.inner.peers).insert(peer.peer_id().to_string(), peer);

        if let Some(_previous) = previous {
            log_debug!(
                "peer {} reconnected, replacing {}",
                _previous.peer_id(),
                _previous.connection_id()
            );
        }
        self.inner.peers_changed.notify_waiters();
    }

    /// Remove `peer`, unless its id has since been taken by a newer connection.
    pub(crate) fn unregister_peer(&self, peer: &Peer) {
        // ---
        let mut peers = lock_ignore_poison(&self.inner.peers);
        let is_current = peers
            .get(peer.peer_id())
            .is_some_and(|current| current.connection_id() == peer.connection_id());
        if is_current {
            peers.remove(peer.peer_id());
        }
        drop(peers);

        self.inner.peers_changed.notify_waiters();
    }

    fn drain_peers(&self) -> Vec<Peer> {
        lock_ignore_poison(&self.inner.peers).drain().map(|(_, peer)| peer).collect()
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("bind_addr", &self.inner.config.bind_addr)
            .field("peers", &self.peers())
            .finish()
    }
}

/// Handle to a running accept loop.
///
/// Dropping the handle stops accepting new connections; established ones
/// keep running until closed.
#[derive(Debug)]
pub struct ServerHandle {
    // ---
    server: RpcServer,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound address (useful with port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` url for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.local_addr, path)
    }

    pub fn server(&self) -> &RpcServer {
        &self.server
    }

    /// Stop accepting, close every registered peer and wait for the accept
    /// loop to exit. Requests pending on those peers fail with
    /// `ConnectionClosed`.
    pub async fn shutdown(self) {
        // ---
        self.shutdown.send_replace(true);
        if let Err(_err) = self.task.await {
            log_error!("accept loop ended abnormally: {_err}");
        }

        let peers = self.server.drain_peers();
        let count = peers.len();
        for peer in peers {
            if let Err(_err) = peer.close().await {
                log_debug!("closing peer {} failed: {_err}", peer.peer_id());
            }
        }

        log_info!("server on {} shut down, closed {count} peer(s)", self.local_addr);
    }
}

async fn accept_loop(
    server: RpcServer,
    listener: TcpListener,
    routes: Arc<Vec<Route>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = wait_closed(&mut shutdown) => break,
        };

        match accepted {
            Ok((stream, _remote)) => {
                log_debug!("accepted tcp connection from {_remote}");
                tokio::spawn(serve_connection(server.clone(), stream, routes.clone()));
            }
            Err(_err) => {
                log_error!("accept failed: {_err}");
            }
        }
    }

    log_debug!("accept loop stopped");
}

/// Upgrade one TCP stream and run its route's connection handler.
async fn serve_connection(server: RpcServer, stream: TcpStream, routes: Arc<Vec<Route>>) {
    // ---
    let mut accepted: Option<(usize, String)> = None;

    let callback = |request: &HandshakeRequest, response: Response| {
        let path = request.uri().path();

        let Some(index) = routes.iter().position(|route| route.path == path) else {
            log_warn!("rejecting upgrade: no route for {path}");
            return Err(reject(StatusCode::NOT_FOUND, format!("no route for path: {path}")));
        };

        if let Some(hook) = &routes[index].hook {
            if let Err(err) = hook(&server, request) {
                log_warn!("rejecting upgrade on {path}: {err}");
                return Err(reject(StatusCode::UNAUTHORIZED, err.to_string()));
            }
        }

        let peer_id = request
            .headers()
            .get(PEER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(ANONYMOUS_PEER)
            .to_string();

        accepted = Some((index, peer_id));
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(_err) => {
            log_debug!("websocket upgrade failed: {_err}");
            return;
        }
    };

    let Some((index, peer_id)) = accepted else {
        return;
    };

    let connection = accepted_connection(ws, peer_id);
    routes[index].handler.handle(server, connection).await;
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    // ---
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::memory_pair;

    fn server() -> RpcServer {
        RpcServer::new(ServerConfig::new("127.0.0.1:0"))
    }

    fn peer(remote: &str) -> (Peer, Peer) {
        let (a, b) = memory_pair(remote, "server");
        let ours = Peer::start(a, None, Duration::from_secs(1)).unwrap();
        let theirs = Peer::start(b, None, Duration::from_secs(1)).unwrap();
        (ours, theirs)
    }

    #[tokio::test]
    async fn test_registry_latest_connection_wins() {
        // ---
        let server = server();
        let (first, _r1) = peer("alice");
        let (second, _r2) = peer("alice");

        server.register_peer(first.clone());
        server.register_peer(second.clone());
        assert_eq!(server.peers(), vec!["alice".to_string()]);

        // The stale connection going away must not evict the new one.
        server.unregister_peer(&first);
        assert_eq!(
            server.peer("alice").unwrap().connection_id(),
            second.connection_id()
        );

        server.unregister_peer(&second);
        assert!(server.peer("alice").is_none());
    }

    #[tokio::test]
    async fn test_request_to_unknown_peer() {
        // ---
        let err = server().request_to("nobody", "x").await.unwrap_err();
        assert_eq!(err, RpcError::UnknownPeer("nobody".into()));
    }

    #[tokio::test]
    async fn test_wait_for_peer() {
        // ---
        let server = server();
        let (alice, _remote) = peer("alice");

        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.wait_for_peer("alice", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.register_peer(alice.clone());

        let found = waiter.await.unwrap().unwrap();
        assert_eq!(found.connection_id(), alice.connection_id());

        let err = server
            .wait_for_peer("bob", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Timeout);
    }

    #[tokio::test]
    async fn test_start_requires_routes() {
        // ---
        let err = server().start(Vec::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_zero_request_timeout() {
        // ---
        let server = RpcServer::new(ServerConfig::new("127.0.0.1:0").with_request_timeout(Duration::ZERO));
        let err = server.start(vec![Route::peers("/rpc", None)]).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }
}
