//! Outward-connecting peer.
//!
//! [`RpcClient`] wraps the [`Peer`] for its current connection. A dropped
//! connection is never repaired behind a request that was already in
//! flight: those requests fail with `ConnectionClosed`. The caller then
//! either calls [`reconnect`](RpcClient::reconnect) or, when the client was
//! configured with a [`ReconnectPolicy`](crate::ReconnectPolicy), the next
//! request re-establishes the connection first.

mod builder;

pub use builder::RpcClientBuilder;

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::retry::retry_with_backoff;
use crate::{
    // ---
    connect_websocket,
    log_debug,
    log_info,
    ClientConfig,
    ConnectionId,
    HandlerPtr,
    Peer,
    Result,
};

/// Client side of a duplex RPC connection.
///
/// Cheap to clone; clones share the connection.
///
/// # Example
///
/// ```no_run
/// use duplex_rpc::{ClientConfig, RpcClient};
///
/// # async fn example() -> duplex_rpc::Result<()> {
/// let config = ClientConfig::new("ws://127.0.0.1:9000/rpc", "sensor-1", "s3cret");
/// let client = RpcClient::connect(config, None).await?;
///
/// let reply = client.request("ping").await?;
/// println!("{}", String::from_utf8_lossy(&reply));
///
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    // ---
    config: ClientConfig,
    handler: Option<HandlerPtr>,
    current: RwLock<Peer>,
    // Serializes reconnects so concurrent callers build one connection.
    reconnecting: AsyncMutex<()>,
}

impl ClientInner {
    fn read(&self) -> RwLockReadGuard<'_, Peer> {
        match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Peer> {
        match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl RpcClient {
    // ---
    /// Connect to `config.url` and start the peer.
    ///
    /// `handler` answers requests the server sends to this client.
    ///
    /// # Errors
    ///
    /// - [`RpcError::MissingConfig`](crate::RpcError::MissingConfig) /
    ///   [`RpcError::InvalidConfig`](crate::RpcError::InvalidConfig) for an
    ///   unusable config.
    /// - [`RpcError::Handshake`](crate::RpcError::Handshake) if the server
    ///   is unreachable or rejects the credentials.
    pub async fn connect(config: ClientConfig, handler: Option<HandlerPtr>) -> Result<Self> {
        // ---
        config.validate()?;

        let peer = retry_with_backoff(config.reconnect.as_ref(), || {
            establish(&config, handler.clone())
        })
        .await?;

        log_info!("{}: connected to {}", config.peer_id, config.url);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                handler,
                current: RwLock::new(peer),
                reconnecting: AsyncMutex::new(()),
            }),
        })
    }

    /// Connect, run `f`, then close the connection whatever `f` returned.
    ///
    /// ```no_run
    /// use duplex_rpc::{ClientConfig, RpcClient};
    ///
    /// # async fn example() -> duplex_rpc::Result<()> {
    /// let config = ClientConfig::new("ws://127.0.0.1:9000/rpc", "sensor-1", "s3cret");
    /// let reply = RpcClient::scoped(config, None, |client| async move {
    ///     client.request("ping").await
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn scoped<F, Fut, T>(
        config: ClientConfig,
        handler: Option<HandlerPtr>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(RpcClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // ---
        let client = Self::connect(config, handler).await?;
        let result = f(client.clone()).await;

        if let Err(_err) = client.close().await {
            log_debug!("{}: close after scoped use failed: {_err}", client.inner.config.peer_id);
        }
        result
    }

    /// Send a request using the configured default timeout.
    pub async fn request(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.request_with_timeout(payload, self.inner.config.request_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for the response.
    ///
    /// # Errors
    ///
    /// See [`Peer::request_with_timeout`]. With a reconnect policy, also
    /// the handshake errors of a failed reconnect.
    pub async fn request_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        // ---
        let peer = if self.inner.config.reconnect.is_some() {
            self.live_peer().await?
        } else {
            self.peer()
        };

        peer.request_with_timeout(payload, timeout).await
    }

    /// Typed JSON request; see [`Peer::call`].
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

    /// Replace the current connection with a fresh one.
    ///
    /// Requests still pending on the old connection fail with
    /// `ConnectionClosed`; they are not replayed. Retries unreachable-peer
    /// failures when a reconnect policy is configured.
    pub async fn reconnect(&self) -> Result<()> {
        // ---
        let _guard = self.inner.reconnecting.lock().await;
        self.replace_connection().await.map(|_| ())
    }

    /// Close the current connection.
    pub async fn close(&self) -> Result<()> {
        self.peer().close().await
    }

    /// Whether the current connection is open.
    pub fn is_connected(&self) -> bool {
        !self.peer().is_closed()
    }

    /// The peer handle of the current connection.
    pub fn peer(&self) -> Peer {
        self.inner.read().clone()
    }

    /// Identity of the current connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.peer().connection_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    async fn live_peer(&self) -> Result<Peer> {
        // ---
        let peer = self.peer();
        if !peer.is_closed() {
            return Ok(peer);
        }

        let _guard = self.inner.reconnecting.lock().await;

        // Another caller may have reconnected while we waited.
        let current = self.peer();
        if current.connection_id() != peer.connection_id() && !current.is_closed() {
            return Ok(current);
        }

        self.replace_connection().await
    }

    async fn replace_connection(&self) -> Result<Peer> {
        // ---
        let inner = &self.inner;
        let config = &inner.config;

        let fresh = retry_with_backoff(config.reconnect.as_ref(), || {
            establish(config, inner.handler.clone())
        })
        .await?;

        let old = std::mem::replace(&mut *inner.write(), fresh.clone());

        if let Err(_err) = old.close().await {
            log_debug!("{}: closing replaced connection failed: {_err}", config.peer_id);
        }

        log_info!(
            "{}: reconnected to {} ({} -> {})",
            config.peer_id,
            config.url,
            old.connection_id(),
            fresh.connection_id()
        );

        Ok(fresh)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.inner.config.url)
            .field("peer_id", &self.inner.config.peer_id)
            .field("peer", &self.peer())
            .finish()
    }
}

async fn establish(config: &ClientConfig, handler: Option<HandlerPtr>) -> Result<Peer> {
    // ---
    let connection = connect_websocket(&config.url, &config.peer_id, &config.token).await?;
    Peer::start(connection, handler, config.request_timeout)
}
