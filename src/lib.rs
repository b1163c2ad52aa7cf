//! Bidirectional RPC over persistent duplex connections.
//!
//! Either side of a long-lived WebSocket connection can issue a request
//! carrying opaque bytes and await the matching response, while at the same
//! time answering requests the other side initiates. Many exchanges may be
//! in flight on one connection; each is matched to its response by a
//! correlation id carried in every frame.
//!
//! # Layers
//!
//! - [`Envelope`]: the wire codec (correlation id, kind tag, payload).
//! - [`Connection`]: one open duplex channel, implemented over WebSocket
//!   ([`connect_websocket`]) and in memory ([`memory_pair`]).
//! - [`Peer`]: the correlation engine for one connection, symmetric for both
//!   roles.
//! - [`RpcClient`] / [`RpcServer`]: outward connection with optional
//!   reconnect, and an authenticated accept loop with a registry of
//!   connected peers.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use duplex_rpc::{handler_fn, ClientConfig, Route, RpcClient, RpcServer, ServerConfig};
//!
//! # async fn example() -> duplex_rpc::Result<()> {
//! let server = RpcServer::new(ServerConfig::new("127.0.0.1:0").with_credential("me", "token"));
//! let answer = handler_fn(|payload: Bytes| async move {
//!     let mut out = payload.to_vec();
//!     out.extend_from_slice(b"/answer");
//!     Ok(Bytes::from(out))
//! });
//! let handle = server.start(vec![Route::peers("/rpc", Some(answer))]).await?;
//!
//! let client = RpcClient::connect(ClientConfig::new(handle.url("/rpc"), "me", "token"), None).await?;
//! assert_eq!(client.request("test0").await?, Bytes::from("test0/answer"));
//! # Ok(())
//! # }
//! ```

mod macros;

// Import all sub modules once...
mod auth;
mod client;
mod correlation;
mod domain;
mod error;
mod handler;
mod peer;
mod protocol;
mod retry;
mod rpc_config;
mod server;
mod transport;

pub(crate) use macros::{
    //
    log_debug,
    log_error,
    log_info,
    log_trace,
    log_warn,
};

// --- public re-exports
pub use auth::{authenticate, CredentialRegistry};
pub use client::{RpcClient, RpcClientBuilder};
pub use correlation::{ConnectionId, CorrelationId, CorrelationIdGenerator};
pub use error::{HandshakeError, Result, RpcError};
pub use handler::{handler_fn, BoxFuture, HandlerPtr, RequestHandler};
pub use peer::Peer;
pub use protocol::{DecodeError, Envelope, EnvelopeKind, HEADER_LEN};
pub use retry::ReconnectPolicy;
pub use rpc_config::{ClientConfig, ServerConfig, DEFAULT_REQUEST_TIMEOUT};
pub use server::{
    //
    ConnectionHandler,
    HandshakeRequest,
    PreAcceptHook,
    Route,
    RpcServer,
    ServerHandle,
};
pub use transport::{connect_websocket, memory_pair, PEER_ID_HEADER, TOKEN_HEADER};

pub use domain::{
    //
    Connection,
    ConnectionBase,
    ConnectionPtr,
    ConnectionState,
    Inbox,
};
