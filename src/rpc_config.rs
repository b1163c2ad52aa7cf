//! Client and server configuration.
//!
//! Plain data with `with_*` setters. Nothing here opens sockets; the client
//! and server interpret these values when they connect or bind.

use std::time::Duration;

use crate::{CredentialRegistry, ReconnectPolicy, Result, RpcError};

/// Default deadline for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outward connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // ---
    /// WebSocket url, e.g. `ws://127.0.0.1:9000/rpc`.
    pub url: String,

    /// Identity presented in the handshake.
    pub peer_id: String,

    /// Credential presented in the handshake.
    pub token: String,

    /// Deadline for [`RpcClient::request`](crate::RpcClient::request).
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// When set, a dead connection is re-established on demand before the
    /// next request, retrying unreachable-peer failures with backoff.
    pub reconnect: Option<ReconnectPolicy>,
}

impl ClientConfig {
    pub fn new(
        url: impl Into<String>,
        peer_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            peer_id: peer_id.into(),
            token: token.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: None,
        }
    }

    /// Set the default request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable on-demand reconnection.
    ///
    /// ```
    /// use duplex_rpc::{ClientConfig, ReconnectPolicy};
    ///
    /// let config = ClientConfig::new("ws://127.0.0.1:9000/rpc", "sensor-1", "s3cret")
    ///     .with_reconnect(ReconnectPolicy::default());
    /// assert!(config.reconnect.is_some());
    /// ```
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Reject values no connection could work with.
    pub(crate) fn validate(&self) -> Result<()> {
        // ---
        if self.url.is_empty() {
            return Err(RpcError::MissingConfig("url".into()));
        }
        if self.peer_id.is_empty() {
            return Err(RpcError::MissingConfig("peer_id".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(RpcError::InvalidConfig("request_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Listening side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9000`. Port `0` picks a free port.
    pub bind_addr: String,

    /// Peers allowed through the authentication gate.
    pub credentials: CredentialRegistry,

    /// Deadline for requests the server sends to its peers.
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            credentials: CredentialRegistry::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Replace the credential registry.
    pub fn with_credentials(mut self, credentials: CredentialRegistry) -> Self {
        self.credentials = credentials;
        self
    }

    /// Register one peer.
    pub fn with_credential(mut self, peer_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.credentials.insert(peer_id, token);
        self
    }

    /// Set the deadline for server-initiated requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Reject values no listener could work with.
    pub(crate) fn validate(&self) -> Result<()> {
        // ---
        if self.bind_addr.is_empty() {
            return Err(RpcError::MissingConfig("bind_addr".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(RpcError::InvalidConfig("request_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
