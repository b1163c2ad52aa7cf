use thiserror::Error;

use crate::{CorrelationId, DecodeError};

/// Errors that can occur while establishing or using an RPC connection.
///
/// `RpcError` is `Clone` so a single connection-level failure can be fanned
/// out to every request waiting on that connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The handshake was rejected or the upgrade could not be performed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The duplex channel ended before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No matching response arrived within the request deadline.
    #[error("request timed out")]
    Timeout,

    /// A received frame could not be decoded.
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),

    /// The remote peer's request handler failed and replied with an error envelope.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// Underlying socket or protocol failure on an established connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failed in the typed helpers.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A request with this correlation id is already pending on the connection.
    #[error("correlation id {0} is already pending")]
    DuplicateRequest(CorrelationId),

    /// No connected peer is registered under the given id.
    #[error("no connected peer with id: {0}")]
    UnknownPeer(String),

    /// A required configuration value was not supplied.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// A configuration value was supplied but is not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RpcError {
    /// Whether a fresh connection attempt may succeed where this one failed.
    ///
    /// Only reachability failures qualify. Authentication rejections and
    /// protocol errors will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Handshake(HandshakeError::Unreachable(_)))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

/// Reasons a connection attempt never became a usable duplex channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// A required handshake header was absent or not valid text.
    #[error("missing handshake field: {0}")]
    MissingField(&'static str),

    /// The presented peer id is not in the credential registry.
    #[error("unknown peer id: {0}")]
    UnknownPeer(String),

    /// The presented token does not match the one registered for the peer id.
    #[error("token mismatch for peer id: {0}")]
    TokenMismatch(String),

    /// No route is registered for the requested path.
    #[error("no route for path: {0}")]
    NoRoute(String),

    /// The server refused the upgrade with the given HTTP status.
    #[error("upgrade rejected with status {status}")]
    Rejected {
        /// HTTP status code returned by the server.
        status: u16,
    },

    /// The remote endpoint could not be reached at all.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// Any other upgrade failure (bad url, protocol violation).
    #[error("upgrade failed: {0}")]
    Upgrade(String),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_only_unreachable_is_retryable() {
        // ---
        assert!(RpcError::from(HandshakeError::Unreachable("refused".into())).is_retryable());
        assert!(!RpcError::from(HandshakeError::Rejected { status: 401 }).is_retryable());
        assert!(!RpcError::ConnectionClosed.is_retryable());
        assert!(!RpcError::Timeout.is_retryable());
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        // ---
        let err = serde_json::from_slice::<u32>(b"not json").unwrap_err();
        assert!(matches!(RpcError::from(err), RpcError::Serialization(_)));
    }
}
