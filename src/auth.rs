//! Authentication gate.
//!
//! Every connection presents a peer id and a token in its handshake headers
//! ([`PEER_ID_HEADER`], [`TOKEN_HEADER`]). The gate checks the pair against
//! the server's [`CredentialRegistry`] before the upgrade completes; a
//! rejected connection never reaches a peer handle.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{
    // ---
    HandshakeError,
    HandshakeRequest,
    Result,
    RpcServer,
    PEER_ID_HEADER,
    TOKEN_HEADER,
};

/// Expected token per peer id, owned by the server for its lifetime.
///
/// Deserializes from a flat JSON object so deployments can keep it in a file:
///
/// ```
/// use duplex_rpc::CredentialRegistry;
///
/// let registry = CredentialRegistry::from_json(r#"{"sensor-1": "s3cret"}"#).unwrap();
/// assert!(registry.verify("sensor-1", "s3cret").is_ok());
/// assert!(registry.verify("sensor-1", "guess").is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRegistry {
    tokens: HashMap<String, String>,
}

impl CredentialRegistry {
    /// An empty registry; every peer is rejected until tokens are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a registry from a JSON object of `peer-id -> token`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Add or replace the token for `peer_id`.
    pub fn insert(&mut self, peer_id: impl Into<String>, token: impl Into<String>) {
        self.tokens.insert(peer_id.into(), token.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, peer_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.insert(peer_id, token);
        self
    }

    /// Whether `peer_id` has a registered token.
    pub fn contains(&self, peer_id: &str) -> bool {
        self.tokens.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Check a presented `(peer_id, token)` pair.
    ///
    /// The token comparison runs in constant time.
    pub fn verify(&self, peer_id: &str, token: &str) -> std::result::Result<(), HandshakeError> {
        // ---
        let expected = self
            .tokens
            .get(peer_id)
            .ok_or_else(|| HandshakeError::UnknownPeer(peer_id.to_string()))?;

        if bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
            Ok(())
        } else {
            Err(HandshakeError::TokenMismatch(peer_id.to_string()))
        }
    }
}

/// Pre-accept hook that validates the handshake headers against the
/// server's credential registry.
///
/// Installed by [`Route::peers`](crate::Route::peers); usable with
/// [`Route::pre_accept_hook`](crate::Route::pre_accept_hook) for custom routes.
pub fn authenticate(
    server: &RpcServer,
    request: &HandshakeRequest,
) -> std::result::Result<(), HandshakeError> {
    // ---
    let peer_id = header(request, PEER_ID_HEADER)?;
    let token = header(request, TOKEN_HEADER)?;
    server.credentials().verify(peer_id, token)
}

fn header<'r>(
    request: &'r HandshakeRequest,
    name: &'static str,
) -> std::result::Result<&'r str, HandshakeError> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or(HandshakeError::MissingField(name))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::ServerConfig;

    fn registry() -> CredentialRegistry {
        CredentialRegistry::new().with("alice", "a-token").with("bob", "b-token")
    }

    fn handshake(peer_id: Option<&str>, token: Option<&str>) -> HandshakeRequest {
        let mut builder = HandshakeRequest::builder().uri("/rpc");
        if let Some(peer_id) = peer_id {
            builder = builder.header(PEER_ID_HEADER, peer_id);
        }
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_verify() {
        // ---
        let registry = registry();
        assert!(registry.verify("alice", "a-token").is_ok());
        assert_eq!(
            registry.verify("alice", "b-token"),
            Err(HandshakeError::TokenMismatch("alice".into()))
        );
        assert_eq!(
            registry.verify("mallory", "a-token"),
            Err(HandshakeError::UnknownPeer("mallory".into()))
        );
        // Prefix of the real token must not pass.
        assert!(registry.verify("alice", "a-tok").is_err());
    }

    #[test]
    fn test_from_json() {
        // ---
        let registry = CredentialRegistry::from_json(r#"{"alice":"a-token","bob":"b-token"}"#).unwrap();
        assert_eq!(registry, self::registry());
        assert_eq!(registry.len(), 2);

        assert!(matches!(
            CredentialRegistry::from_json("[1, 2]"),
            Err(crate::RpcError::Serialization(_))
        ));
    }

    #[test]
    fn test_authenticate_reads_headers() {
        // ---
        let server = RpcServer::new(ServerConfig::new("127.0.0.1:0").with_credentials(registry()));

        assert!(authenticate(&server, &handshake(Some("bob"), Some("b-token"))).is_ok());
        assert_eq!(
            authenticate(&server, &handshake(Some("bob"), None)),
            Err(HandshakeError::MissingField(TOKEN_HEADER))
        );
        assert_eq!(
            authenticate(&server, &handshake(None, Some("b-token"))),
            Err(HandshakeError::MissingField(PEER_ID_HEADER))
        );
        assert_eq!(
            authenticate(&server, &handshake(Some("carol"), Some("c-token"))),
            Err(HandshakeError::UnknownPeer("carol".into()))
        );
    }
}
