//! RPC client builder.
//!
//! Fluent configuration for [`RpcClient`] with reconnect and timeout
//! settings.

use std::time::Duration;

use crate::{
    // ---
    ClientConfig,
    HandlerPtr,
    ReconnectPolicy,
    Result,
    RpcClient,
    RpcError,
    DEFAULT_REQUEST_TIMEOUT,
};

/// Builder for [`RpcClient`].
///
/// # Examples
///
/// ## Client with on-demand reconnect
/// ```no_run
/// use duplex_rpc::RpcClientBuilder;
/// use std::time::Duration;
///
/// # async fn example() -> duplex_rpc::Result<()> {
/// let client = RpcClientBuilder::new()
///     .url("ws://127.0.0.1:9000/rpc")
///     .peer_id("sensor-1")
///     .token("s3cret")
///     .reconnect_max_attempts(10)
///     .reconnect_initial_delay(Duration::from_millis(200))
///     .request_timeout(Duration::from_secs(5))
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RpcClientBuilder {
    // ---
    url: Option<String>,
    peer_id: Option<String>,
    token: Option<String>,
    handler: Option<HandlerPtr>,

    // Reconnect configuration (all optional)
    reconnect_max_attempts: Option<u32>,
    reconnect_multiplier: Option<f32>,
    reconnect_initial_delay: Option<Duration>,
    reconnect_max_delay: Option<Duration>,

    request_timeout: Option<Duration>,
}

impl RpcClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// WebSocket url to connect to. Required.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Identity presented in the handshake. Required.
    pub fn peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// Credential presented in the handshake. Required.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Handler for requests the server sends to this client.
    pub fn handler(mut self, handler: HandlerPtr) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Maximum reconnect retries.
    ///
    /// Default: reconnect disabled.
    pub fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = Some(attempts);
        self
    }

    /// Default: 2.0.
    pub fn reconnect_multiplier(mut self, multiplier: f32) -> Self {
        self.reconnect_multiplier = Some(multiplier);
        self
    }

    /// Default: 100ms.
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = Some(delay);
        self
    }

    /// Default: 5s.
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = Some(delay);
        self
    }

    /// Default: 30s.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Produce the config without connecting.
    ///
    /// # Errors
    ///
    /// [`RpcError::MissingConfig`] for an absent url, peer id or token;
    /// [`RpcError::InvalidConfig`] for a zero timeout.
    pub fn config(&self) -> Result<ClientConfig> {
        // ---
        let url = self
            .url
            .clone()
            .ok_or_else(|| RpcError::MissingConfig("url".into()))?;
        let peer_id = self
            .peer_id
            .clone()
            .ok_or_else(|| RpcError::MissingConfig("peer_id".into()))?;
        let token = self
            .token
            .clone()
            .ok_or_else(|| RpcError::MissingConfig("token".into()))?;

        // Build a policy only if at least one reconnect parameter was set.
        let defaults = ReconnectPolicy::default();
        let reconnect = if self.reconnect_max_attempts.is_some()
            || self.reconnect_multiplier.is_some()
            || self.reconnect_initial_delay.is_some()
            || self.reconnect_max_delay.is_some()
        {
            Some(ReconnectPolicy {
                max_attempts: self.reconnect_max_attempts.unwrap_or(defaults.max_attempts),
                multiplier: self.reconnect_multiplier.unwrap_or(defaults.multiplier),
                initial_delay: self.reconnect_initial_delay.unwrap_or(defaults.initial_delay),
                max_delay: self.reconnect_max_delay.unwrap_or(defaults.max_delay),
            })
        } else {
            None
        };

        let config = ClientConfig {
            url,
            peer_id,
            token,
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            reconnect,
        };
        config.validate()?;
        Ok(config)
    }

    /// Connect (consumes self).
    pub async fn connect(self) -> Result<RpcClient> {
        let config = self.config()?;
        RpcClient::connect(config, self.handler).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn complete() -> RpcClientBuilder {
        RpcClientBuilder::new()
            .url("ws://127.0.0.1:1/rpc")
            .peer_id("me")
            .token("t")
    }

    #[test]
    fn test_missing_fields() {
        // ---
        let err = RpcClientBuilder::new().peer_id("me").token("t").config().unwrap_err();
        assert_eq!(err, RpcError::MissingConfig("url".into()));

        let err = RpcClientBuilder::new().url("ws://x/rpc").token("t").config().unwrap_err();
        assert_eq!(err, RpcError::MissingConfig("peer_id".into()));

        let err = RpcClientBuilder::new().url("ws://x/rpc").peer_id("me").config().unwrap_err();
        assert_eq!(err, RpcError::MissingConfig("token".into()));
    }

    #[test]
    fn test_reconnect_only_when_requested() {
        // ---
        assert!(complete().config().unwrap().reconnect.is_none());

        let config = complete().reconnect_max_attempts(7).config().unwrap();
        let policy = config.reconnect.unwrap();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.initial_delay, ReconnectPolicy::default().initial_delay);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        // ---
        let err = complete().request_timeout(Duration::ZERO).config().unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }
}
