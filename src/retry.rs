//! Reconnect policy and exponential backoff.
//!
//! This module provides the [`ReconnectPolicy`] type and the
//! [`retry_with_backoff`] helper used by [`RpcClient`](crate::RpcClient) to
//! re-establish a dropped connection.
//!
//! # Retry Strategy
//!
//! - Only retries errors for which [`RpcError::is_retryable`] holds
//!   (the peer could not be reached). Authentication rejections fail at once.
//! - Uses exponential backoff with randomized jitter.
//! - Caps delay at `max_delay`.
//! - Only ever wraps connection establishment, never an individual request.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use tokio::time::sleep;

use crate::{log_debug, Result};

/// Reconnect policy with exponential backoff.
///
/// Configure through [`RpcClientBuilder`](crate::RpcClientBuilder)'s
/// `reconnect_*` setters or [`ClientConfig::with_reconnect`](crate::ClientConfig::with_reconnect).
///
/// # Example
///
/// ```
/// use duplex_rpc::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy {
///     max_attempts: 5,
///     multiplier: 2.0,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// If `policy` is `None`, the operation executes exactly once. Otherwise
/// retryable failures are retried up to `max_attempts` times:
///
/// - First retry: `initial_delay` (with jitter)
/// - Subsequent retries: `min(current_delay * multiplier, max_delay)` (with jitter)
/// - Jitter: ±25%
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    policy: Option<&ReconnectPolicy>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = match policy {
        Some(policy) => policy,
        None => return operation().await,
    };

    let mut attempt = 0;
    let mut current_delay = policy.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() => {
                attempt += 1;

                if attempt > policy.max_attempts {
                    log_debug!(
                        "reconnect exhausted after {} attempts, last error: {}",
                        policy.max_attempts,
                        err
                    );
                    return Err(err);
                }

                let jittered_delay = apply_jitter(current_delay);

                log_debug!(
                    "reconnect attempt {}/{}, waiting {:?} (error: {})",
                    attempt,
                    policy.max_attempts,
                    jittered_delay,
                    err
                );

                sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(current_delay.as_secs_f64() * policy.multiplier as f64);
                current_delay = next_delay.min(policy.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Apply ±25% jitter: `delay * (0.75 + random(0.0..0.5))`.
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let hash = RandomState::new().hash_one(std::time::SystemTime::now());
    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
