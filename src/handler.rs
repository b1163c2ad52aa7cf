//! Incoming-request handlers.
//!
//! A handler is the one capability a peer needs from the application: turn
//! the payload of an incoming request into the payload of its response,
//! possibly asynchronously. Handlers are shared across every request on a
//! connection and invoked concurrently, each call in its own task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::Result;

/// Boxed, sendable future returned by [`RequestHandler::call`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Answers requests initiated by the remote peer.
///
/// Returning `Err` makes the peer reply with an error envelope; the remote
/// caller then sees [`RpcError::Remote`](crate::RpcError::Remote).
pub trait RequestHandler: Send + Sync {
    /// Compute the response payload for one request payload.
    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

/// Shared handler pointer.
pub type HandlerPtr = Arc<dyn RequestHandler>;

struct FnHandler<F> {
    func: F,
}

impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        Box::pin((self.func)(payload))
    }
}

/// Wrap an async closure as a [`HandlerPtr`].
///
/// ```
/// use bytes::Bytes;
/// use duplex_rpc::handler_fn;
///
/// let answer = handler_fn(|payload: Bytes| async move {
///     let mut out = payload.to_vec();
///     out.extend_from_slice(b"/answer");
///     Ok(Bytes::from(out))
/// });
/// ```
pub fn handler_fn<F, Fut>(func: F) -> HandlerPtr
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    Arc::new(FnHandler { func })
}
