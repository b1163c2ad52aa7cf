//! WebSocket connection endpoint using `tokio-tungstenite`.
//!
//! ## Concurrency model
//!
//! The socket is split into its sink and stream halves, each owned by one
//! background **actor task**:
//!
//! - the writer actor owns the sink and serializes every outbound frame and
//!   the final close frame; callers talk to it through a command channel and
//!   get an acknowledgement back, so `send()` reports real write failures.
//! - the reader actor owns the stream and forwards binary frames to the
//!   endpoint's inbox.
//!
//! No other task touches the socket. Either actor ending (socket error, close
//! frame, explicit close, endpoint dropped) raises the endpoint's close
//! signal, which in turn stops the other actor.
//!
//! ## Frame semantics
//!
//! - Binary frames are the only frames delivered to the inbox.
//! - Text frames are not part of the protocol and are dropped with a warning.
//! - Ping/pong is answered by tungstenite itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::domain::wait_closed;
use crate::{
    // ---
    log_debug,
    log_trace,
    log_warn,
    Connection,
    ConnectionBase,
    ConnectionPtr,
    HandshakeError,
    Result,
    RpcError,
};

/// Handshake header carrying the connecting peer's id.
pub const PEER_ID_HEADER: &str = "x-peer-id";

/// Handshake header carrying the connecting peer's token.
pub const TOKEN_HEADER: &str = "x-token";

/// Inbound frames buffered before the reader actor waits for the dispatcher.
const INBOX_CAPACITY: usize = 256;

/// Outbound commands buffered before `send()` waits for the writer actor.
const OUTBOX_CAPACITY: usize = 256;

/// How long `close()` waits for the close frame to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

enum Outbound {
    Frame(Bytes, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// WebSocket-backed endpoint.
struct WebSocketConnection {
    // ---
    base: ConnectionBase,
    outbox: mpsc::Sender<Outbound>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket and start its reader and writer actors.
    fn start<S>(ws: WebSocketStream<S>, peer_id: String) -> ConnectionPtr
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // ---
        let (frames_tx, frames_rx) = mpsc::channel(INBOX_CAPACITY);
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let base = ConnectionBase::new(peer_id, frames_rx, closed.clone());
        let connection_id = base.connection_id().to_string();

        let (sink, stream) = ws.split();

        let writer = tokio::spawn(writer_actor(
            sink,
            outbox_rx,
            closed.clone(),
            connection_id.clone(),
        ));
        let reader = tokio::spawn(reader_actor(stream, frames_tx, closed, connection_id));

        base.mark_open();

        log_debug!(
            "{}: websocket connection open (peer {})",
            base.connection_id(),
            base.peer_id()
        );

        Arc::new(Self {
            base,
            outbox: outbox_tx,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    fn abort_tasks(&self) {
        // ---
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn command(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Outbound) -> Result<()> {
        // ---
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbox
            .send(make(ack_tx))
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;
        ack_rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }
}

#[async_trait::async_trait]
impl Connection for WebSocketConnection {
    // ---
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        // ---
        self.base.ensure_open()?;
        self.command(|ack| Outbound::Frame(frame, ack)).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.base.ensure_open().is_err() {
            self.base.mark_closed();
            return Ok(());
        }

        self.base.mark_closing();

        // The writer may already be gone if the socket failed underneath us,
        // or be stuck behind a peer that stopped reading.
        if time::timeout(CLOSE_TIMEOUT, self.command(Outbound::Close))
            .await
            .is_err()
        {
            log_debug!(
                "{}: close handshake timed out, dropping socket",
                self.base.connection_id()
            );
            self.abort_tasks();
        }

        if self.base.mark_closed() {
            log_debug!("{}: websocket connection closed", self.base.connection_id());
        }
        Ok(())
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        // ---
        self.base.mark_closed();
        self.abort_tasks();
    }
}

async fn writer_actor<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbox: mpsc::Receiver<Outbound>,
    closed: Arc<watch::Sender<bool>>,
    connection_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    let mut close_signal = closed.subscribe();

    loop {
        let command = tokio::select! {
            command = outbox.recv() => command,
            _ = wait_closed(&mut close_signal) => None,
        };

        match command {
            Some(Outbound::Frame(frame, ack)) => {
                log_trace!("{connection_id}: websocket send {} bytes", frame.len());

                let result = sink
                    .send(Message::Binary(frame))
                    .await
                    .map_err(|err| RpcError::Transport(err.to_string()));
                let failed = result.is_err();
                let _ = ack.send(result);

                if failed {
                    log_debug!("{connection_id}: websocket write failed, stopping writer");
                    break;
                }
            }
            Some(Outbound::Close(ack)) => {
                // A peer that vanished may refuse the close frame; either way we are done.
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                let _ = ack.send(Ok(()));
                break;
            }
            None => {
                let _ = sink.close().await;
                break;
            }
        }
    }

    closed.send_replace(true);
}

async fn reader_actor<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    frames: mpsc::Sender<Bytes>,
    closed: Arc<watch::Sender<bool>>,
    connection_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    let mut close_signal = closed.subscribe();

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = wait_closed(&mut close_signal) => None,
        };

        match message {
            Some(Ok(Message::Binary(data))) => {
                log_trace!("{connection_id}: websocket received {} bytes", data.len());
                if frames.send(data).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Text(_))) => {
                log_warn!("{connection_id}: dropping text frame, only binary frames are supported");
            }
            Some(Ok(Message::Close(_))) => {
                log_debug!("{connection_id}: remote sent close frame");
                break;
            }
            Some(Ok(_)) => {
                // Ping, pong and raw frames are handled by tungstenite.
            }
            Some(Err(_err)) => {
                log_debug!("{connection_id}: websocket read error: {_err}");
                break;
            }
            None => break,
        }
    }

    closed.send_replace(true);
}

/// Wrap a socket the server side has already upgraded.
pub(crate) fn accepted_connection(
    ws: WebSocketStream<TcpStream>,
    peer_id: String,
) -> ConnectionPtr {
    WebSocketConnection::start(ws, peer_id)
}

/// Open a WebSocket connection to `url`, presenting `peer_id` and `token` in
/// the handshake headers.
///
/// # Errors
///
/// - [`HandshakeError::Rejected`] if the server refused the upgrade (for
///   example `401` from the authentication gate, `404` for an unknown path).
/// - [`HandshakeError::Unreachable`] if the server could not be reached.
/// - [`HandshakeError::Upgrade`] for a bad url or any other protocol failure.
pub async fn connect_websocket(url: &str, peer_id: &str, token: &str) -> Result<ConnectionPtr> {
    // ---
    let mut request = url
        .into_client_request()
        .map_err(|err| HandshakeError::Upgrade(err.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(PEER_ID_HEADER, header_value(peer_id, PEER_ID_HEADER)?);
    headers.insert(TOKEN_HEADER, header_value(token, TOKEN_HEADER)?);

    let remote = request.uri().host().unwrap_or("server").to_string();

    log_debug!("{peer_id}: connecting to {url}");

    let (ws, _response): (WebSocketStream<MaybeTlsStream<TcpStream>>, _) =
        tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;

    Ok(WebSocketConnection::start(ws, remote))
}

fn header_value(value: &str, field: &'static str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| RpcError::Handshake(HandshakeError::MissingField(field)))
}

fn handshake_error(err: tungstenite::Error) -> RpcError {
    // ---
    let err = match err {
        tungstenite::Error::Http(response) => HandshakeError::Rejected {
            status: response.status().as_u16(),
        },
        tungstenite::Error::Io(io) => HandshakeError::Unreachable(io.to_string()),
        other => HandshakeError::Upgrade(other.to_string()),
    };
    RpcError::Handshake(err)
}
