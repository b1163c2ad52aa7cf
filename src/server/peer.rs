use async_trait::async_trait;

use super::route::ConnectionHandler;
use crate::{log_info, log_warn, ConnectionPtr, HandlerPtr, Peer, RpcServer};

/// Connection handler behind [`Route::peers`](crate::Route::peers).
///
/// Starts a peer for the connection, keeps it in the server registry while
/// it is open and removes it once its read loop stops.
pub(super) struct PeerHandler {
    handler: Option<HandlerPtr>,
}

impl PeerHandler {
    pub fn new(handler: Option<HandlerPtr>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ConnectionHandler for PeerHandler {
    async fn handle(&self, server: RpcServer, connection: ConnectionPtr) {
        // ---
        let peer = match Peer::start(connection, self.handler.clone(), server.request_timeout()) {
            Ok(peer) => peer,
            Err(_err) => {
                log_warn!("could not start peer: {_err}");
                return;
            }
        };

        log_info!("peer {} connected ({})", peer.peer_id(), peer.connection_id());
        server.register_peer(peer.clone());

        peer.closed().await;

        server.unregister_peer(&peer);
        log_info!("peer {} disconnected ({})", peer.peer_id(), peer.connection_id());
    }
}
