// tests/peer_memory.rs
//
// Peer behavior over an in-memory connection pair. Where the remote side
// needs to misbehave (late, reordered or malformed frames) it is driven by
// hand through the raw connection instead of a second peer.

mod common;

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use common::{answer, init_logging};
use duplex_rpc::{
    // ---
    handler_fn,
    memory_pair,
    ConnectionPtr,
    CorrelationId,
    Envelope,
    EnvelopeKind,
    Inbox,
    Peer,
    RpcError,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// A peer on one end, the raw connection and its inbox on the other.
fn peer_with_raw_remote() -> (Peer, ConnectionPtr, Inbox) {
    // ---
    let (local, remote) = memory_pair("remote", "local");
    let peer = Peer::start(local, None, TIMEOUT).unwrap();
    let inbox = remote.receive().unwrap();
    (peer, remote, inbox)
}

async fn next_request(inbox: &mut Inbox) -> Envelope {
    // ---
    let frame = timeout(Duration::from_secs(1), inbox.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed");
    let envelope = Envelope::decode(frame).unwrap();
    assert_eq!(envelope.kind, EnvelopeKind::Request);
    envelope
}

fn with_answer(payload: &Bytes) -> Bytes {
    let mut out = payload.to_vec();
    out.extend_from_slice(b"/answer");
    Bytes::from(out)
}

#[tokio::test]
async fn round_trip_including_empty_payload() {
    // ---
    init_logging();

    let (a, b) = memory_pair("server", "client");
    let client = Peer::start(a, None, TIMEOUT).unwrap();
    let _server = Peer::start(b, Some(answer()), TIMEOUT).unwrap();

    assert_eq!(client.request("ping").await.unwrap(), Bytes::from("ping/answer"));
    assert_eq!(client.request(Bytes::new()).await.unwrap(), Bytes::from("/answer"));
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn both_sides_request_at_once() {
    // ---
    init_logging();

    let (a, b) = memory_pair("server", "client");
    let client = Peer::start(a, Some(answer()), TIMEOUT).unwrap();
    let server = Peer::start(b, Some(answer()), TIMEOUT).unwrap();

    let (from_client, from_server) = tokio::join!(client.request("up"), server.request("down"));

    assert_eq!(from_client.unwrap(), Bytes::from("up/answer"));
    assert_eq!(from_server.unwrap(), Bytes::from("down/answer"));
}

#[tokio::test]
async fn responses_out_of_order_are_correlated() {
    // ---
    init_logging();

    let (peer, remote, mut inbox) = peer_with_raw_remote();

    let requests = tokio::spawn({
        let peer = peer.clone();
        async move {
            tokio::join!(
                peer.request("test0"),
                peer.request("test1"),
                peer.request("test2")
            )
        }
    });

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(next_request(&mut inbox).await);
    }

    // Answer in reverse wire order.
    for request in received.iter().rev() {
        let reply = Envelope::response(request.id, with_answer(&request.payload));
        remote.send(reply.encode()).await.unwrap();
    }

    let (r0, r1, r2) = requests.await.unwrap();
    assert_eq!(r0.unwrap(), Bytes::from("test0/answer"));
    assert_eq!(r1.unwrap(), Bytes::from("test1/answer"));
    assert_eq!(r2.unwrap(), Bytes::from("test2/answer"));
}

#[tokio::test]
async fn late_response_is_discarded() {
    // ---
    init_logging();

    let (peer, remote, mut inbox) = peer_with_raw_remote();

    let err = peer
        .request_with_timeout("slow", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout);
    assert_eq!(peer.pending_len(), 0);

    // The answer shows up after the caller gave up.
    let slow = next_request(&mut inbox).await;
    remote
        .send(Envelope::response(slow.id, Bytes::from("too late")).encode())
        .await
        .unwrap();

    // The next request must get its own answer, not the stale one.
    let next = tokio::spawn({
        let peer = peer.clone();
        async move { peer.request("fresh").await }
    });
    let fresh = next_request(&mut inbox).await;
    assert_ne!(fresh.id, slow.id);
    remote
        .send(Envelope::response(fresh.id, with_answer(&fresh.payload)).encode())
        .await
        .unwrap();

    assert_eq!(next.await.unwrap().unwrap(), Bytes::from("fresh/answer"));
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn response_sent_just_before_close_is_delivered() {
    // ---
    init_logging();

    for _ in 0..50 {
        let (peer, remote, mut inbox) = peer_with_raw_remote();

        let pending = tokio::spawn({
            let peer = peer.clone();
            async move { peer.request("last words").await }
        });
        let request = next_request(&mut inbox).await;

        remote
            .send(Envelope::response(request.id, with_answer(&request.payload)).encode())
            .await
            .unwrap();
        remote.close().await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), Bytes::from("last words/answer"));
        timeout(Duration::from_secs(1), peer.closed()).await.unwrap();
    }
}

#[tokio::test]
async fn deadline_covers_a_blocked_send() {
    // ---
    init_logging();

    // The remote holds its inbox but never reads, so the pair's buffer fills
    // and later sends block.
    let (peer, _remote, _inbox) = peer_with_raw_remote();

    let requests = (0..100).map(|i| {
        let peer = peer.clone();
        async move {
            peer.request_with_timeout(format!("r{i}"), Duration::from_millis(50))
                .await
        }
    });
    let results = timeout(Duration::from_secs(2), futures_util::future::join_all(requests))
        .await
        .expect("a request outlived its deadline");

    assert!(results.iter().all(|r| *r == Err(RpcError::Timeout)));
    assert_eq!(peer.pending_len(), 0);
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_connection() {
    // ---
    init_logging();

    let (peer, remote, mut inbox) = peer_with_raw_remote();

    let pending = tokio::spawn({
        let peer = peer.clone();
        async move { peer.request("survive").await }
    });
    let request = next_request(&mut inbox).await;

    // Too short, then an unknown kind tag, then a response for an id nobody asked for.
    remote.send(Bytes::from_static(&[1, 2, 3])).await.unwrap();
    remote
        .send(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 1, 0x7f]))
        .await
        .unwrap();
    remote
        .send(Envelope::response(CorrelationId::new(9999), Bytes::new()).encode())
        .await
        .unwrap();

    remote
        .send(Envelope::response(request.id, with_answer(&request.payload)).encode())
        .await
        .unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), Bytes::from("survive/answer"));
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn close_fails_every_pending_request() {
    // ---
    init_logging();

    let (peer, remote, mut inbox) = peer_with_raw_remote();

    let pending: Vec<_> = (0..3)
        .map(|i| {
            let peer = peer.clone();
            tokio::spawn(async move { peer.request(format!("req{i}")).await })
        })
        .collect();

    for _ in 0..3 {
        next_request(&mut inbox).await;
    }
    assert_eq!(peer.pending_len(), 3);

    remote.close().await.unwrap();

    for handle in pending {
        assert_eq!(handle.await.unwrap().unwrap_err(), RpcError::ConnectionClosed);
    }

    timeout(Duration::from_secs(1), peer.closed()).await.unwrap();
    assert!(peer.is_closed());
    assert_eq!(peer.pending_len(), 0);
    assert_eq!(peer.request("after").await.unwrap_err(), RpcError::ConnectionClosed);
}

#[tokio::test]
async fn remote_error_envelope_fails_only_that_request() {
    // ---
    init_logging();

    let (peer, remote, mut inbox) = peer_with_raw_remote();

    let (first, second) = {
        let (p1, p2) = (peer.clone(), peer.clone());
        (
            tokio::spawn(async move { p1.request("bad").await }),
            tokio::spawn(async move { p2.request("good").await }),
        )
    };

    for _ in 0..2 {
        let request = next_request(&mut inbox).await;
        let reply = if request.payload == Bytes::from("bad") {
            Envelope::error(request.id, "boom")
        } else {
            Envelope::response(request.id, with_answer(&request.payload))
        };
        remote.send(reply.encode()).await.unwrap();
    }

    assert_eq!(first.await.unwrap().unwrap_err(), RpcError::Remote("boom".into()));
    assert_eq!(second.await.unwrap().unwrap(), Bytes::from("good/answer"));
}

#[tokio::test]
async fn handler_failure_is_reported_to_caller() {
    // ---
    init_logging();

    let picky = handler_fn(|payload: Bytes| async move {
        // ---
        match &payload[..] {
            b"known" => Ok(Bytes::from("ok")),
            b"json" => serde_json::from_slice::<u32>(b"not json")
                .map(|n| Bytes::from(n.to_string()))
                .map_err(RpcError::from),
            _ => Err(RpcError::Remote("no such method".into())),
        }
    });

    let (a, b) = memory_pair("server", "client");
    let client = Peer::start(a, None, TIMEOUT).unwrap();
    let _server = Peer::start(b, Some(picky), TIMEOUT).unwrap();

    assert_eq!(client.request("known").await.unwrap(), Bytes::from("ok"));
    assert_eq!(
        client.request("unknown").await.unwrap_err(),
        RpcError::Remote("no such method".into())
    );
    match client.request("json").await.unwrap_err() {
        RpcError::Remote(message) => assert!(message.starts_with("serialization error")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn slow_handler_does_not_block_other_requests() {
    // ---
    init_logging();

    let handler = handler_fn(|payload: Bytes| async move {
        // ---
        if payload == Bytes::from("slow") {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(payload)
    });

    let (a, b) = memory_pair("server", "client");
    let client = Peer::start(a, None, TIMEOUT).unwrap();
    let _server = Peer::start(b, Some(handler), TIMEOUT).unwrap();

    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.request("slow").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast = timeout(Duration::from_millis(200), client.request("fast"))
        .await
        .expect("fast request waited behind the slow handler");
    assert_eq!(fast.unwrap(), Bytes::from("fast"));
    assert!(!slow.is_finished());

    assert_eq!(slow.await.unwrap().unwrap(), Bytes::from("slow"));
}

#[tokio::test]
async fn panicking_handler_is_reported_to_caller() {
    // ---
    init_logging();

    let fragile = handler_fn(|payload: Bytes| async move {
        // ---
        if payload == Bytes::from("explode") {
            panic!("handler gave up");
        }
        Ok(payload)
    });

    let (a, b) = memory_pair("server", "client");
    let client = Peer::start(a, None, TIMEOUT).unwrap();
    let _server = Peer::start(b, Some(fragile), TIMEOUT).unwrap();

    let err = timeout(Duration::from_secs(1), client.request("explode"))
        .await
        .expect("caller was left waiting for its deadline")
        .unwrap_err();
    assert_eq!(err, RpcError::Remote("request handler panicked".into()));

    assert_eq!(client.request("steady").await.unwrap(), Bytes::from("steady"));
}

#[tokio::test]
async fn dropping_last_handle_closes_connection() {
    // ---
    init_logging();

    let (a, b) = memory_pair("server", "client");
    let client = Peer::start(a, None, TIMEOUT).unwrap();
    let server = Peer::start(b, Some(answer()), TIMEOUT).unwrap();

    drop(client);

    timeout(Duration::from_secs(1), server.closed()).await.unwrap();
    assert!(server.is_closed());
}
