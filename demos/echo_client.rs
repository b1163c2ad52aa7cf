//! Echo client example.
//!
//! Sends three concurrent requests to the echo server, then stays connected
//! answering the server's status requests until Ctrl+C.
//!
//! Run with: cargo run --example echo_client
//!
//! Requires: `cargo run --example echo_server` running.

use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use tracing_subscriber::EnvFilter;

use duplex_rpc::{handler_fn, RpcClientBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let url = std::env::var("SERVER_URL").unwrap_or_else(|_| "ws://127.0.0.1:9000/rpc".to_string());
    let started = Instant::now();

    let status = handler_fn(move |_payload: Bytes| async move {
        // ---
        Ok(Bytes::from(format!("up {}s", started.elapsed().as_secs())))
    });

    let client = RpcClientBuilder::new()
        .url(url)
        .peer_id("demo-client")
        .token("demo-token")
        .handler(status)
        .request_timeout(Duration::from_secs(5))
        .reconnect_max_attempts(5)
        .connect()
        .await?;

    // ---
    // Three requests in flight at once on one connection
    let (r0, r1, r2) = tokio::join!(
        client.request("test0"),
        client.request("test1"),
        client.request("test2"),
    );
    for reply in [r0?, r1?, r2?] {
        println!("{}", String::from_utf8_lossy(&reply));
    }

    println!("connected as demo-client; answering status requests (Ctrl+C to quit)");
    tokio::signal::ctrl_c().await.ok();

    client.close().await?;
    Ok(())
}
