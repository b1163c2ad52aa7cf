//! Echo server example.
//!
//! Answers every request by appending `/answer` to its payload, and every
//! few seconds asks each connected client for its status, showing that the
//! server can initiate requests over the same connections.
//!
//! Run with: cargo run --example echo_server
//!
//! Environment:
//! - `BIND_ADDR` (default `127.0.0.1:9000`)
//! - `CREDENTIALS` path to a JSON object `{"peer-id": "token"}`
//!   (default: a single `demo-client` / `demo-token` entry)

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tracing_subscriber::EnvFilter;

use duplex_rpc::{handler_fn, CredentialRegistry, Route, RpcServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".to_string());
    let credentials = match std::env::var("CREDENTIALS") {
        Ok(path) => CredentialRegistry::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => CredentialRegistry::new().with("demo-client", "demo-token"),
    };

    let config = ServerConfig::new(bind_addr)
        .with_credentials(credentials)
        .with_request_timeout(Duration::from_secs(5));
    let server = RpcServer::new(config);

    let answer = handler_fn(|payload: Bytes| async move {
        // ---
        let mut out = payload.to_vec();
        out.extend_from_slice(b"/answer");
        Ok(Bytes::from(out))
    });

    let handle = server.start(vec![Route::peers("/rpc", Some(answer))]).await?;
    println!("echo_server listening on {}", handle.url("/rpc"));

    // Poll connected clients in the background
    let poller = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                for peer_id in server.peers() {
                    match server.request_to(&peer_id, "status").await {
                        Ok(reply) => println!("{peer_id}: {}", String::from_utf8_lossy(&reply)),
                        Err(err) => println!("{peer_id}: status request failed: {err}"),
                    }
                }
            }
        })
    };

    // Block until Ctrl+C
    tokio::signal::ctrl_c().await.ok();

    poller.abort();
    handle.shutdown().await;
    Ok(())
}
