//! Connection endpoint implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connection` trait, exposed only through constructor functions.
//!
//! Peer code must not depend on implementation-specific types.

mod memory;
mod websocket;

pub use memory::memory_pair;

pub(crate) use websocket::accepted_connection;

pub use websocket::{connect_websocket, PEER_ID_HEADER, TOKEN_HEADER};
