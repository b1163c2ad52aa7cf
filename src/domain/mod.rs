//! Domain layer public interface.
//!
//! Abstractions here are independent of any concrete socket library. All
//! consumers import symbols via this module, not by referencing individual
//! files directly.

mod connection;

// --- Connection domain re-exports ---

pub(crate) use connection::wait_closed;

pub use connection::{
    //
    Connection,
    ConnectionBase,
    ConnectionPtr,
    ConnectionState,
    Inbox,
};
