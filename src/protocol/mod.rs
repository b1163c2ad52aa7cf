//! Wire format for RPC envelopes.
//!
//! Every binary frame on a connection carries exactly one envelope. The
//! payload is opaque at this layer.
mod envelope;

pub use envelope::{DecodeError, Envelope, EnvelopeKind, HEADER_LEN};
