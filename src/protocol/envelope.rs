use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::CorrelationId;

/// Size of the fixed envelope header: 8-byte id followed by a 1-byte kind tag.
pub const HEADER_LEN: usize = 9;

/// What an envelope asks of its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Invoke the receiver's request handler and answer with the same id.
    Request = 0,

    /// Successful answer to a request previously sent on this connection.
    Response = 1,

    /// The receiver's handler failed; the payload is a UTF-8 error message.
    Error = 2,
}

impl EnvelopeKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Reasons a received frame could not be turned into an [`Envelope`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame is shorter than the fixed header.
    #[error("frame of {len} bytes is shorter than the {}-byte header", HEADER_LEN)]
    TooShort {
        /// Length of the offending frame.
        len: usize,
    },

    /// The kind tag is not one this codec knows.
    #[error("unrecognized envelope kind tag {0:#04x}")]
    UnknownKind(u8),
}

/// The unit of exchange over a duplex connection.
///
/// Wire layout: big-endian `u64` correlation id, one kind byte, then the
/// payload to the end of the frame.
///
/// ```
/// use bytes::Bytes;
/// use duplex_rpc::{CorrelationId, Envelope, EnvelopeKind};
///
/// let env = Envelope::request(CorrelationId::new(7), Bytes::from_static(b"ping"));
/// let frame = env.encode();
/// let back = Envelope::decode(frame).unwrap();
/// assert_eq!(back.kind, EnvelopeKind::Request);
/// assert_eq!(back.id.get(), 7);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    // ---
    /// Correlation id shared by a request and its response.
    pub id: CorrelationId,

    /// Request, response or error.
    pub kind: EnvelopeKind,

    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(id: CorrelationId, payload: Bytes) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Request,
            payload,
        }
    }

    /// Create a response envelope answering request `id`.
    pub fn response(id: CorrelationId, payload: Bytes) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Response,
            payload,
        }
    }

    /// Create an error envelope answering request `id`.
    pub fn error(id: CorrelationId, message: impl AsRef<str>) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Error,
            payload: Bytes::copy_from_slice(message.as_ref().as_bytes()),
        }
    }

    /// Encode into a single binary frame.
    pub fn encode(&self) -> Bytes {
        // ---
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u64(self.id.get());
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a binary frame.
    ///
    /// The payload is a zero-copy slice of `frame`.
    pub fn decode(mut frame: Bytes) -> Result<Self, DecodeError> {
        // ---
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::TooShort { len: frame.len() });
        }

        let id = CorrelationId::new(frame.get_u64());
        let tag = frame.get_u8();
        let kind = EnvelopeKind::from_tag(tag).ok_or(DecodeError::UnknownKind(tag))?;

        Ok(Self {
            id,
            kind,
            payload: frame,
        })
    }

    /// Error message carried by an [`EnvelopeKind::Error`] envelope.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_wire_layout() {
        // ---
        let frame = Envelope::response(CorrelationId::new(0x0102), Bytes::from_static(b"ok")).encode();
        assert_eq!(&frame[..], &[0, 0, 0, 0, 0, 0, 0x01, 0x02, 1, b'o', b'k']);
    }

    #[test]
    fn test_empty_payload_is_valid() {
        // ---
        let frame = Envelope::request(CorrelationId::new(3), Bytes::new()).encode();
        assert_eq!(frame.len(), HEADER_LEN);

        let env = Envelope::decode(frame).unwrap();
        assert!(env.payload.is_empty());
        assert_eq!(env.kind, EnvelopeKind::Request);
    }

    #[test]
    fn test_short_frame_rejected() {
        // ---
        let err = Envelope::decode(Bytes::from_static(&[0, 0, 1])).unwrap_err();
        assert_eq!(err, DecodeError::TooShort { len: 3 });
    }

    #[test]
    fn test_unknown_kind_rejected() {
        // ---
        let err = Envelope::decode(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 9, 0x7f])).unwrap_err();
        assert_eq!(err, DecodeError::UnknownKind(0x7f));
    }

    #[test]
    fn test_error_envelope_message() {
        // ---
        let env = Envelope::decode(Envelope::error(CorrelationId::new(1), "boom").encode()).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Error);
        assert_eq!(env.error_message(), "boom");
    }
}
