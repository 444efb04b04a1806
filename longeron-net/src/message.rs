//! Message payload and wire boundary.
//!
//! A [`Message`] is an opaque refcounted payload. On the wire it is a
//! 4-byte little-endian length prefix followed by the payload — just enough
//! session framing for a consistent socket to delimit whole messages; what
//! the payload means is the caller's business.

use bytes::Bytes;

use longeron_core::buffer::SequenceBuffer;

/// Length-prefix size in bytes.
pub const HEADER_LEN: usize = 4;

/// An opaque message exchanged through a consistent socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    /// Create a message from any type convertible to [`Bytes`].
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Append the framed form to `buf`.
    pub fn encode_into(&self, buf: &mut SequenceBuffer) {
        let header = (self.payload.len() as u32).to_le_bytes();
        buf.append(&header);
        buf.append(&self.payload);
    }

    /// Boundary predicate for `async_recv_until`: the total framed length
    /// once a whole message is buffered.
    #[must_use]
    pub fn read_boundary(buf: &SequenceBuffer) -> Option<usize> {
        let head = buf.read_head();
        if head.len() < HEADER_LEN {
            return None;
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&head[..HEADER_LEN]);
        let total = HEADER_LEN + u32::from_le_bytes(header) as usize;
        (head.len() >= total).then_some(total)
    }

    /// Decode one framed message from the front of `buf`, consuming it.
    ///
    /// Returns `None` when no whole frame is buffered.
    #[must_use]
    pub fn decode_from(buf: &mut SequenceBuffer) -> Option<Self> {
        let total = Self::read_boundary(buf)?;
        let payload = Bytes::copy_from_slice(&buf.read_head()[HEADER_LEN..total]);
        buf.consume(total);
        Some(Self { payload })
    }
}

impl From<Bytes> for Message {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl From<&[u8]> for Message {
    fn from(payload: &[u8]) -> Self {
        Self {
            payload: Bytes::copy_from_slice(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_waits_for_whole_frame() {
        let mut buf = SequenceBuffer::new();
        assert_eq!(Message::read_boundary(&buf), None);

        Message::new(&b"hello"[..]).encode_into(&mut buf);
        assert_eq!(Message::read_boundary(&buf), Some(HEADER_LEN + 5));

        // A truncated second frame does not move the boundary.
        buf.append(&3u32.to_le_bytes());
        buf.append(b"ab");
        assert_eq!(Message::read_boundary(&buf), Some(HEADER_LEN + 5));
    }

    #[test]
    fn decode_consumes_one_frame_at_a_time() {
        let mut buf = SequenceBuffer::new();
        Message::new(&b"first"[..]).encode_into(&mut buf);
        Message::new(&b"second"[..]).encode_into(&mut buf);

        let first = Message::decode_from(&mut buf).unwrap();
        assert_eq!(first.payload(), b"first");
        let second = Message::decode_from(&mut buf).unwrap();
        assert_eq!(second.payload(), b"second");
        assert_eq!(Message::decode_from(&mut buf), None);
    }

    #[test]
    fn empty_payload_round_trips() {
        let mut buf = SequenceBuffer::new();
        Message::default().encode_into(&mut buf);
        let decoded = Message::decode_from(&mut buf).unwrap();
        assert!(decoded.is_empty());
    }
}
