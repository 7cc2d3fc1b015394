use crate::frame::parse_frame;
use bytes::{Bytes, BytesMut};
use cnp_core::Result;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Read accumulator for one inbound stream.
pub struct ConnectionBuffer {
    buffer: BytesMut,
}

impl ConnectionBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn consume(&mut self, len: usize) {
        if len >= self.buffer.len() {
            self.buffer.clear();
        } else {
            let _ = self.buffer.split_to(len);
        }
    }

    /// Pop the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        match parse_frame(&self.buffer)? {
            Some((payload, used)) => {
                self.consume(used);
                Ok(Some(payload))
            },
            None => Ok(None),
        }
    }

    /// Shrink an oversized buffer once a burst has drained.
    pub fn compact(&mut self) {
        if self.buffer.capacity() > DEFAULT_BUFFER_SIZE * 4
            && self.buffer.len() < DEFAULT_BUFFER_SIZE
        {
            let mut new_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
            new_buffer.extend_from_slice(&self.buffer);
            self.buffer = new_buffer;
        }
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..]
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ConnectionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    #[test]
    fn test_frames_split_across_reads() {
        let first = encode_frame(b"first").unwrap();
        let second = encode_frame(b"second").unwrap();
        let mut wire = first.to_vec();
        wire.extend_from_slice(&second);

        let mut buffer = ConnectionBuffer::new();
        buffer.extend(&wire[..5]);
        assert!(buffer.next_frame().unwrap().is_none());

        buffer.extend(&wire[5..]);
        assert_eq!(&buffer.next_frame().unwrap().unwrap()[..], b"first");
        assert_eq!(&buffer.next_frame().unwrap().unwrap()[..], b"second");
        assert!(buffer.next_frame().unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_compact_shrinks_after_burst() {
        let mut buffer = ConnectionBuffer::with_capacity(DEFAULT_BUFFER_SIZE * 8);
        buffer.extend(b"tail");
        buffer.compact();
        assert!(buffer.capacity() <= DEFAULT_BUFFER_SIZE * 4);
        assert_eq!(buffer.as_slice(), b"tail");
    }
}
