use bytes::{Buf, BytesMut};

/// Growable inbound byte arena.
///
/// Chunks read off the socket are appended at the back; the frame decoder
/// peeks at the front and consumes whole frames.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    inner: BytesMut,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.inner.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The first `n` buffered bytes, or `None` if fewer are available.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        self.inner.get(..n)
    }

    /// All buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Drops the first `n` bytes (clamped to the buffered length).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.inner.len());
        self.inner.advance(n);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl From<&[u8]> for ReceiveBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self {
            inner: BytesMut::from(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_and_consume() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(&[1, 2, 3]);
        buf.extend(&[4, 5]);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf.peek(2), Some(&[1u8, 2][..]));
        assert_eq!(buf.peek(6), None);

        buf.consume(3);
        assert_eq!(buf.as_slice(), &[4, 5]);

        buf.consume(10);
        assert!(buf.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let mut buf = ReceiveBuffer::from(&[9u8, 8, 7][..]);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.peek(1), None);
    }
}
