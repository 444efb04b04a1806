//! Cursor buffer for wire I/O.

/// Forward-cursor byte buffer backing socket reads and coalesced writes.
///
/// Two cursors partition the storage: bytes before the read cursor have
/// been consumed, bytes between the cursors are readable, and storage past
/// the write cursor is writable once reserved with [`prepare`]. Cursors
/// only move forward; consumed bytes stay in place until [`reset`].
///
/// The intended syscall pattern:
///
/// ```
/// use longeron_core::buffer::SequenceBuffer;
///
/// let mut buf = SequenceBuffer::new();
/// buf.prepare(512);
/// let n = {
///     let dst = buf.write_head();
///     dst[..5].copy_from_slice(b"hello");
///     5
/// };
/// buf.accept(n);
/// assert_eq!(buf.read_head(), b"hello");
/// buf.consume(5);
/// assert_eq!(buf.read_size(), 0);
/// ```
///
/// [`prepare`]: SequenceBuffer::prepare
/// [`reset`]: SequenceBuffer::reset
#[derive(Debug, Default)]
pub struct SequenceBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl SequenceBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Reserve at least `n` writable bytes past the write cursor.
    pub fn prepare(&mut self, n: usize) {
        let needed = self.write_pos + n;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
    }

    /// Writable slice starting at the write cursor; its length is whatever
    /// [`prepare`](Self::prepare) reserved (possibly more).
    pub fn write_head(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Commit `n` freshly written bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the reserved writable space.
    pub fn accept(&mut self, n: usize) {
        assert!(self.write_pos + n <= self.data.len());
        self.write_pos += n;
    }

    /// Readable bytes between the cursors.
    #[must_use]
    pub fn read_head(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Number of readable bytes.
    #[must_use]
    pub fn read_size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_size() == 0
    }

    /// Drop `n` bytes from the front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`read_size`](Self::read_size).
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.read_size());
        self.read_pos += n;
    }

    /// Append a byte run to the readable region (prepare + copy + accept).
    pub fn append(&mut self, bytes: &[u8]) {
        self.prepare(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Rewind both cursors, keeping the allocation.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_advance_independently() {
        let mut buf = SequenceBuffer::new();
        buf.append(b"abcdef");
        assert_eq!(buf.read_size(), 6);
        buf.consume(2);
        assert_eq!(buf.read_head(), b"cdef");
        buf.append(b"gh");
        assert_eq!(buf.read_head(), b"cdefgh");
        buf.consume(6);
        assert!(buf.is_empty());
    }

    #[test]
    fn prepare_grows_only_past_write_cursor() {
        let mut buf = SequenceBuffer::new();
        buf.prepare(4);
        assert!(buf.write_head().len() >= 4);
        buf.write_head()[..4].copy_from_slice(b"wxyz");
        buf.accept(4);
        // Reserving again keeps the committed bytes intact.
        buf.prepare(4);
        assert_eq!(buf.read_head(), b"wxyz");
    }

    #[test]
    fn reset_keeps_allocation() {
        let mut buf = SequenceBuffer::with_capacity(64);
        buf.append(b"data");
        buf.consume(4);
        buf.reset();
        assert_eq!(buf.read_size(), 0);
        buf.append(b"fresh");
        assert_eq!(buf.read_head(), b"fresh");
    }

    #[test]
    #[should_panic]
    fn consume_past_readable_panics() {
        let mut buf = SequenceBuffer::new();
        buf.append(b"ab");
        buf.consume(3);
    }
}
