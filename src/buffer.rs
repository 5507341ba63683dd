//! Growable byte container with a consume cursor, backing the raw-stream
//! buffer, the per-link page buffers and the per-cable ALPIDE streams.

use std::io::{self, Read};

/// Byte container with an append end and a consume cursor.
///
/// Appending never touches already stored bytes, so cursor positions stay
/// valid across every operation except [`move_unused_to_head`](Self::move_unused_to_head),
/// [`clear`](Self::clear) and [`shrink_to`](Self::shrink_to), which
/// relocate or drop data.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PayloadBuffer {
    data: Vec<u8>,
    rd: usize,
}

impl PayloadBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer that can hold `capacity` bytes without
    /// reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            rd: 0,
        }
    }

    /// Grows the allocation so the buffer can hold at least `capacity` bytes
    /// in total.
    pub fn expand(&mut self, capacity: usize) {
        if capacity > self.data.capacity() {
            self.data.reserve(capacity - self.data.len());
        }
    }

    /// Makes room for at least `n` more bytes beyond the current content.
    pub fn ensure_free_capacity(&mut self, n: usize) {
        self.data.reserve(n);
    }

    /// Repeatedly pulls from `src` into the unused tail until the source
    /// yields zero bytes or the tail is full. Returns the number of bytes
    /// appended. Grow the buffer with [`expand`](Self::expand) first; only
    /// the current spare capacity is filled.
    pub fn append<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        let cap = self.data.capacity();
        let old = self.data.len();
        self.data.resize(cap, 0);
        let mut filled = old;
        let res = loop {
            if filled == cap {
                break Ok(());
            }
            match src.read(&mut self.data[filled..cap]) {
                Ok(0) => break Ok(()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        self.data.truncate(filled);
        res.map(|()| filled - old)
    }

    /// Appends `bytes` to the end of the buffer.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Appends `n` zero bytes.
    pub fn fill_zero(&mut self, n: usize) {
        self.data.resize(self.data.len() + n, 0);
    }

    /// Total number of bytes stored (consumed and unconsumed).
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of unconsumed bytes left after the cursor.
    pub fn unused_size(&self) -> usize {
        self.data.len() - self.rd
    }

    /// True when no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.rd == self.data.len()
    }

    /// The byte at the cursor, if any.
    pub fn current(&self) -> Option<u8> {
        self.data.get(self.rd).copied()
    }

    /// The unconsumed bytes, starting at the cursor.
    pub fn unused(&self) -> &[u8] {
        &self.data[self.rd..]
    }

    /// Moves the cursor forward by `n` bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`unused_size`](Self::unused_size).
    pub fn advance(&mut self, n: usize) {
        assert!(self.rd + n <= self.data.len());
        self.rd += n;
    }

    /// Current cursor position from the start of the buffer.
    pub fn cursor(&self) -> usize {
        self.rd
    }

    /// Places the cursor at an absolute position.
    ///
    /// # Panics
    /// Panics if `pos` exceeds [`size`](Self::size).
    pub fn set_cursor(&mut self, pos: usize) {
        assert!(pos <= self.data.len());
        self.rd = pos;
    }

    /// All stored bytes, including already consumed ones.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of all stored bytes, for in-place patching.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Discards the consumed head, moving the unconsumed tail to the start.
    /// Invalidates previously obtained cursor positions.
    pub fn move_unused_to_head(&mut self) {
        if self.rd > 0 {
            self.data.drain(..self.rd);
            self.rd = 0;
        }
    }

    /// Drops all content and resets the cursor. Keeps the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.rd = 0;
    }

    /// Truncates the buffer back to `size` bytes, pulling the cursor along
    /// if it pointed past the new end.
    pub fn shrink_to(&mut self, size: usize) {
        self.data.truncate(size);
        self.rd = self.rd.min(self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_fills_spare_capacity_only() {
        let mut buf = PayloadBuffer::with_capacity(8);
        let mut src: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let n = buf.append(&mut src).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf.unused(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        // tail is full, nothing more is pulled
        assert_eq!(buf.append(&mut src).unwrap(), 0);
    }

    #[test]
    fn append_stops_at_source_end() {
        let mut buf = PayloadBuffer::with_capacity(64);
        let mut src: &[u8] = &[0xAB; 10];
        assert_eq!(buf.append(&mut src).unwrap(), 10);
        assert_eq!(buf.size(), 10);
    }

    #[test]
    fn cursor_operations() {
        let mut buf = PayloadBuffer::new();
        buf.add_bytes(&[10, 20, 30]);
        assert_eq!(buf.current(), Some(10));
        buf.advance(2);
        assert_eq!(buf.current(), Some(30));
        assert_eq!(buf.unused_size(), 1);
        buf.advance(1);
        assert!(buf.is_empty());
        assert_eq!(buf.current(), None);
    }

    #[test]
    fn move_unused_to_head_compacts() {
        let mut buf = PayloadBuffer::new();
        buf.add_bytes(&[1, 2, 3, 4]);
        buf.advance(3);
        buf.move_unused_to_head();
        assert_eq!(buf.cursor(), 0);
        assert_eq!(buf.as_slice(), &[4]);
        assert_eq!(buf.unused(), &[4]);
    }

    #[test]
    fn fill_zero_appends_zeros() {
        let mut buf = PayloadBuffer::new();
        buf.add_bytes(&[9]);
        buf.fill_zero(3);
        assert_eq!(buf.as_slice(), &[9, 0, 0, 0]);
    }

    #[test]
    fn shrink_to_pulls_cursor_back() {
        let mut buf = PayloadBuffer::new();
        buf.add_bytes(&[1, 2, 3, 4, 5]);
        buf.advance(4);
        buf.shrink_to(2);
        assert_eq!(buf.size(), 2);
        assert_eq!(buf.cursor(), 2);
        assert!(buf.is_empty());
    }
}
