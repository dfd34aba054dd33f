//! Fixed-capacity byte ring used to reassemble frames from partial reads.
//!
//! Both the client and the server run exactly one of these per transport
//! direction: bytes arrive in arbitrary chunks from a non-blocking file
//! descriptor, and the frame codec ([`crate::frame`]) needs to peek ahead
//! far enough to tell whether a whole frame has arrived yet, without
//! consuming bytes it isn't ready to commit to.

use crate::error::RingError;
use std::io::{self, Read};

/// Minimum capacity required by the protocol: large enough to hold a
/// full header plus the largest payload a single frame may carry.
pub const MIN_CAPACITY: usize = 16 * 1024;

/// A fixed-capacity ring buffer.
///
/// Invariants (see §3, §8 "Ring safety"):
/// - `0 <= used <= capacity`
/// - `read` and `write` cursors advance modulo `capacity`
/// - `peek` never mutates the buffer
/// - `read` consumes exactly the requested number of bytes, or refuses
///   entirely (it never returns a short read)
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    read: usize,
    used: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            read: 0,
            used: 0,
        }
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn available(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn write_pos(&self) -> usize {
        (self.read + self.used) % self.capacity
    }

    /// Read from `fd` into free space, wrapping at the end of the backing
    /// buffer. Returns the number of bytes read; `Ok(0)` means EOF.
    ///
    /// `would_block` is not an error: the caller should treat it the same
    /// as `Ok(0)` bytes read *this call*, and retry on the next readiness
    /// notification.
    pub fn fill(&mut self, source: &mut dyn Read) -> io::Result<usize> {
        let free = self.capacity - self.used;
        if free == 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                RingError::Overflow {
                    attempted: self.capacity + 1,
                    capacity: self.capacity,
                },
            ));
        }

        let write_pos = self.write_pos();
        let contiguous = (self.capacity - write_pos).min(free);

        loop {
            match source.read(&mut self.buf[write_pos..write_pos + contiguous]) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    self.used += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(e),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Return the next `n` bytes without consuming them.
    ///
    /// Panics if fewer than `n` bytes are available; callers must check
    /// [`RingBuffer::available`] first (mirrors the codec's decode loop,
    /// which always does).
    pub fn peek(&self, n: usize) -> Result<Vec<u8>, RingError> {
        if n > self.used {
            return Err(RingError::Underrun {
                requested: n,
                available: self.used,
            });
        }
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(self.buf[(self.read + i) % self.capacity]);
        }
        Ok(out)
    }

    /// Consume and return the next `n` bytes.
    ///
    /// Refuses (returns `Err`, changes nothing) if fewer than `n` bytes
    /// are buffered, rather than returning a short read.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, RingError> {
        let out = self.peek(n)?;
        self.read = (self.read + n) % self.capacity;
        self.used -= n;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::io::Cursor;

    #[test]
    fn fill_then_read_round_trips() {
        let mut ring = RingBuffer::new(16);
        let mut src = Cursor::new(b"hello".to_vec());
        let n = ring.fill(&mut src).unwrap();
        assert_eq!(n, 5);
        assert_eq!(ring.available(), 5);
        assert_eq!(ring.read(5).unwrap(), b"hello");
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = RingBuffer::new(16);
        let mut src = Cursor::new(b"abcdef".to_vec());
        ring.fill(&mut src).unwrap();
        assert_eq!(ring.peek(3).unwrap(), b"abc");
        assert_eq!(ring.available(), 6);
        assert_eq!(ring.read(3).unwrap(), b"abc");
        assert_eq!(ring.peek(3).unwrap(), b"def");
    }

    #[test]
    fn read_refuses_when_insufficient() {
        let mut ring = RingBuffer::new(16);
        let mut src = Cursor::new(b"ab".to_vec());
        ring.fill(&mut src).unwrap();
        assert!(ring.read(3).is_err());
        // nothing was consumed
        assert_eq!(ring.available(), 2);
    }

    #[test]
    fn wraps_around_the_backing_buffer() {
        let mut ring = RingBuffer::new(8);
        let mut src = Cursor::new(b"123456".to_vec());
        ring.fill(&mut src).unwrap();
        ring.read(4).unwrap();
        // write cursor is now past the midpoint; the next fill must wrap
        let mut src2 = Cursor::new(b"7890".to_vec());
        ring.fill(&mut src2).unwrap();
        assert_eq!(ring.available(), 6);
        assert_eq!(ring.read(6).unwrap(), b"567890");
    }

    #[test]
    fn overflow_is_reported() {
        let mut ring = RingBuffer::new(4);
        // fill() only ever writes into the currently free, contiguous
        // region, so a buffer that can't hold the whole source empties it
        // over several calls instead of overflowing in one shot.
        let mut src = Cursor::new(b"12345".to_vec());
        assert_eq!(ring.fill(&mut src).unwrap(), 4);
        assert_eq!(ring.available(), 4);
        // now the ring is completely full: the next fill must report Overflow
        let mut src2 = Cursor::new(b"x".to_vec());
        let err = ring.fill(&mut src2).unwrap_err();
        assert!(matches!(err.kind(), io::ErrorKind::Other));
    }

    #[quickcheck]
    fn ring_safety(writes: Vec<u8>, read_sizes: Vec<u8>) -> bool {
        // Feed at most `capacity` bytes total, in arbitrary chunk sizes,
        // and read them back in arbitrary (but in-bounds) chunk sizes.
        // `available()` must always equal writes - reads, and peek must
        // never disagree with a subsequent read of the same length.
        let capacity = 64;
        let mut ring = RingBuffer::new(capacity);
        let data: Vec<u8> = writes.into_iter().take(capacity).collect();
        let mut src = Cursor::new(data.clone());
        let written = ring.fill(&mut src).unwrap_or(0);

        let mut consumed = 0usize;
        for sz in read_sizes {
            let sz = (sz as usize) % (capacity + 1);
            if sz == 0 || sz > ring.available() {
                continue;
            }
            let peeked = ring.peek(sz).unwrap();
            let read = ring.read(sz).unwrap();
            if peeked != read {
                return false;
            }
            if read != data[consumed..consumed + sz] {
                return false;
            }
            consumed += sz;
        }

        ring.available() == written - consumed
    }
}
