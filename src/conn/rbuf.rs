//! Fixed-capacity receive buffer.
//!
//! Holds the unparsed prefix of a possibly-pipelined byte stream. The parser
//! is handed a view over the used region and calls `consume` for exactly the
//! bytes it has committed to interpreting.

use std::io::{self, Read};

/// Outcome of one non-blocking read into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Read this many bytes into the free tail region.
    Read(usize),
    /// The socket had nothing for us (or the buffer is already full).
    WouldBlock,
    /// Peer closed the connection cleanly.
    Eof,
}

/// Fixed-capacity read buffer with a used-length cursor.
///
/// A request and its arguments are assumed to fit in capacity; the connection
/// state machine fails the connection when a partial request has filled the
/// whole buffer.
pub struct RecvBuf {
    buf: Box<[u8]>,
    used: usize,
}

impl RecvBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    /// Perform one non-blocking read into the free tail region.
    ///
    /// Would-block is not an error; any other I/O failure is fatal to the
    /// connection and propagates.
    pub fn fill(&mut self, src: &mut impl Read) -> io::Result<Fill> {
        if self.used == self.buf.len() {
            // No free region; a zero-length read would be indistinguishable
            // from EOF.
            return Ok(Fill::WouldBlock);
        }
        match src.read(&mut self.buf[self.used..]) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                self.used += n;
                Ok(Fill::Read(n))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Remove the first `n` bytes, shifting the remainder down.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.used, "consume past used region");
        let n = n.min(self.used);
        self.buf.copy_within(n..self.used, 0);
        self.used -= n;
    }

    /// View over the unparsed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    #[allow(dead_code)]
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// True when a partial request has filled the whole buffer and can never
    /// complete.
    pub fn is_full(&self) -> bool {
        self.used == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil::TestStream;

    #[test]
    fn test_fill_and_consume() {
        let mut stream = TestStream::new();
        stream.push_read(b"get a\r\nget b\r\n");

        let mut rbuf = RecvBuf::with_capacity(64);
        assert_eq!(rbuf.fill(&mut stream).unwrap(), Fill::Read(14));
        assert_eq!(rbuf.as_slice(), b"get a\r\nget b\r\n");

        rbuf.consume(7);
        assert_eq!(rbuf.as_slice(), b"get b\r\n");
        assert_eq!(rbuf.used(), 7);

        rbuf.consume(7);
        assert!(rbuf.is_empty());
    }

    #[test]
    fn test_fill_would_block_and_eof() {
        let mut stream = TestStream::new();
        stream.push_block();
        stream.push_eof();

        let mut rbuf = RecvBuf::with_capacity(16);
        assert_eq!(rbuf.fill(&mut stream).unwrap(), Fill::WouldBlock);
        assert_eq!(rbuf.fill(&mut stream).unwrap(), Fill::Eof);
    }

    #[test]
    fn test_fill_into_partial_buffer() {
        let mut stream = TestStream::new();
        stream.push_read(b"ge");
        stream.push_read(b"t k\r\n");

        let mut rbuf = RecvBuf::with_capacity(16);
        rbuf.fill(&mut stream).unwrap();
        assert_eq!(rbuf.as_slice(), b"ge");
        rbuf.fill(&mut stream).unwrap();
        assert_eq!(rbuf.as_slice(), b"get k\r\n");
    }

    #[test]
    fn test_full_buffer_reports_would_block() {
        let mut stream = TestStream::new();
        stream.push_read(&[b'x'; 8]);
        stream.push_read(b"more");

        let mut rbuf = RecvBuf::with_capacity(8);
        assert_eq!(rbuf.fill(&mut stream).unwrap(), Fill::Read(8));
        assert!(rbuf.is_full());
        // A full buffer must not consult the socket again.
        assert_eq!(rbuf.fill(&mut stream).unwrap(), Fill::WouldBlock);
    }
}
