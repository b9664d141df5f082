//! Chained send buffer.
//!
//! An append-only chain of fixed-size links with incremental non-blocking
//! flush. Responses are staged into the tail while earlier links are still
//! leaving the socket; fully drained non-tail links are pruned by `collect`.
//! Under normal load the chain stays at a single link thanks to tail
//! compaction after every full drain.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::io::{self, Write};

/// Upper bound on one `append_fmt` message. Overflow is fatal to the
/// connection, not silently truncated.
pub const MAX_FMT_MSG: usize = 1024;

/// Result of one flush pass over the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Every link was written out completely.
    Drained,
    /// A short write or would-block left unsent bytes behind.
    Outstanding,
}

/// One fixed-size node in the chain.
///
/// Invariant: `0 <= sent <= filled <= capacity`. Only the tail accepts
/// appends; non-tail links are always filled to capacity.
struct Link {
    buf: Box<[u8]>,
    filled: usize,
    sent: usize,
}

impl Link {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            sent: 0,
        }
    }

    fn free(&self) -> usize {
        self.buf.len() - self.filled
    }

    fn unsent(&self) -> usize {
        self.filled - self.sent
    }

    /// Fully written and fully transmitted; eligible for removal if non-tail.
    fn drained(&self) -> bool {
        self.filled == self.buf.len() && self.sent == self.filled
    }
}

/// Append-only byte chain with incremental flush.
///
/// The chain is never empty while the connection is alive; a single empty
/// link is the idle representation.
pub struct SendChain {
    links: VecDeque<Link>,
    link_capacity: usize,
}

impl SendChain {
    pub fn new(link_capacity: usize) -> Self {
        let mut links = VecDeque::with_capacity(2);
        links.push_back(Link::new(link_capacity));
        Self {
            links,
            link_capacity,
        }
    }

    /// Copy `bytes` into the tail, allocating new tail links as needed.
    /// Bytes appended between two flushes are emitted in append order.
    pub fn append(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.links.back().map_or(true, |l| l.free() == 0) {
                self.links.push_back(Link::new(self.link_capacity));
            }
            // Just ensured a tail with free space exists.
            let tail = self.links.back_mut().unwrap();
            let n = bytes.len().min(tail.free());
            tail.buf[tail.filled..tail.filled + n].copy_from_slice(&bytes[..n]);
            tail.filled += n;
            bytes = &bytes[n..];
        }
    }

    /// Format a message into the chain.
    ///
    /// Messages are bounded by [`MAX_FMT_MSG`]; exceeding the bound is an
    /// error the caller must treat as fatal to the connection.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        let mut scratch = FmtScratch {
            buf: [0u8; MAX_FMT_MSG],
            len: 0,
        };
        if scratch.write_fmt(args).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "formatted message exceeds staging bound",
            ));
        }
        self.append(&scratch.buf[..scratch.len]);
        Ok(())
    }

    /// Write the unsent range of each link, head first, one write per link.
    ///
    /// Stops at the first link that cannot be fully drained. After a write
    /// that empties the tail, the tail's counters reset so appends continue
    /// without allocating. Would-block reports `Outstanding`; any other
    /// write error is fatal and propagates.
    pub fn flush(&mut self, dst: &mut impl Write) -> io::Result<FlushStatus> {
        let count = self.links.len();
        for i in 0..count {
            let is_tail = i + 1 == count;
            let link = &mut self.links[i];
            if link.unsent() > 0 {
                match dst.write(&link.buf[link.sent..link.filled]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned 0",
                        ))
                    }
                    Ok(n) => {
                        link.sent += n;
                        if link.unsent() > 0 {
                            return Ok(FlushStatus::Outstanding);
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(FlushStatus::Outstanding)
                    }
                    Err(e) => return Err(e),
                }
            }
            if is_tail && link.sent == link.filled {
                link.sent = 0;
                link.filled = 0;
            }
        }
        Ok(FlushStatus::Drained)
    }

    /// True while any link still has unsent bytes.
    pub fn outstanding(&self) -> bool {
        self.links.iter().any(|l| l.unsent() > 0)
    }

    /// Prune fully drained non-tail links from the head of the chain.
    pub fn collect(&mut self) {
        while self.links.len() > 1 && self.links.front().is_some_and(|l| l.drained()) {
            self.links.pop_front();
        }
    }

    #[cfg(test)]
    fn link_count(&self) -> usize {
        self.links.len()
    }
}

/// Bounded staging area for `append_fmt`.
struct FmtScratch {
    buf: [u8; MAX_FMT_MSG],
    len: usize,
}

impl fmt::Write for FmtScratch {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.len + bytes.len() > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil::TestStream;

    #[test]
    fn test_append_and_flush_single_link() {
        let mut chain = SendChain::new(64);
        chain.append(b"END\r\n");
        assert!(chain.outstanding());

        let mut stream = TestStream::new();
        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Drained);
        assert_eq!(stream.written(), b"END\r\n");
        assert!(!chain.outstanding());
        assert_eq!(chain.link_count(), 1);
    }

    #[test]
    fn test_append_spills_into_new_links() {
        let mut chain = SendChain::new(8);
        chain.append(b"0123456789abcdef0123");
        assert_eq!(chain.link_count(), 3);

        let mut stream = TestStream::new();
        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Drained);
        assert_eq!(stream.written(), b"0123456789abcdef0123");
    }

    #[test]
    fn test_append_order_preserved_across_links() {
        let mut chain = SendChain::new(4);
        chain.append(b"abc");
        chain.append(b"defgh");
        chain.append(b"i");

        let mut stream = TestStream::new();
        chain.flush(&mut stream).unwrap();
        assert_eq!(stream.written(), b"abcdefghi");
    }

    #[test]
    fn test_short_write_leaves_outstanding() {
        let mut chain = SendChain::new(16);
        chain.append(b"0123456789");

        let mut stream = TestStream::new();
        stream.set_write_cap(4);
        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Outstanding);
        assert_eq!(stream.written(), b"0123");
        assert!(chain.outstanding());

        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Outstanding);
        // 10 bytes at 4 per write: the third pass empties the link.
        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Drained);
        assert_eq!(stream.written(), b"0123456789");
        assert!(!chain.outstanding());
    }

    #[test]
    fn test_would_block_reports_outstanding() {
        let mut chain = SendChain::new(16);
        chain.append(b"data");

        let mut stream = TestStream::new();
        stream.push_write_block();
        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Outstanding);
        assert!(stream.written().is_empty());

        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Drained);
        assert_eq!(stream.written(), b"data");
    }

    #[test]
    fn test_collect_prunes_drained_prefix() {
        let mut chain = SendChain::new(4);
        chain.append(b"0123456789");
        assert_eq!(chain.link_count(), 3);

        let mut stream = TestStream::new();
        // Drain link 0 entirely, then stop short on link 1.
        stream.push_write_cap(4);
        stream.push_write_cap(2);
        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Outstanding);
        assert_eq!(stream.written(), b"012345");

        chain.collect();
        assert_eq!(chain.link_count(), 2);
        // No fully drained link may remain ahead of the tail after collect.
        assert!(!chain.links.iter().rev().skip(1).any(|l| l.drained()));

        assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Drained);
        chain.collect();
        assert_eq!(chain.link_count(), 1);
        assert!(!chain.outstanding());
        assert_eq!(stream.written(), b"0123456789");
    }

    #[test]
    fn test_tail_compaction_keeps_single_link_steady_state() {
        let mut chain = SendChain::new(32);
        let mut stream = TestStream::new();
        for _ in 0..10 {
            chain.append(b"VALUE k 0 1\r\nx\r\n");
            assert_eq!(chain.flush(&mut stream).unwrap(), FlushStatus::Drained);
            chain.collect();
            assert_eq!(chain.link_count(), 1);
        }
    }

    #[test]
    fn test_append_fmt() {
        let mut chain = SendChain::new(64);
        chain
            .append_fmt(format_args!("VALUE {} {} {}\r\n", "key", 7, 5))
            .unwrap();
        let mut stream = TestStream::new();
        chain.flush(&mut stream).unwrap();
        assert_eq!(stream.written(), b"VALUE key 7 5\r\n");
    }

    #[test]
    fn test_append_fmt_overflow_is_error() {
        let mut chain = SendChain::new(64);
        let big = "x".repeat(MAX_FMT_MSG + 1);
        assert!(chain.append_fmt(format_args!("{big}")).is_err());
    }

    #[test]
    fn test_fatal_write_error_propagates() {
        let mut chain = SendChain::new(16);
        chain.append(b"data");
        let mut stream = TestStream::new();
        stream.push_write_error(io::ErrorKind::BrokenPipe);
        assert!(chain.flush(&mut stream).is_err());
    }
}
