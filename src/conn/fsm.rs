//! Connection state machine.
//!
//! Drives one client socket through the request/response lifecycle: reads
//! land in the receive buffer, the handler parses them into requests and
//! stages responses into the send chain, and store completions resume
//! connections that deferred a mutation. `step` is the single entry point;
//! it never blocks and yields back to the reactor by settling in a state
//! that names what it is waiting for.

use crate::conn::rbuf::{Fill, RecvBuf};
use crate::conn::sbuf::{FlushStatus, SendChain};
use crate::store::Outcome;
use std::io::{self, Read, Write};
use tracing::error;

/// Readiness direction reported by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

impl Direction {
    fn writable(self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }
}

/// An event delivered to the connection by its owning reactor.
#[derive(Debug)]
pub enum Event {
    /// The socket became readable and/or writable.
    Socket(Direction),
    /// A deferred store operation finished.
    StoreDone(Outcome),
    /// The server is going down; release everything.
    Shutdown,
}

/// What the reactor should do with the connection after a `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the connection registered and wait for the next event.
    Continue,
    /// Same as `Continue`; the socket had nothing for us and the connection
    /// settled back to a clean idle.
    Idle,
    /// Close this connection.
    Quit,
    /// Stop the whole server.
    Shutdown,
    /// Contract violation: an event arrived in a state that cannot accept
    /// it. The reactor should close the connection.
    Invalid,
}

/// Connection state between events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Idle; no outstanding work, buffers may be unallocated.
    Connected,
    /// The parser needs more bytes to finish the current request.
    RecvIncomplete,
    /// A flush came up short; waiting for the socket to accept more.
    SendIncomplete,
    /// A deferred store operation is in flight; no new input is parsed
    /// until its completion arrives.
    StorePending,
    /// The receive buffer holds unparsed bytes ready for the handler.
    DataReady,
}

/// Verdict of one `parse_request` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parse {
    /// The request could not be interpreted; an error response is already
    /// staged and the offending bytes consumed. The next request may parse.
    Malformed,
    /// Not enough bytes for a full request; nothing was consumed.
    Incomplete,
    /// The client asked to close the connection.
    Quit,
    /// The client asked to stop the server.
    Shutdown,
    /// A store operation was dispatched; exactly one completion will arrive
    /// later and input stays blocked until it does.
    Pending,
    /// The request was satisfied inline or dispatched fire-and-forget; no
    /// completion will arrive.
    Done,
    /// The response is fully staged in the send chain; flush it.
    Respond,
}

/// The request parser/executor attached to a connection.
///
/// `parse_request` reads from the receive buffer view, consumes exactly the
/// bytes it has committed to, stages any response (including its own error
/// responses) into the send chain, and classifies the request with a
/// [`Parse`] verdict. A handler that returns [`Parse::Pending`] is obligated
/// to cause exactly one completion to be delivered later; `store_done` then
/// stages the response for it.
pub trait Handler {
    fn parse_request(&mut self, rbuf: &mut RecvBuf, sbuf: &mut SendChain) -> io::Result<Parse>;

    fn store_done(&mut self, outcome: Outcome, sbuf: &mut SendChain) -> io::Result<()>;
}

/// One client connection: socket, state, buffers, handler.
///
/// Owned and stepped by a single reactor thread; `step` is never re-entered
/// for the same connection. Buffers are allocated on first activity and
/// released when the connection settles idle with nothing buffered.
pub struct Conn<S, H> {
    // Field order is release order: socket, handler, send chain, receive
    // buffer.
    stream: S,
    handler: H,
    sbuf: Option<SendChain>,
    rbuf: Option<RecvBuf>,
    state: State,
    corked: bool,
    buf_size: usize,
}

impl<S: Read + Write, H: Handler> Conn<S, H> {
    /// `buf_size` is both the receive-buffer capacity and the send-chain
    /// link capacity.
    pub fn new(stream: S, handler: H, buf_size: usize) -> Self {
        Self {
            stream,
            handler,
            sbuf: None,
            rbuf: None,
            state: State::Connected,
            corked: false,
            buf_size,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Suppress outbound flushes so several responses coalesce.
    #[allow(dead_code)]
    pub fn cork(&mut self) {
        self.corked = true;
    }

    /// Re-enable flushing and push out whatever was held back.
    #[allow(dead_code)]
    pub fn uncork(&mut self) -> io::Result<()> {
        self.corked = false;
        self.send_to_client()
    }

    /// Process one event and report what the reactor should do next.
    ///
    /// Would-block suspends; a fatal I/O error (including an oversized
    /// request) propagates as `Err` and the reactor closes the connection.
    pub fn step(&mut self, event: Event) -> io::Result<Verdict> {
        match event {
            Event::Shutdown => {
                self.reset();
                Ok(Verdict::Shutdown)
            }
            Event::StoreDone(outcome) => {
                let verdict = self.on_store_done(outcome)?;
                if verdict == Verdict::Continue && self.state == State::DataReady {
                    self.drain()
                } else {
                    Ok(verdict)
                }
            }
            Event::Socket(dir) => self.on_socket(dir),
        }
    }

    fn on_socket(&mut self, dir: Direction) -> io::Result<Verdict> {
        match self.state {
            State::Connected | State::RecvIncomplete => self.on_readable(),
            State::SendIncomplete => {
                if !dir.writable() {
                    error!(state = ?self.state, ?dir, "socket event without write readiness");
                    return Ok(Verdict::Invalid);
                }
                self.send_to_client()?;
                if self.state == State::DataReady {
                    self.drain()
                } else {
                    Ok(Verdict::Continue)
                }
            }
            // Input stays blocked while a store operation is in flight; the
            // unread bytes provide per-connection back-pressure.
            State::StorePending => Ok(Verdict::Continue),
            State::DataReady => self.drain(),
        }
    }

    /// Read once, then hand whatever is buffered to the drain loop.
    fn on_readable(&mut self) -> io::Result<Verdict> {
        let was_incomplete = self.state == State::RecvIncomplete;
        let cap = self.buf_size;
        let rbuf = self.rbuf.get_or_insert_with(|| RecvBuf::with_capacity(cap));
        match rbuf.fill(&mut self.stream)? {
            Fill::Read(_) => {
                if !was_incomplete {
                    self.state = State::DataReady;
                }
                self.drain()
            }
            Fill::WouldBlock => {
                if !rbuf.is_empty() {
                    if was_incomplete {
                        return Ok(Verdict::Continue);
                    }
                    self.state = State::DataReady;
                    return self.drain();
                }
                if was_incomplete {
                    Ok(Verdict::Continue)
                } else if self.sbuf.as_ref().map_or(true, |s| !s.outstanding()) {
                    // Nothing buffered in either direction: drop the buffers
                    // so idle connections hold no memory.
                    self.release_buffers();
                    self.state = State::Connected;
                    Ok(Verdict::Idle)
                } else {
                    Ok(Verdict::Continue)
                }
            }
            Fill::Eof => {
                self.reset();
                Ok(Verdict::Quit)
            }
        }
    }

    /// Feed buffered bytes to the handler until the connection suspends.
    ///
    /// Runs while the state stays `DataReady` or `RecvIncomplete`; a
    /// deferred store operation, a short write, quit, or an empty socket
    /// ends the loop.
    fn drain(&mut self) -> io::Result<Verdict> {
        loop {
            match self.state {
                State::DataReady | State::RecvIncomplete => {}
                _ => return Ok(Verdict::Continue),
            }

            if self.rbuf.as_ref().map_or(true, |b| b.is_empty()) {
                match self.fill_once()? {
                    Fill::Read(_) => {}
                    Fill::WouldBlock => {
                        if self.sbuf.as_ref().map_or(true, |s| !s.outstanding()) {
                            self.release_buffers();
                            self.state = State::Connected;
                            return Ok(Verdict::Idle);
                        }
                        return Ok(Verdict::Continue);
                    }
                    Fill::Eof => {
                        self.reset();
                        return Ok(Verdict::Quit);
                    }
                }
            }

            let cap = self.buf_size;
            let sbuf = self.sbuf.get_or_insert_with(|| SendChain::new(cap));
            let Some(rbuf) = self.rbuf.as_mut() else {
                return Ok(Verdict::Invalid);
            };
            match self.handler.parse_request(rbuf, sbuf)? {
                Parse::Malformed => {
                    self.state = State::DataReady;
                    self.send_to_client()?;
                }
                Parse::Incomplete => {
                    if self.rbuf.as_ref().is_some_and(|b| b.is_full()) {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "request too large",
                        ));
                    }
                    self.state = State::RecvIncomplete;
                    match self.fill_once()? {
                        Fill::Read(_) => {}
                        Fill::WouldBlock => return Ok(Verdict::Continue),
                        Fill::Eof => {
                            self.reset();
                            return Ok(Verdict::Quit);
                        }
                    }
                }
                Parse::Quit => {
                    self.reset();
                    return Ok(Verdict::Quit);
                }
                Parse::Shutdown => {
                    self.reset();
                    return Ok(Verdict::Shutdown);
                }
                Parse::Pending => {
                    self.state = State::StorePending;
                    return Ok(Verdict::Continue);
                }
                Parse::Done => {
                    self.state = State::DataReady;
                }
                Parse::Respond => {
                    self.state = State::DataReady;
                    self.send_to_client()?;
                }
            }
        }
    }

    fn fill_once(&mut self) -> io::Result<Fill> {
        let cap = self.buf_size;
        let rbuf = self.rbuf.get_or_insert_with(|| RecvBuf::with_capacity(cap));
        rbuf.fill(&mut self.stream)
    }

    fn on_store_done(&mut self, outcome: Outcome) -> io::Result<Verdict> {
        if self.state != State::StorePending {
            error!(state = ?self.state, "store completion delivered in invalid state");
            return Ok(Verdict::Invalid);
        }
        let cap = self.buf_size;
        let sbuf = self.sbuf.get_or_insert_with(|| SendChain::new(cap));
        self.handler.store_done(outcome, sbuf)?;
        self.state = State::DataReady;
        self.send_to_client()?;
        Ok(Verdict::Continue)
    }

    /// Flush staged response bytes unless corked.
    ///
    /// Settles in `SendIncomplete` on a short write, `DataReady` on a full
    /// drain.
    fn send_to_client(&mut self) -> io::Result<()> {
        if self.corked {
            return Ok(());
        }
        let Some(sbuf) = self.sbuf.as_mut() else {
            self.state = State::DataReady;
            return Ok(());
        };
        let status = sbuf.flush(&mut self.stream)?;
        sbuf.collect();
        self.state = match status {
            FlushStatus::Drained => State::DataReady,
            FlushStatus::Outstanding => State::SendIncomplete,
        };
        Ok(())
    }

    fn release_buffers(&mut self) {
        self.rbuf = None;
        self.sbuf = None;
    }

    /// Return to a clean state, dropping both buffers. The socket itself is
    /// closed when the reactor drops the connection.
    fn reset(&mut self) {
        self.release_buffers();
        self.corked = false;
        self.state = State::Connected;
    }

    #[cfg(test)]
    fn buffers_allocated(&self) -> bool {
        self.rbuf.is_some() || self.sbuf.is_some()
    }
}
