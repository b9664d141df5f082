//! Request handler for the memcached text protocol.
//!
//! Bridges the connection state machine and the store: retrievals and stats
//! are answered inline out of the store, mutations are dispatched to the
//! storage pool — with a completion ticket unless the client said `noreply` —
//! and completion outcomes are rendered back into protocol responses.

use crate::backend::{Backend, Job, Ticket, WriteRequest};
use crate::conn::{Handler, Parse, RecvBuf, SendChain};
use crate::protocol::parser::{self, Command, ParseError, ParseResult};
use crate::store::{Outcome, Store};
use std::io;
use std::sync::Arc;

const STORED: &[u8] = b"STORED\r\n";
const NOT_STORED: &[u8] = b"NOT_STORED\r\n";
const EXISTS: &[u8] = b"EXISTS\r\n";
const NOT_FOUND: &[u8] = b"NOT_FOUND\r\n";
const DELETED: &[u8] = b"DELETED\r\n";
const OK: &[u8] = b"OK\r\n";
const END: &[u8] = b"END\r\n";
const ERROR: &[u8] = b"ERROR\r\n";
const CRLF: &[u8] = b"\r\n";
const VERSION_LINE: &[u8] = b"VERSION burrow 0.1.0\r\n";

/// Per-connection text protocol handler.
pub struct TextHandler {
    store: Arc<Store>,
    backend: Backend,
    ticket: Ticket,
}

impl TextHandler {
    pub fn new(store: Arc<Store>, backend: Backend, ticket: Ticket) -> Self {
        Self {
            store,
            backend,
            ticket,
        }
    }

    fn dispatch(&mut self, command: Command, sbuf: &mut SendChain) -> io::Result<Parse> {
        match command {
            Command::Get { keys, with_cas } => {
                self.stage_values(&keys, with_cas, sbuf)?;
                Ok(Parse::Respond)
            }

            Command::Stats => {
                let stats = self.store.stats();
                sbuf.append_fmt(format_args!("STAT curr_items {}\r\n", stats.item_count))?;
                sbuf.append_fmt(format_args!("STAT bytes {}\r\n", stats.memory_used))?;
                sbuf.append_fmt(format_args!("STAT limit_maxbytes {}\r\n", stats.max_memory))?;
                sbuf.append(END);
                Ok(Parse::Respond)
            }

            Command::Version => {
                sbuf.append(VERSION_LINE);
                Ok(Parse::Respond)
            }

            Command::Quit => Ok(Parse::Quit),
            Command::Shutdown => Ok(Parse::Shutdown),

            Command::Store {
                mode,
                key,
                flags,
                exptime,
                noreply,
                value,
            } => Ok(self.mutate(
                WriteRequest::Store {
                    mode,
                    key,
                    value,
                    flags,
                    exptime,
                },
                noreply,
            )),

            Command::Cas {
                key,
                flags,
                exptime,
                cas,
                noreply,
                value,
            } => Ok(self.mutate(
                WriteRequest::Cas {
                    key,
                    value,
                    flags,
                    exptime,
                    cas,
                },
                noreply,
            )),

            Command::Delete { key, noreply } => {
                Ok(self.mutate(WriteRequest::Delete { key }, noreply))
            }

            Command::Incr {
                key,
                delta,
                noreply,
            } => Ok(self.mutate(WriteRequest::Incr { key, delta }, noreply)),

            Command::Decr {
                key,
                delta,
                noreply,
            } => Ok(self.mutate(WriteRequest::Decr { key, delta }, noreply)),

            Command::FlushAll { delay: _, noreply } => {
                // Delayed flush is accepted but executes immediately.
                Ok(self.mutate(WriteRequest::FlushAll, noreply))
            }
        }
    }

    /// Stage `VALUE` blocks for every present key, then `END`.
    fn stage_values(
        &self,
        keys: &[String],
        with_cas: bool,
        sbuf: &mut SendChain,
    ) -> io::Result<()> {
        for key in keys {
            if let Some(item) = self.store.get(key) {
                if with_cas {
                    sbuf.append_fmt(format_args!(
                        "VALUE {} {} {} {}\r\n",
                        key,
                        item.flags,
                        item.value.len(),
                        item.cas
                    ))?;
                } else {
                    sbuf.append_fmt(format_args!(
                        "VALUE {} {} {}\r\n",
                        key,
                        item.flags,
                        item.value.len()
                    ))?;
                }
                sbuf.append(&item.value);
                sbuf.append(CRLF);
            }
        }
        sbuf.append(END);
        Ok(())
    }

    /// Dispatch a mutation to the storage pool.
    ///
    /// With `noreply` the job carries no ticket and the request is finished
    /// as far as this connection is concerned; otherwise the connection
    /// waits for exactly one completion.
    fn mutate(&mut self, request: WriteRequest, noreply: bool) -> Parse {
        if noreply {
            self.backend.submit(Job {
                request,
                reply: None,
            });
            Parse::Done
        } else {
            self.backend.submit(Job {
                request,
                reply: Some(self.ticket.clone()),
            });
            Parse::Pending
        }
    }

    fn stage_error(&self, err: &ParseError, sbuf: &mut SendChain) -> io::Result<()> {
        match err {
            ParseError::UnknownCommand(_) => sbuf.append(ERROR),
            ParseError::BadDataChunk => sbuf.append(b"CLIENT_ERROR bad data chunk\r\n"),
            other => sbuf.append_fmt(format_args!("CLIENT_ERROR {}\r\n", other))?,
        }
        Ok(())
    }
}

impl Handler for TextHandler {
    fn parse_request(&mut self, rbuf: &mut RecvBuf, sbuf: &mut SendChain) -> io::Result<Parse> {
        match parser::parse(rbuf.as_slice()) {
            ParseResult::NeedMore { total_needed } => {
                if total_needed.is_some_and(|needed| needed > rbuf.capacity()) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "request too large",
                    ));
                }
                Ok(Parse::Incomplete)
            }
            ParseResult::Error(err, consumed) => {
                rbuf.consume(consumed);
                self.stage_error(&err, sbuf)?;
                Ok(Parse::Malformed)
            }
            ParseResult::Complete(command, consumed) => {
                rbuf.consume(consumed);
                self.dispatch(command, sbuf)
            }
        }
    }

    fn store_done(&mut self, outcome: Outcome, sbuf: &mut SendChain) -> io::Result<()> {
        match outcome {
            Outcome::Stored => sbuf.append(STORED),
            Outcome::NotStored => sbuf.append(NOT_STORED),
            Outcome::CasMismatch => sbuf.append(EXISTS),
            Outcome::NotFound => sbuf.append(NOT_FOUND),
            Outcome::Deleted => sbuf.append(DELETED),
            Outcome::Flushed => sbuf.append(OK),
            Outcome::Counter(value) => sbuf.append_fmt(format_args!("{}\r\n", value))?,
            Outcome::NonNumeric => sbuf.append(
                b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n",
            ),
        }
        Ok(())
    }
}
