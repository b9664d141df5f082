//! Per-connection protocol core.
//!
//! One connection owns a receive buffer, a chained send buffer, and a request
//! handler for its entire lifetime, all driven by a single state machine:
//! - `RecvBuf`: fixed-size scratch area for the unparsed byte stream
//! - `SendChain`: append-only link chain with incremental flush
//! - `Conn`: ties socket readiness, handler verdicts, and store completions
//!   into one deterministic transition function

mod fsm;
mod rbuf;
mod sbuf;

pub use fsm::{Conn, Direction, Event, Handler, Parse, State, Verdict};
pub use rbuf::{Fill, RecvBuf};
pub use sbuf::{FlushStatus, SendChain, MAX_FMT_MSG};
