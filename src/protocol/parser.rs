//! Memcached text protocol command parser.
//!
//! Parses one command (and, for storage commands, its data block) from the
//! front of the receive buffer without consuming anything; the handler
//! consumes exactly the bytes the parser reports.
//!
//! Commands:
//! - Retrieval: get, gets
//! - Storage: set, add, replace, append, prepend, cas
//! - Deletion: delete
//! - Counters: incr, decr
//! - Other: flush_all, stats, version, quit, shutdown

use crate::backend::StoreMode;
use bytes::Bytes;
use std::str;

/// Maximum key length allowed by the protocol
pub const MAX_KEY_LENGTH: usize = 250;

/// One fully parsed request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Fetch one or more keys, with CAS tokens for `gets`
    Get { keys: Vec<String>, with_cas: bool },

    /// Store a value under one of the non-CAS modes
    Store {
        mode: StoreMode,
        key: String,
        flags: u32,
        exptime: u64,
        noreply: bool,
        value: Bytes,
    },

    /// Store only if the CAS token still matches
    Cas {
        key: String,
        flags: u32,
        exptime: u64,
        cas: u64,
        noreply: bool,
        value: Bytes,
    },

    Delete {
        key: String,
        noreply: bool,
    },

    Incr {
        key: String,
        delta: u64,
        noreply: bool,
    },

    Decr {
        key: String,
        delta: u64,
        noreply: bool,
    },

    FlushAll {
        delay: u64,
        noreply: bool,
    },

    Stats,
    Version,
    /// Close this connection
    Quit,
    /// Stop the server
    Shutdown,
}

/// Why a command line could not be interpreted
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Malformed command line
    InvalidCommand(String),
    /// Key longer than [`MAX_KEY_LENGTH`]
    KeyTooLong(String),
    /// A numeric field failed to parse
    InvalidNumber(String),
    /// Command verb is not recognized
    UnknownCommand(String),
    /// Storage data block not terminated by CRLF
    BadDataChunk,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidCommand(msg) => write!(f, "invalid command: {}", msg),
            ParseError::KeyTooLong(key) => write!(f, "key too long: {}", key),
            ParseError::InvalidNumber(msg) => write!(f, "invalid number: {}", msg),
            ParseError::UnknownCommand(cmd) => write!(f, "unknown command: {}", cmd),
            ParseError::BadDataChunk => write!(f, "bad data chunk"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of one parse attempt against the buffer
#[derive(Debug)]
pub enum ParseResult {
    /// A full request; the second field is the bytes it occupies
    Complete(Command, usize),
    /// More bytes are needed. When the command line has already announced
    /// its size, `total_needed` is the full request length.
    NeedMore { total_needed: Option<usize> },
    /// The request is bad; the second field is the bytes to discard
    Error(ParseError, usize),
}

/// Parse one command from the front of `buffer`.
pub fn parse(buffer: &[u8]) -> ParseResult {
    let line_end = match find_crlf(buffer) {
        Some(pos) => pos,
        None => return ParseResult::NeedMore { total_needed: None },
    };
    let line_bytes = line_end + 2;

    let line = match str::from_utf8(&buffer[..line_end]) {
        Ok(s) => s,
        Err(_) => {
            return ParseResult::Error(
                ParseError::InvalidCommand("invalid UTF-8 in command".to_string()),
                line_bytes,
            )
        }
    };

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return ParseResult::Error(
            ParseError::InvalidCommand("empty command".to_string()),
            line_bytes,
        );
    }

    match parts[0].to_lowercase().as_str() {
        "get" => parse_get(&parts, false, line_bytes),
        "gets" => parse_get(&parts, true, line_bytes),
        "set" => parse_store(buffer, &parts, StoreMode::Set, line_bytes),
        "add" => parse_store(buffer, &parts, StoreMode::Add, line_bytes),
        "replace" => parse_store(buffer, &parts, StoreMode::Replace, line_bytes),
        "append" => parse_store(buffer, &parts, StoreMode::Append, line_bytes),
        "prepend" => parse_store(buffer, &parts, StoreMode::Prepend, line_bytes),
        "cas" => parse_cas(buffer, &parts, line_bytes),
        "delete" => parse_delete(&parts, line_bytes),
        "incr" => parse_counter(&parts, true, line_bytes),
        "decr" => parse_counter(&parts, false, line_bytes),
        "flush_all" => parse_flush_all(&parts, line_bytes),
        "stats" => ParseResult::Complete(Command::Stats, line_bytes),
        "version" => ParseResult::Complete(Command::Version, line_bytes),
        "quit" => ParseResult::Complete(Command::Quit, line_bytes),
        "shutdown" => ParseResult::Complete(Command::Shutdown, line_bytes),
        other => ParseResult::Error(ParseError::UnknownCommand(other.to_string()), line_bytes),
    }
}

/// get/gets: `get <key>+`
fn parse_get(parts: &[&str], with_cas: bool, line_bytes: usize) -> ParseResult {
    if parts.len() < 2 {
        return ParseResult::Error(
            ParseError::InvalidCommand("get requires at least one key".to_string()),
            line_bytes,
        );
    }

    let mut keys = Vec::with_capacity(parts.len() - 1);
    for &key in &parts[1..] {
        if key.len() > MAX_KEY_LENGTH {
            return ParseResult::Error(ParseError::KeyTooLong(key.to_string()), line_bytes);
        }
        keys.push(key.to_string());
    }

    ParseResult::Complete(Command::Get { keys, with_cas }, line_bytes)
}

/// Storage commands: `<verb> <key> <flags> <exptime> <bytes> [noreply]`
/// followed by a data block of `<bytes>` and a CRLF.
fn parse_store(buffer: &[u8], parts: &[&str], mode: StoreMode, line_bytes: usize) -> ParseResult {
    if parts.len() < 5 {
        return ParseResult::Error(
            ParseError::InvalidCommand(format!(
                "{} requires key, flags, exptime, and bytes",
                parts[0]
            )),
            line_bytes,
        );
    }

    let key = match check_key(parts[1], line_bytes) {
        Ok(key) => key,
        Err(result) => return result,
    };
    let flags = match parse_number::<u32>(parts[2], "flags", line_bytes) {
        Ok(n) => n,
        Err(result) => return result,
    };
    let exptime = match parse_number::<u64>(parts[3], "exptime", line_bytes) {
        Ok(n) => n,
        Err(result) => return result,
    };
    let nbytes = match parse_number::<usize>(parts[4], "bytes", line_bytes) {
        Ok(n) => n,
        Err(result) => return result,
    };
    let noreply = parts.len() > 5 && parts[5].eq_ignore_ascii_case("noreply");

    let value = match read_data_block(buffer, line_bytes, nbytes) {
        Ok(value) => value,
        Err(result) => return result,
    };

    ParseResult::Complete(
        Command::Store {
            mode,
            key,
            flags,
            exptime,
            noreply,
            value,
        },
        line_bytes + nbytes + 2,
    )
}

/// cas: `cas <key> <flags> <exptime> <bytes> <cas unique> [noreply]`
fn parse_cas(buffer: &[u8], parts: &[&str], line_bytes: usize) -> ParseResult {
    if parts.len() < 6 {
        return ParseResult::Error(
            ParseError::InvalidCommand(
                "cas requires key, flags, exptime, bytes, and cas unique".to_string(),
            ),
            line_bytes,
        );
    }

    let key = match check_key(parts[1], line_bytes) {
        Ok(key) => key,
        Err(result) => return result,
    };
    let flags = match parse_number::<u32>(parts[2], "flags", line_bytes) {
        Ok(n) => n,
        Err(result) => return result,
    };
    let exptime = match parse_number::<u64>(parts[3], "exptime", line_bytes) {
        Ok(n) => n,
        Err(result) => return result,
    };
    let nbytes = match parse_number::<usize>(parts[4], "bytes", line_bytes) {
        Ok(n) => n,
        Err(result) => return result,
    };
    let cas = match parse_number::<u64>(parts[5], "cas unique", line_bytes) {
        Ok(n) => n,
        Err(result) => return result,
    };
    let noreply = parts.len() > 6 && parts[6].eq_ignore_ascii_case("noreply");

    let value = match read_data_block(buffer, line_bytes, nbytes) {
        Ok(value) => value,
        Err(result) => return result,
    };

    ParseResult::Complete(
        Command::Cas {
            key,
            flags,
            exptime,
            cas,
            noreply,
            value,
        },
        line_bytes + nbytes + 2,
    )
}

/// delete: `delete <key> [noreply]`
fn parse_delete(parts: &[&str], line_bytes: usize) -> ParseResult {
    if parts.len() < 2 {
        return ParseResult::Error(
            ParseError::InvalidCommand("delete requires a key".to_string()),
            line_bytes,
        );
    }

    let key = match check_key(parts[1], line_bytes) {
        Ok(key) => key,
        Err(result) => return result,
    };
    let noreply = parts.len() > 2 && parts[2].eq_ignore_ascii_case("noreply");

    ParseResult::Complete(Command::Delete { key, noreply }, line_bytes)
}

/// incr/decr: `<verb> <key> <value> [noreply]`
fn parse_counter(parts: &[&str], increment: bool, line_bytes: usize) -> ParseResult {
    if parts.len() < 3 {
        return ParseResult::Error(
            ParseError::InvalidCommand(format!(
                "{} requires key and value",
                if increment { "incr" } else { "decr" }
            )),
            line_bytes,
        );
    }

    let key = match check_key(parts[1], line_bytes) {
        Ok(key) => key,
        Err(result) => return result,
    };
    let delta = match parse_number::<u64>(parts[2], "value", line_bytes) {
        Ok(n) => n,
        Err(result) => return result,
    };
    let noreply = parts.len() > 3 && parts[3].eq_ignore_ascii_case("noreply");

    let command = if increment {
        Command::Incr {
            key,
            delta,
            noreply,
        }
    } else {
        Command::Decr {
            key,
            delta,
            noreply,
        }
    };

    ParseResult::Complete(command, line_bytes)
}

/// flush_all: `flush_all [delay] [noreply]`
fn parse_flush_all(parts: &[&str], line_bytes: usize) -> ParseResult {
    let mut delay = 0u64;
    let mut noreply = false;

    if parts.len() > 1 {
        if parts[1].eq_ignore_ascii_case("noreply") {
            noreply = true;
        } else {
            delay = parts[1].parse().unwrap_or(0);
            if parts.len() > 2 && parts[2].eq_ignore_ascii_case("noreply") {
                noreply = true;
            }
        }
    }

    ParseResult::Complete(Command::FlushAll { delay, noreply }, line_bytes)
}

fn check_key(key: &str, line_bytes: usize) -> Result<String, ParseResult> {
    if key.len() > MAX_KEY_LENGTH {
        Err(ParseResult::Error(
            ParseError::KeyTooLong(key.to_string()),
            line_bytes,
        ))
    } else {
        Ok(key.to_string())
    }
}

fn parse_number<T: str::FromStr>(
    field: &str,
    name: &str,
    line_bytes: usize,
) -> Result<T, ParseResult> {
    field.parse().map_err(|_| {
        ParseResult::Error(
            ParseError::InvalidNumber(format!("invalid {}: {}", name, field)),
            line_bytes,
        )
    })
}

/// Extract the CRLF-terminated data block that follows a storage command.
fn read_data_block(buffer: &[u8], line_bytes: usize, nbytes: usize) -> Result<Bytes, ParseResult> {
    let total = line_bytes + nbytes + 2;
    if buffer.len() < total {
        return Err(ParseResult::NeedMore {
            total_needed: Some(total),
        });
    }
    if &buffer[line_bytes + nbytes..total] != b"\r\n" {
        return Err(ParseResult::Error(ParseError::BadDataChunk, total));
    }
    Ok(Bytes::copy_from_slice(
        &buffer[line_bytes..line_bytes + nbytes],
    ))
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(2)
        .position(|window| window == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        match parse(b"get key1 key2 key3\r\n") {
            ParseResult::Complete(Command::Get { keys, with_cas }, consumed) => {
                assert_eq!(keys, vec!["key1", "key2", "key3"]);
                assert!(!with_cas);
                assert_eq!(consumed, 20);
            }
            other => panic!("expected Get, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_gets() {
        match parse(b"gets key1\r\n") {
            ParseResult::Complete(Command::Get { keys, with_cas }, _) => {
                assert_eq!(keys, vec!["key1"]);
                assert!(with_cas);
            }
            other => panic!("expected Get, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_set_with_data() {
        match parse(b"set mykey 3 3600 5\r\nhello\r\n") {
            ParseResult::Complete(
                Command::Store {
                    mode,
                    key,
                    flags,
                    exptime,
                    noreply,
                    value,
                },
                consumed,
            ) => {
                assert_eq!(mode, StoreMode::Set);
                assert_eq!(key, "mykey");
                assert_eq!(flags, 3);
                assert_eq!(exptime, 3600);
                assert!(!noreply);
                assert_eq!(value, Bytes::from_static(b"hello"));
                assert_eq!(consumed, 27);
            }
            other => panic!("expected Store, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_set_waits_for_data_block() {
        match parse(b"set mykey 0 3600 5\r\nhel") {
            ParseResult::NeedMore { total_needed } => {
                assert_eq!(total_needed, Some(27));
            }
            other => panic!("expected NeedMore, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_set_noreply() {
        match parse(b"set mykey 0 3600 5 noreply\r\nhello\r\n") {
            ParseResult::Complete(Command::Store { noreply, .. }, _) => assert!(noreply),
            other => panic!("expected Store, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_bad_data_chunk() {
        match parse(b"set mykey 0 0 5\r\nhelloXX") {
            ParseResult::Error(ParseError::BadDataChunk, consumed) => {
                assert_eq!(consumed, 24);
            }
            other => panic!("expected BadDataChunk, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_cas() {
        match parse(b"cas mykey 0 3600 5 12345\r\nhello\r\n") {
            ParseResult::Complete(Command::Cas { key, cas, .. }, _) => {
                assert_eq!(key, "mykey");
                assert_eq!(cas, 12345);
            }
            other => panic!("expected Cas, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete() {
        match parse(b"delete mykey\r\n") {
            ParseResult::Complete(Command::Delete { key, noreply }, _) => {
                assert_eq!(key, "mykey");
                assert!(!noreply);
            }
            other => panic!("expected Delete, got {other:?}"),
        }

        match parse(b"delete mykey noreply\r\n") {
            ParseResult::Complete(Command::Delete { noreply, .. }, _) => assert!(noreply),
            other => panic!("expected Delete, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_counters() {
        match parse(b"incr counter 5\r\n") {
            ParseResult::Complete(
                Command::Incr {
                    key,
                    delta,
                    noreply,
                },
                _,
            ) => {
                assert_eq!(key, "counter");
                assert_eq!(delta, 5);
                assert!(!noreply);
            }
            other => panic!("expected Incr, got {other:?}"),
        }

        match parse(b"decr counter 3 noreply\r\n") {
            ParseResult::Complete(Command::Decr { delta, noreply, .. }, _) => {
                assert_eq!(delta, 3);
                assert!(noreply);
            }
            other => panic!("expected Decr, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_flush_all() {
        match parse(b"flush_all\r\n") {
            ParseResult::Complete(Command::FlushAll { delay, noreply }, _) => {
                assert_eq!(delay, 0);
                assert!(!noreply);
            }
            other => panic!("expected FlushAll, got {other:?}"),
        }

        match parse(b"flush_all 30 noreply\r\n") {
            ParseResult::Complete(Command::FlushAll { delay, noreply }, _) => {
                assert_eq!(delay, 30);
                assert!(noreply);
            }
            other => panic!("expected FlushAll, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_plain_commands() {
        assert!(matches!(
            parse(b"stats\r\n"),
            ParseResult::Complete(Command::Stats, 7)
        ));
        assert!(matches!(
            parse(b"version\r\n"),
            ParseResult::Complete(Command::Version, _)
        ));
        assert!(matches!(
            parse(b"quit\r\n"),
            ParseResult::Complete(Command::Quit, _)
        ));
        assert!(matches!(
            parse(b"shutdown\r\n"),
            ParseResult::Complete(Command::Shutdown, _)
        ));
    }

    #[test]
    fn test_parse_incomplete_line() {
        assert!(matches!(
            parse(b"get key"),
            ParseResult::NeedMore { total_needed: None }
        ));
    }

    #[test]
    fn test_parse_unknown_command() {
        match parse(b"bogus command\r\n") {
            ParseResult::Error(ParseError::UnknownCommand(cmd), consumed) => {
                assert_eq!(cmd, "bogus");
                assert_eq!(consumed, 15);
            }
            other => panic!("expected UnknownCommand, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_invalid_number() {
        assert!(matches!(
            parse(b"set k abc 0 5\r\n"),
            ParseResult::Error(ParseError::InvalidNumber(_), _)
        ));
        assert!(matches!(
            parse(b"incr k notanumber\r\n"),
            ParseResult::Error(ParseError::InvalidNumber(_), _)
        ));
    }

    #[test]
    fn test_key_too_long() {
        let long_key = "k".repeat(MAX_KEY_LENGTH + 1);
        let buffer = format!("get {long_key}\r\n");
        assert!(matches!(
            parse(buffer.as_bytes()),
            ParseResult::Error(ParseError::KeyTooLong(_), _)
        ));
    }
}
