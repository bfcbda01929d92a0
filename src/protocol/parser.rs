//! Incremental RESP Parser
//!
//! The parser works on a borrowed buffer and never consumes it. Each call
//! returns one of:
//! - `Ok(Some((value, consumed)))`: a complete value; advance the buffer by `consumed`
//! - `Ok(None)`: the value is not complete yet; read more bytes and retry
//! - `Err(ParseError)`: the peer violated the protocol
//!
//! The same parser reads both directions of the gateway. In [`ParseMode::Command`]
//! a line without a type prefix is accepted as an inline command (what
//! `telnet` or `redis-cli` in raw mode sends). In [`ParseMode::Reply`] such a
//! line is an error, since a store never answers that way.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Negative length other than the `-1` null marker
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// Which side of the conversation the parser is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Client commands; inline commands allowed.
    #[default]
    Command,
    /// Server replies; every value must carry a type prefix.
    Reply,
}

/// A RESP parser for one direction of one connection.
#[derive(Debug, Default)]
pub struct RespParser {
    mode: ParseMode,
}

impl RespParser {
    /// Parser for commands sent by gateway clients.
    pub fn new() -> Self {
        Self {
            mode: ParseMode::Command,
        }
    }

    /// Parser for replies coming back from a backend store.
    pub fn for_replies() -> Self {
        Self {
            mode: ParseMode::Reply,
        }
    }

    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    /// Attempts to parse one value from the front of `buf`.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        match buf[0] {
            prefix::SIMPLE_STRING
            | prefix::ERROR
            | prefix::INTEGER
            | prefix::BULK_STRING
            | prefix::ARRAY => parse_value(buf, 0),
            other => match self.mode {
                ParseMode::Command => parse_inline(buf),
                ParseMode::Reply => Err(ParseError::UnknownPrefix(other)),
            },
        }
    }
}

fn parse_value(buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::ProtocolError(format!(
            "maximum nesting depth exceeded: {}",
            MAX_NESTING_DEPTH
        )));
    }

    let (line, header_len) = match read_line(&buf[1..])? {
        Some((line, used)) => (line, 1 + used),
        None => return Ok(None),
    };

    match buf[0] {
        prefix::SIMPLE_STRING => Ok(Some((
            RespValue::SimpleString(line.to_string()),
            header_len,
        ))),
        prefix::ERROR => Ok(Some((RespValue::Error(line.to_string()), header_len))),
        prefix::INTEGER => Ok(Some((RespValue::Integer(parse_int(line)?), header_len))),
        prefix::BULK_STRING => {
            let length = parse_int(line)?;
            if length == -1 {
                return Ok(Some((RespValue::Null, header_len)));
            }
            if length < 0 {
                return Err(ParseError::InvalidBulkLength(length));
            }
            let length = length as usize;
            if length > MAX_BULK_SIZE {
                return Err(ParseError::MessageTooLarge {
                    size: length,
                    max: MAX_BULK_SIZE,
                });
            }

            let total = header_len + length + CRLF.len();
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[header_len + length..total] != CRLF {
                return Err(ParseError::ProtocolError(
                    "bulk string missing trailing CRLF".to_string(),
                ));
            }
            let data = Bytes::copy_from_slice(&buf[header_len..header_len + length]);
            Ok(Some((RespValue::BulkString(data), total)))
        }
        prefix::ARRAY => {
            let count = parse_int(line)?;
            if count == -1 {
                return Ok(Some((RespValue::Null, header_len)));
            }
            if count < 0 {
                return Err(ParseError::InvalidArrayLength(count));
            }

            let mut consumed = header_len;
            let mut elements = Vec::with_capacity((count as usize).min(1024));
            for _ in 0..count {
                match parse_value(&buf[consumed..], depth + 1)? {
                    Some((value, used)) => {
                        elements.push(value);
                        consumed += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(elements), consumed)))
        }
        other => Err(ParseError::UnknownPrefix(other)),
    }
}

/// Parses a whitespace separated inline command such as `PING` or `AUTH abc`.
fn parse_inline(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let (line, used) = match read_line(buf)? {
        Some(found) => found,
        None => return Ok(None),
    };

    let parts: Vec<RespValue> = line
        .split_whitespace()
        .map(|part| RespValue::BulkString(Bytes::copy_from_slice(part.as_bytes())))
        .collect();
    if parts.is_empty() {
        return Err(ParseError::ProtocolError("empty inline command".to_string()));
    }

    Ok(Some((RespValue::Array(parts), used)))
}

/// Returns the UTF-8 text before the first CRLF and the bytes used including it.
fn read_line(buf: &[u8]) -> ParseResult<Option<(&str, usize)>> {
    match find_crlf(buf) {
        Some(pos) => {
            let line = std::str::from_utf8(&buf[..pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((line, pos + CRLF.len())))
        }
        None => Ok(None),
    }
}

fn parse_int(s: &str) -> ParseResult<i64> {
    s.parse()
        .map_err(|e: std::num::ParseIntError| ParseError::InvalidInteger(format!("{s:?}: {e}")))
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a single client command from bytes.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

/// Parses a single backend reply from bytes.
pub fn parse_reply(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::for_replies().parse(buf)
}
