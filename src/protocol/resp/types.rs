//! RESP (Redis Serialization Protocol) Reply Types
//!
//! Each RESP type starts with a type prefix byte and ends with CRLF:
//!
//! - `+` Simple String: `+OK\r\n`
//! - `-` Error: `-ERR unknown command\r\n`
//! - `:` Integer: `:1000\r\n`
//! - `$` Bulk String: `$5\r\nhello\r\n`, null as `$-1\r\n`
//! - `*` Array: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`

use crate::commands::{CommandError, Reply};
use crate::storage::CasOutcome;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A RESP value as sent back to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`, must not contain CR or LF
    SimpleString(String),

    /// `-<message>\r\n`
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<len>\r\n<bytes>\r\n`, binary safe
    BulkString(Bytes),

    /// Null bulk string `$-1\r\n`
    Null,

    /// `*<count>\r\n<elements...>`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    fn bulk_or_null(value: Option<Bytes>) -> Self {
        value.map_or(RespValue::Null, RespValue::BulkString)
    }

    /// Serializes the value into `buf` in wire format.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buf.put_u8(prefix::SIMPLE_STRING);
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.put_u8(prefix::ERROR);
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.put_u8(prefix::INTEGER);
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.reserve(data.len() + 16);
                buf.put_u8(prefix::BULK_STRING);
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Null => buf.put_slice(b"$-1\r\n"),
            RespValue::Array(values) => {
                buf.put_u8(prefix::ARRAY);
                buf.put_slice(values.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Serializes the value into a fresh buffer.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf
    }
}

impl From<Reply> for RespValue {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Ok | Reply::Close | Reply::Stored(true) => RespValue::ok(),
            Reply::Stored(false) | Reply::NotFound => RespValue::Null,
            Reply::Status(status) => RespValue::simple_string(status),
            Reply::Bulk(value) => RespValue::bulk_or_null(value),
            Reply::Integer(n) => RespValue::Integer(n),
            // Unsigned results may exceed i64, so they travel as text.
            Reply::Unsigned(n) => RespValue::SimpleString(n.to_string()),
            Reply::Values(values) => {
                RespValue::Array(values.into_iter().map(RespValue::bulk_or_null).collect())
            }
            Reply::Items(items) => RespValue::Array(
                items
                    .into_iter()
                    .map(|item| RespValue::BulkString(item.value))
                    .collect(),
            ),
            Reply::Entries(entries) => RespValue::Array(
                entries
                    .into_iter()
                    .map(|entry| match entry {
                        Some(item) => RespValue::Array(vec![
                            RespValue::Integer(item.version as i64),
                            RespValue::BulkString(item.value),
                        ]),
                        None => RespValue::Null,
                    })
                    .collect(),
            ),
            Reply::Stats(stats) => RespValue::Array(
                stats
                    .into_iter()
                    .map(|(name, value)| {
                        RespValue::Array(vec![
                            RespValue::BulkString(Bytes::from_static(name.as_bytes())),
                            RespValue::BulkString(Bytes::from(value)),
                        ])
                    })
                    .collect(),
            ),
            Reply::Cas(outcome) => match outcome {
                CasOutcome::Stored => RespValue::ok(),
                CasOutcome::Exists | CasOutcome::NotFound => RespValue::Null,
            },
        }
    }
}

impl From<&CommandError> for RespValue {
    fn from(err: &CommandError) -> Self {
        RespValue::Error(format!("ERR {}", err))
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) if values.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    writeln!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}
