//! Protocol Adapters
//!
//! Four independent wire codecs share one shape, the [`Codec`] trait: pull
//! one request off the connection buffer, run it through the command set,
//! and append the encoded reply to the output buffer.
//!
//! ## Modules
//!
//! - `resp`: Redis serialization protocol, including inline commands
//! - `memcache`: memcached text protocol
//! - `http`: plain HTTP/1.x key/value endpoint
//! - `postgres`: a tiny statement set over the Postgres v3 wire protocol
//!
//! Decoders never consume a partial frame: on `Ok(None)` the buffer is left
//! untouched and the connection reads more bytes.

use crate::commands::CommandHandler;
use bytes::BytesMut;
use std::fmt;
use thiserror::Error;

pub mod http;
pub mod memcache;
pub mod postgres;
pub mod resp;

pub use http::HttpCodec;
pub use memcache::MemcacheCodec;
pub use postgres::PostgresCodec;
pub use resp::{RespCodec, RespValue};

/// Largest single value any adapter accepts (512 MB, same as Redis).
pub const MAX_VALUE_SIZE: usize = 512 * 1024 * 1024;

/// Longest key the memcached and HTTP adapters accept.
pub const MAX_KEY_SIZE: usize = 250;

/// The wire protocol a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Memcache,
    Resp,
    Http,
    Postgres,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Memcache => "memcache",
            Protocol::Resp => "resp",
            Protocol::Http => "http",
            Protocol::Postgres => "postgres",
        })
    }
}

/// Unrecoverable framing errors. The connection reports the error in its
/// own protocol and then closes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid length: {0}")]
    InvalidLength(i64),

    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("bad data chunk")]
    BadDataChunk,

    #[error("{0}")]
    Malformed(String),
}

impl FrameError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        FrameError::Malformed(msg.into())
    }
}

/// What the connection does after a request has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Flush pending output, then close.
    Close,
}

/// A protocol adapter: decode a request, execute it, encode the reply.
pub trait Codec: Send {
    type Request: Send;

    /// Decodes one complete request from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched if more bytes are needed.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Request>, FrameError>;

    /// Executes `request` and appends the encoded reply to `out`.
    fn handle(&mut self, request: Self::Request, commands: &CommandHandler, out: &mut BytesMut) -> Flow;

    /// Appends this protocol's rendering of a fatal framing error.
    fn encode_error(&mut self, err: &FrameError, out: &mut BytesMut);
}

/// Position of the first `\r\n` in `buf`.
#[inline]
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
