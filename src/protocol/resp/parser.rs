//! Incremental RESP Request Parser
//!
//! Clients send commands either as an array of bulk strings
//! (`*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`) or as an inline line
//! (`GET name\r\n`). The parser never copies argument bytes: it reports the
//! byte ranges of each argument plus the total frame length, and the codec
//! slices them out of the frozen frame.
//!
//! The parser returns either:
//! - `Ok(Some((ranges, consumed)))` - a full request occupies `consumed` bytes
//! - `Ok(None)` - the request is incomplete
//! - `Err(FrameError)` - the bytes cannot be a RESP request

use super::types::{prefix, CRLF};
use crate::protocol::{find_crlf, FrameError, MAX_VALUE_SIZE};
use std::ops::Range;

/// Longest inline command or length header before the client is cut off.
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Most arguments accepted in one request.
pub const MAX_ARGS: usize = 1024 * 1024;

/// Byte ranges of each argument, and the total frame length.
pub type Parsed = (Vec<Range<usize>>, usize);

#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        Self
    }

    /// Attempts to parse one request from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> Result<Option<Parsed>, FrameError> {
        match buf.first() {
            None => Ok(None),
            Some(&prefix::ARRAY) => self.parse_array(buf),
            Some(_) => self.parse_inline(buf),
        }
    }

    /// `*<count>\r\n` followed by `count` bulk strings.
    fn parse_array(&mut self, buf: &[u8]) -> Result<Option<Parsed>, FrameError> {
        let Some((count, mut consumed)) = read_length(buf)? else {
            return Ok(None);
        };

        // A null or empty array is an empty request; the codec skips it.
        if count <= 0 {
            return Ok(Some((Vec::new(), consumed)));
        }
        let count = count as usize;
        if count > MAX_ARGS {
            return Err(FrameError::malformed("invalid multibulk length"));
        }

        let mut args = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let rest = &buf[consumed..];
            match rest.first() {
                None => return Ok(None),
                Some(&prefix::BULK_STRING) => {}
                Some(&other) => {
                    return Err(FrameError::malformed(format!(
                        "expected '$', got '{}'",
                        other as char
                    )))
                }
            }

            let Some((len, header)) = read_length(rest)? else {
                return Ok(None);
            };
            if len < 0 {
                return Err(FrameError::InvalidLength(len));
            }
            let len = len as usize;
            if len > MAX_VALUE_SIZE {
                return Err(FrameError::TooLarge {
                    size: len,
                    max: MAX_VALUE_SIZE,
                });
            }

            let start = consumed + header;
            let end = start + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != CRLF {
                return Err(FrameError::malformed("bulk string missing trailing CRLF"));
            }

            args.push(start..end);
            consumed = end + 2;
        }

        Ok(Some((args, consumed)))
    }

    /// A whitespace separated line terminated by CRLF.
    fn parse_inline(&mut self, buf: &[u8]) -> Result<Option<Parsed>, FrameError> {
        let Some(pos) = find_crlf(buf) else {
            if buf.len() > MAX_INLINE_SIZE {
                return Err(FrameError::malformed("too big inline request"));
            }
            return Ok(None);
        };

        let mut args = Vec::new();
        let mut start = None;
        for (i, byte) in buf[..pos].iter().enumerate() {
            match (byte.is_ascii_whitespace(), start) {
                (true, Some(s)) => {
                    args.push(s..i);
                    start = None;
                }
                (false, None) => start = Some(i),
                _ => {}
            }
        }
        if let Some(s) = start {
            args.push(s..pos);
        }

        Ok(Some((args, pos + 2)))
    }
}

/// Reads a `<prefix><integer>\r\n` header, returning the integer and the
/// header length.
fn read_length(buf: &[u8]) -> Result<Option<(i64, usize)>, FrameError> {
    let Some(pos) = find_crlf(&buf[1..]) else {
        if buf.len() > MAX_INLINE_SIZE {
            return Err(FrameError::malformed("length header too long"));
        }
        return Ok(None);
    };

    let digits = &buf[1..1 + pos];
    let n = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| FrameError::InvalidInteger(String::from_utf8_lossy(digits).into_owned()))?;

    Ok(Some((n, 1 + pos + 2)))
}
