//! Plain HTTP/1.x key/value adapter.
//!
//! | Request              | Command | Success body     | Miss            |
//! |----------------------|---------|------------------|-----------------|
//! | `PUT /<key>` + body  | SET     | `Stored\r\n`     | 404 `Not Found` |
//! | `GET /<key>`         | GET     | the raw value    | 404 `Not Found` |
//! | `DELETE /<key>`      | DEL     | `Deleted\r\n`    | (always 200)    |
//!
//! `PUT` understands the query parameters `ttl`/`ex` (seconds), `flags`,
//! `cas`, `nx` and `xx`. Only `Content-Length` bodies are supported.

use crate::commands::{Command, CommandError, CommandHandler, Expiry, Reply};
use crate::protocol::{Codec, Flow, FrameError, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::storage::{CasOutcome, SetCondition};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::debug;

/// Largest request head (request line plus headers).
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Bytes,
    /// Request target with the leading `/` and the query string removed.
    pub path: Bytes,
    pub query: Bytes,
    pub body: Bytes,
    pub keep_alive: bool,
}

/// A complete response, rendered by [`Response::write`].
struct Response<'a> {
    code: u16,
    status: &'static str,
    body: &'a [u8],
}

impl<'a> Response<'a> {
    const fn new(code: u16, status: &'static str, body: &'a [u8]) -> Self {
        Self { code, status, body }
    }

    fn ok(body: &'a [u8]) -> Self {
        Self::new(200, "OK", body)
    }

    fn write(&self, out: &mut BytesMut, keep_alive: bool) {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
            self.code,
            self.status,
            self.body.len(),
            if keep_alive { "keep-alive" } else { "close" }
        );
        out.reserve(head.len() + self.body.len());
        out.put_slice(head.as_bytes());
        out.put_slice(self.body);
    }
}

const NOT_FOUND: Response<'static> = Response::new(404, "Not Found", b"Not Found\r\n");
const BAD_REQUEST: Response<'static> = Response::new(400, "Bad Request", b"Bad Request\r\n");
const INVALID_KEY: Response<'static> = Response::new(400, "Bad Request", b"Invalid Key\r\n");
const NOT_ALLOWED: Response<'static> =
    Response::new(405, "Method Not Allowed", b"Method Not Allowed\r\n");

/// HTTP/1.x codec.
#[derive(Debug, Default)]
pub struct HttpCodec;

impl HttpCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Length of the request head and the offset of the body. Lines may end in
/// `\r\n` or a bare `\n`.
fn head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(at) = buf[from..].iter().position(|b| *b == b'\n') {
        let newline = from + at;
        let head_len = if newline > 0 && buf[newline - 1] == b'\r' {
            newline - 1
        } else {
            newline
        };
        match &buf[newline + 1..] {
            [b'\n', ..] => return Some((head_len, newline + 2)),
            [b'\r', b'\n', ..] => return Some((head_len, newline + 3)),
            _ => from = newline + 1,
        }
    }
    None
}

impl Codec for HttpCodec {
    type Request = HttpRequest;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<HttpRequest>, FrameError> {
        let Some((head_len, body_start)) = head_end(buf) else {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(FrameError::malformed("request head too large"));
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..head_len])
            .map_err(|_| FrameError::malformed("request head is not valid UTF-8"))?;
        let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
        let request_line = lines.next().unwrap_or_default();

        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(FrameError::malformed("bad request line"));
        };
        let mut keep_alive = match version {
            "HTTP/1.1" => true,
            "HTTP/1.0" => false,
            _ => return Err(FrameError::malformed("unsupported HTTP version")),
        };
        if method.is_empty() || !target.starts_with('/') {
            return Err(FrameError::malformed("bad request line"));
        }

        let mut content_length = 0usize;
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::malformed("bad header line"))?;
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .parse()
                    .map_err(|_| FrameError::InvalidInteger(value.to_string()))?;
                if content_length > MAX_VALUE_SIZE {
                    return Err(FrameError::TooLarge {
                        size: content_length,
                        max: MAX_VALUE_SIZE,
                    });
                }
            } else if name.eq_ignore_ascii_case("connection") {
                if value.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if value.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                return Err(FrameError::malformed("transfer encodings are not supported"));
            }
        }

        if buf.len() < body_start + content_length {
            return Ok(None);
        }

        let method_len = method.len();
        let (path_range, query_range) = {
            let start = method_len + 2;
            let end = method_len + 1 + target.len();
            match target.find('?') {
                Some(q) => (start..method_len + 1 + q, method_len + 2 + q..end),
                None => (start..end, end..end),
            }
        };

        let frame = buf.split_to(body_start + content_length).freeze();
        Ok(Some(HttpRequest {
            method: frame.slice(..method_len),
            path: frame.slice(path_range),
            query: frame.slice(query_range),
            body: frame.slice(body_start..),
            keep_alive,
        }))
    }

    fn handle(&mut self, request: HttpRequest, commands: &CommandHandler, out: &mut BytesMut) -> Flow {
        let keep_alive = request.keep_alive;
        respond(request, commands, out, keep_alive);
        if keep_alive {
            Flow::Continue
        } else {
            Flow::Close
        }
    }

    fn encode_error(&mut self, err: &FrameError, out: &mut BytesMut) {
        debug!(error = %err, "rejecting HTTP request");
        BAD_REQUEST.write(out, false);
    }
}

fn respond(request: HttpRequest, commands: &CommandHandler, out: &mut BytesMut, keep_alive: bool) {
    let HttpRequest {
        method,
        path,
        query,
        body,
        ..
    } = request;

    if !matches!(&method[..], b"GET" | b"PUT" | b"DELETE") {
        return NOT_ALLOWED.write(out, keep_alive);
    }
    if !valid_key(&path) {
        return INVALID_KEY.write(out, keep_alive);
    }

    let command = match &method[..] {
        b"GET" => Command::Get { key: path },
        b"DELETE" => Command::Del { keys: vec![path] },
        _ => match put_command(path, body, &query) {
            Some(command) => command,
            None => return BAD_REQUEST.write(out, keep_alive),
        },
    };

    match commands.execute(command) {
        Ok(Reply::Bulk(Some(value))) => Response::ok(&value).write(out, keep_alive),
        Ok(Reply::Bulk(None))
        | Ok(Reply::Stored(false))
        | Ok(Reply::Cas(CasOutcome::Exists | CasOutcome::NotFound)) => {
            NOT_FOUND.write(out, keep_alive)
        }
        Ok(Reply::Integer(_)) => Response::ok(b"Deleted\r\n").write(out, keep_alive),
        Ok(_) => Response::ok(b"Stored\r\n").write(out, keep_alive),
        Err(CommandError::InvalidKey) => INVALID_KEY.write(out, keep_alive),
        Err(err) => {
            let body = format!("ERR {}\r\n", err);
            Response::new(500, "Internal Server Error", body.as_bytes()).write(out, keep_alive);
        }
    }
}

/// Builds the SET (or CAS) for a PUT, or `None` on a bad query string.
fn put_command(key: Bytes, value: Bytes, query: &[u8]) -> Option<Command> {
    let mut expiry = Expiry::Never;
    let mut flags = 0u32;
    let mut cas = None;
    let mut condition = SetCondition::Always;

    for pair in query.split(|b| *b == b'&').filter(|p| !p.is_empty()) {
        let (name, value) = match pair.iter().position(|b| *b == b'=') {
            Some(eq) => (&pair[..eq], &pair[eq + 1..]),
            None => (pair, &b""[..]),
        };
        match name {
            b"ttl" | b"ex" => {
                let secs: i64 = parse_num(value)?;
                expiry = if secs > 0 {
                    Expiry::In(Duration::from_secs(secs as u64))
                } else {
                    Expiry::Expired
                };
            }
            b"flags" => flags = parse_num(value)?,
            b"cas" => cas = Some(parse_num(value)?),
            b"nx" => condition = SetCondition::IfAbsent,
            b"xx" => condition = SetCondition::IfPresent,
            _ => {}
        }
    }

    Some(match cas {
        Some(version) => Command::Cas {
            key,
            value,
            flags,
            expiry,
            version,
        },
        None => Command::Set {
            key,
            value,
            condition,
            expiry,
            flags,
            get: false,
        },
    })
}

fn parse_num<T: std::str::FromStr>(value: &[u8]) -> Option<T> {
    std::str::from_utf8(value).ok()?.parse().ok()
}

fn valid_key(key: &[u8]) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_SIZE
        && key
            .iter()
            .all(|b| *b > b' ' && *b < 0x7f && !b"%+@$?=".contains(b))
}
