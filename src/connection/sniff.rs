//! Protocol sniffing.
//!
//! Looks at the first bytes a client sends and decides which adapter serves
//! the connection. Nothing is consumed: the bytes stay in the connection
//! buffer and the chosen codec decodes them as its first request.
//!
//! ```text
//! 00 00 00 08 04 d2 16 2f    Postgres (length + SSLRequest code)
//! *1\r\n$4\r\nPING\r\n       RESP multibulk
//! GET /key HTTP/1.1\r\n      HTTP request line
//! get key\r\n                memcached (lowercase verb)
//! PING\r\n                   RESP inline
//! ```

use crate::commands::parse::is_known;
use crate::protocol::postgres::{
    CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, MAX_STARTUP_SIZE, PROTOCOL_VERSION, SSL_REQUEST_CODE,
};
use crate::protocol::Protocol;

/// Bytes examined before giving up on a connection.
pub const SNIFF_LIMIT: usize = 4096;

const MEMCACHE_VERBS: &[&[u8]] = &[
    b"get",
    b"gets",
    b"set",
    b"add",
    b"replace",
    b"append",
    b"prepend",
    b"cas",
    b"delete",
    b"incr",
    b"decr",
    b"touch",
    b"flush_all",
    b"stats",
    b"version",
    b"quit",
];

/// Result of looking at a connection prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// Not enough bytes yet.
    Pending,
    Matched(Protocol),
    /// No adapter speaks this.
    Rejected,
}

/// Classifies a connection from the bytes received so far.
pub fn classify(buf: &[u8]) -> Sniff {
    match buf.first() {
        None => Sniff::Pending,
        Some(0) => classify_postgres(buf),
        Some(b'*') => Sniff::Matched(Protocol::Resp),
        Some(_) => classify_text(buf),
    }
}

fn classify_postgres(buf: &[u8]) -> Sniff {
    if buf.len() < 8 {
        return Sniff::Pending;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let known = matches!(
        code,
        PROTOCOL_VERSION | SSL_REQUEST_CODE | GSSENC_REQUEST_CODE | CANCEL_REQUEST_CODE
    );
    if known && (8..=MAX_STARTUP_SIZE).contains(&len) {
        Sniff::Matched(Protocol::Postgres)
    } else {
        Sniff::Rejected
    }
}

fn classify_text(buf: &[u8]) -> Sniff {
    let Some(end) = buf.iter().position(|b| matches!(b, b' ' | b'\r' | b'\n')) else {
        return pending_or_rejected(buf);
    };
    let word = &buf[..end];
    if word.is_empty() {
        return Sniff::Rejected;
    }

    // An uppercase word followed by a space may start an HTTP request line;
    // that needs the whole line.
    if buf[end] == b' ' && word.iter().all(u8::is_ascii_uppercase) {
        let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
            return pending_or_rejected(buf);
        };
        let line = &buf[..newline];
        if is_http_request_line(line.strip_suffix(b"\r").unwrap_or(line)) {
            return Sniff::Matched(Protocol::Http);
        }
    }

    if MEMCACHE_VERBS.contains(&word) {
        Sniff::Matched(Protocol::Memcache)
    } else if word[0].is_ascii_uppercase() || is_known(word) {
        Sniff::Matched(Protocol::Resp)
    } else {
        Sniff::Rejected
    }
}

fn pending_or_rejected(buf: &[u8]) -> Sniff {
    if buf.len() >= SNIFF_LIMIT {
        Sniff::Rejected
    } else {
        Sniff::Pending
    }
}

/// `METHOD SP target SP HTTP/d.d`
fn is_http_request_line(line: &[u8]) -> bool {
    let mut parts = line.split(|b| *b == b' ');
    let (Some(_method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    target.starts_with(b"/")
        && version.len() == 8
        && version.starts_with(b"HTTP/")
        && version[5].is_ascii_digit()
        && version[6] == b'.'
        && version[7].is_ascii_digit()
}
