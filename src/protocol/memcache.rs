//! Memcached text protocol adapter.
//!
//! Requests are single `\r\n`-terminated lines. Storage commands carry a
//! data block of the declared length, and the request is only decoded once
//! the whole block (plus its `\r\n`) is buffered. A storage line that fails
//! validation after its length was understood still swallows its data block,
//! so a bad request never desynchronizes the stream.
//!
//! ```text
//! set <key> <flags> <exptime> <bytes> [noreply]\r\n<data>\r\n
//! cas <key> <flags> <exptime> <bytes> <cas unique> [noreply]\r\n<data>\r\n
//! get|gets <key>*\r\n
//! delete <key> [noreply]\r\n
//! incr|decr <key> <delta> [noreply]\r\n
//! touch <key> <exptime> [noreply]\r\n
//! flush_all [delay] [noreply]\r\n
//! stats\r\n
//! ```
//!
//! `flush_all` with a positive delay (an exptime, so relative seconds or a
//! unix timestamp) schedules the flush. It runs on the next expiry sweep
//! after the deadline.

use crate::commands::parse::unix_time;
use crate::commands::{Command, CommandError, CommandHandler, CounterOp, Expiry, Item, Reply};
use crate::protocol::{find_crlf, Codec, Flow, FrameError, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::storage::{CasOutcome, Direction, Placement, SetCondition};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Longest command line accepted (memcached uses the same limit).
pub const MAX_LINE_SIZE: usize = 2048;

/// Expiration times above this many seconds are absolute unix timestamps.
const MAX_RELATIVE_EXPTIME: i64 = 60 * 60 * 24 * 30;

const BAD_FORMAT: &str = "bad command line format";
const BAD_DELTA: &str = "invalid numeric delta argument";
const NON_NUMERIC: &str = "cannot increment or decrement non-numeric value";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreVerb {
    fn from_bytes(verb: &[u8]) -> Option<Self> {
        Some(match verb {
            b"set" => StoreVerb::Set,
            b"add" => StoreVerb::Add,
            b"replace" => StoreVerb::Replace,
            b"append" => StoreVerb::Append,
            b"prepend" => StoreVerb::Prepend,
            b"cas" => StoreVerb::Cas,
            _ => return None,
        })
    }

    /// Fields on the command line, verb included, without `noreply`.
    fn fields(self) -> usize {
        match self {
            StoreVerb::Cas => 6,
            _ => 5,
        }
    }
}

/// A storage request with its data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    pub verb: StoreVerb,
    pub key: Bytes,
    pub flags: u32,
    pub expiry: Expiry,
    pub value: Bytes,
    pub cas_unique: u64,
    pub noreply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemcacheRequest {
    Store(Store),
    Retrieve {
        keys: Vec<Bytes>,
        with_cas: bool,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    Arith {
        key: Bytes,
        delta: u64,
        direction: Direction,
        noreply: bool,
    },
    Touch {
        key: Bytes,
        expiry: Expiry,
        noreply: bool,
    },
    FlushAll {
        delay: Expiry,
        noreply: bool,
    },
    Stats,
    Version,
    Quit,
    /// A well-framed line with bad arguments, answered with `CLIENT_ERROR`.
    Reject(&'static str),
    /// Unknown verb, answered with `ERROR`.
    Unknown,
}

/// Memcached text protocol codec.
#[derive(Debug, Default)]
pub struct MemcacheCodec;

impl MemcacheCodec {
    pub fn new() -> Self {
        Self
    }

    fn decode_store(
        &mut self,
        buf: &mut BytesMut,
        line_end: usize,
        verb: StoreVerb,
        fields: Vec<Range<usize>>,
    ) -> Result<Option<MemcacheRequest>, FrameError> {
        let line = &buf[..line_end];
        let expected = verb.fields();
        let noreply = fields.len() == expected + 1 && &line[fields[expected].clone()] == b"noreply";
        if fields.len() != expected && !noreply {
            buf.advance(line_end + 2);
            return Ok(Some(MemcacheRequest::Reject(BAD_FORMAT)));
        }

        let Some(size) = parse_num::<usize>(&line[fields[4].clone()]) else {
            buf.advance(line_end + 2);
            return Ok(Some(MemcacheRequest::Reject(BAD_FORMAT)));
        };
        if size > MAX_VALUE_SIZE {
            return Err(FrameError::TooLarge {
                size,
                max: MAX_VALUE_SIZE,
            });
        }

        let data_start = line_end + 2;
        let data_end = data_start + size;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(FrameError::BadDataChunk);
        }

        let flags = parse_num::<u32>(&line[fields[2].clone()]);
        let exptime = parse_num::<i64>(&line[fields[3].clone()]);
        let cas_unique = match verb {
            StoreVerb::Cas => parse_num::<u64>(&line[fields[5].clone()]),
            _ => Some(0),
        };
        let key_range = fields[1].clone();

        let frame = buf.split_to(data_end + 2).freeze();
        let (Some(flags), Some(exptime), Some(cas_unique)) = (flags, exptime, cas_unique) else {
            return Ok(Some(MemcacheRequest::Reject(BAD_FORMAT)));
        };
        let key = frame.slice(key_range);
        if !valid_key(&key) {
            return Ok(Some(MemcacheRequest::Reject(BAD_FORMAT)));
        }

        Ok(Some(MemcacheRequest::Store(Store {
            verb,
            key,
            flags,
            expiry: expiry(exptime),
            value: frame.slice(data_start..data_end),
            cas_unique,
            noreply,
        })))
    }
}

impl Codec for MemcacheCodec {
    type Request = MemcacheRequest;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<MemcacheRequest>, FrameError> {
        let Some(line_end) = find_crlf(buf) else {
            if buf.len() > MAX_LINE_SIZE {
                return Err(FrameError::malformed("line too long"));
            }
            return Ok(None);
        };

        // Storage lines are split on single spaces so that an empty key is
        // seen as such instead of shifting the remaining fields.
        let fields = split_fields(&buf[..line_end]);
        if let Some(verb) = StoreVerb::from_bytes(&buf[fields[0].clone()]) {
            return self.decode_store(buf, line_end, verb, fields);
        }

        let line = buf.split_to(line_end + 2).freeze();
        let words: Vec<Bytes> = fields
            .into_iter()
            .filter(|r| !r.is_empty())
            .map(|r| line.slice(r))
            .collect();
        Ok(Some(parse_line(words)))
    }

    fn handle(&mut self, request: MemcacheRequest, commands: &CommandHandler, out: &mut BytesMut) -> Flow {
        let (command, noreply) = match request {
            MemcacheRequest::Quit => return Flow::Close,
            MemcacheRequest::Version => {
                out.put_slice(format!("VERSION {}\r\n", crate::VERSION).as_bytes());
                return Flow::Continue;
            }
            MemcacheRequest::Unknown => {
                out.put_slice(b"ERROR\r\n");
                return Flow::Continue;
            }
            MemcacheRequest::Reject(message) => {
                client_error(out, message);
                return Flow::Continue;
            }
            MemcacheRequest::Store(store) => {
                let noreply = store.noreply;
                (store_command(store), noreply)
            }
            MemcacheRequest::Retrieve { keys, with_cas } => {
                match commands.execute(Command::Gets { keys }) {
                    Ok(Reply::Items(items)) => write_items(out, &items, with_cas),
                    Ok(_) => out.put_slice(b"END\r\n"),
                    Err(err) => write_error(out, &err),
                }
                return Flow::Continue;
            }
            MemcacheRequest::Delete { key, noreply } => (Command::Del { keys: vec![key] }, noreply),
            MemcacheRequest::Arith {
                key,
                delta,
                direction,
                noreply,
            } => (
                Command::Counter {
                    key,
                    op: CounterOp::Wrapping(delta, direction),
                },
                noreply,
            ),
            MemcacheRequest::Touch {
                key,
                expiry,
                noreply,
            } => (Command::Expire { key, expiry }, noreply),
            MemcacheRequest::FlushAll {
                delay: Expiry::Never,
                noreply,
            } => (Command::Flush, noreply),
            MemcacheRequest::FlushAll { delay, noreply } => (Command::DelayedFlush(delay), noreply),
            MemcacheRequest::Stats => (Command::Stats, false),
        };

        let touch = matches!(command, Command::Expire { .. });
        let result = commands.execute(command);
        if noreply {
            return Flow::Continue;
        }

        match result {
            Ok(reply) => write_reply(out, reply, touch),
            Err(err) => {
                debug!(error = %err, "memcache command failed");
                write_error(out, &err);
            }
        }
        Flow::Continue
    }

    fn encode_error(&mut self, err: &FrameError, out: &mut BytesMut) {
        match err {
            FrameError::BadDataChunk => client_error(out, "bad data chunk"),
            FrameError::TooLarge { .. } => out.put_slice(b"SERVER_ERROR object too large for cache\r\n"),
            other => client_error(out, &other.to_string()),
        }
    }
}

/// Byte ranges of the space separated fields of `line`, empty fields kept.
fn split_fields(line: &[u8]) -> Vec<Range<usize>> {
    let mut fields = Vec::new();
    let mut start = 0;
    for (i, byte) in line.iter().enumerate() {
        if *byte == b' ' {
            fields.push(start..i);
            start = i + 1;
        }
    }
    fields.push(start..line.len());
    fields
}

fn parse_num<T: FromStr>(field: &[u8]) -> Option<T> {
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn valid_key(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_SIZE && key.iter().all(|b| *b > b' ' && *b != 0x7f)
}

/// Memcached expiration time to an [`Expiry`].
fn expiry(exptime: i64) -> Expiry {
    match exptime {
        0 => Expiry::Never,
        n if n < 0 => Expiry::Expired,
        n if n > MAX_RELATIVE_EXPTIME => Expiry::At(unix_time(Duration::from_secs(n as u64))),
        n => Expiry::In(Duration::from_secs(n as u64)),
    }
}

/// Decodes a non-storage command line.
fn parse_line(words: Vec<Bytes>) -> MemcacheRequest {
    let Some(verb) = words.first() else {
        return MemcacheRequest::Unknown;
    };
    let noreply = words.len() > 1 && words[words.len() - 1] == "noreply";
    let args = &words[1..words.len() - noreply as usize];

    match &verb[..] {
        b"get" | b"gets" => {
            if words.len() < 2 {
                return MemcacheRequest::Unknown;
            }
            let keys = words[1..].to_vec();
            if !keys.iter().all(|k| valid_key(k)) {
                return MemcacheRequest::Reject(BAD_FORMAT);
            }
            MemcacheRequest::Retrieve {
                keys,
                with_cas: &verb[..] == b"gets",
            }
        }
        b"delete" => match args {
            [key] if valid_key(key) => MemcacheRequest::Delete {
                key: key.clone(),
                noreply,
            },
            _ => MemcacheRequest::Reject(BAD_FORMAT),
        },
        b"incr" | b"decr" => match args {
            [key, delta] if valid_key(key) => match parse_num::<u64>(delta) {
                Some(delta) => MemcacheRequest::Arith {
                    key: key.clone(),
                    delta,
                    direction: if &verb[..] == b"incr" {
                        Direction::Up
                    } else {
                        Direction::Down
                    },
                    noreply,
                },
                None => MemcacheRequest::Reject(BAD_DELTA),
            },
            _ => MemcacheRequest::Reject(BAD_FORMAT),
        },
        b"touch" => match args {
            [key, exptime] if valid_key(key) => match parse_num::<i64>(exptime) {
                Some(exptime) => MemcacheRequest::Touch {
                    key: key.clone(),
                    expiry: expiry(exptime),
                    noreply,
                },
                None => MemcacheRequest::Reject(BAD_FORMAT),
            },
            _ => MemcacheRequest::Reject(BAD_FORMAT),
        },
        b"flush_all" => match args {
            [] => MemcacheRequest::FlushAll {
                delay: Expiry::Never,
                noreply,
            },
            [delay] => match parse_num::<i64>(delay) {
                Some(delay) => MemcacheRequest::FlushAll {
                    delay: expiry(delay),
                    noreply,
                },
                None => MemcacheRequest::Reject(BAD_FORMAT),
            },
            _ => MemcacheRequest::Reject(BAD_FORMAT),
        },
        b"stats" => match args {
            [] => MemcacheRequest::Stats,
            _ => MemcacheRequest::Reject(BAD_FORMAT),
        },
        b"version" => MemcacheRequest::Version,
        b"quit" => MemcacheRequest::Quit,
        _ => MemcacheRequest::Unknown,
    }
}

fn store_command(store: Store) -> Command {
    let Store {
        verb,
        key,
        flags,
        expiry,
        value,
        cas_unique,
        ..
    } = store;
    let condition = match verb {
        StoreVerb::Add => SetCondition::IfAbsent,
        StoreVerb::Replace => SetCondition::IfPresent,
        StoreVerb::Append | StoreVerb::Prepend => {
            return Command::Concat {
                key,
                value,
                placement: if verb == StoreVerb::Append {
                    Placement::Back
                } else {
                    Placement::Front
                },
                create: false,
            }
        }
        StoreVerb::Cas => {
            return Command::Cas {
                key,
                value,
                flags,
                expiry,
                version: cas_unique,
            }
        }
        StoreVerb::Set => SetCondition::Always,
    };
    Command::Set {
        key,
        value,
        condition,
        expiry,
        flags,
        get: false,
    }
}

fn write_items(out: &mut BytesMut, items: &[Item], with_cas: bool) {
    for item in items {
        out.reserve(item.key.len() + item.value.len() + 64);
        out.put_slice(b"VALUE ");
        out.put_slice(&item.key);
        let header = if with_cas {
            format!(" {} {} {}\r\n", item.flags, item.value.len(), item.version)
        } else {
            format!(" {} {}\r\n", item.flags, item.value.len())
        };
        out.put_slice(header.as_bytes());
        out.put_slice(&item.value);
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"END\r\n");
}

fn write_reply(out: &mut BytesMut, reply: Reply, touch: bool) {
    let line: &[u8] = match reply {
        Reply::Stored(true) | Reply::Cas(CasOutcome::Stored) => b"STORED\r\n",
        Reply::Stored(false) => b"NOT_STORED\r\n",
        Reply::Cas(CasOutcome::Exists) => b"EXISTS\r\n",
        Reply::Cas(CasOutcome::NotFound) | Reply::NotFound | Reply::Integer(0) => b"NOT_FOUND\r\n",
        Reply::Integer(_) if touch => b"TOUCHED\r\n",
        Reply::Integer(_) => b"DELETED\r\n",
        Reply::Unsigned(n) => {
            out.put_slice(format!("{}\r\n", n).as_bytes());
            return;
        }
        Reply::Stats(stats) => {
            for (name, value) in stats {
                out.put_slice(format!("STAT {} {}\r\n", name, value).as_bytes());
            }
            b"END\r\n"
        }
        _ => b"OK\r\n",
    };
    out.put_slice(line);
}

fn write_error(out: &mut BytesMut, err: &CommandError) {
    match err {
        CommandError::NotAnInteger => client_error(out, NON_NUMERIC),
        CommandError::InvalidKey | CommandError::Syntax => client_error(out, BAD_FORMAT),
        other => out.put_slice(format!("SERVER_ERROR {}\r\n", other).as_bytes()),
    }
}

fn client_error(out: &mut BytesMut, message: &str) {
    out.put_slice(format!("CLIENT_ERROR {}\r\n", message).as_bytes());
}
