//! Postgres v3 wire protocol adapter.
//!
//! Serves a tiny fixed statement set over both the simple query protocol
//! (`Q`) and the extended protocol (`P`/`B`/`D`/`E`/`S`), since drivers
//! prepare every statement that carries parameters.
//!
//! | Statement        | Result                                 |
//! |------------------|----------------------------------------|
//! | `SET $1 $2`      | tag `SET 1`                            |
//! | `GET $1`         | one `value` row and `GET 1`, or `GET 0` |
//! | `MGET $1 [...]`  | `key`, `value` rows for hits, `MGET n`  |
//! | `MGETS $1 [...]` | as `MGET` plus a `cas` column          |
//! | `DEL $1 [...]`   | tag `DEL <removed>`                    |
//! | `DBSIZE`         | one `count` row, tag `DBSIZE 1`        |
//! | `FLUSH`          | tag `FLUSH SYNC`                       |
//! | `SWEEP`, `PURGE` | tag `SWEEP SYNC` (or `ASYNC`)          |
//! | `STATS`          | `stat`, `value` rows, tag `STATS n`    |
//!
//! Arguments are `$n` placeholders (`$1` to `$32767`), bare words or
//! `'quoted'` literals. Every column is `text` (OID 25).
//!
//! ## Message flow
//!
//! ```text
//! client                         server
//!   SSLRequest          ───>
//!                       <───     'N'
//!   StartupMessage      ───>
//!                       <───     AuthenticationOk, ParameterStatus*,
//!                                BackendKeyData, ReadyForQuery
//!   Parse/Describe/Sync ───>
//!                       <───     ParseComplete, ParameterDescription,
//!                                RowDescription|NoData, ReadyForQuery
//!   Bind/Describe/
//!   Execute/Sync        ───>
//!                       <───     BindComplete, RowDescription|NoData,
//!                                DataRow*, CommandComplete, ReadyForQuery
//! ```

use crate::commands::{Command, CommandError, CommandHandler, Expiry, Reply};
use crate::protocol::{Codec, Flow, FrameError, MAX_VALUE_SIZE};
use crate::storage::SetCondition;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::debug;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: u32 = 196_608;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Largest startup packet accepted.
pub const MAX_STARTUP_SIZE: usize = 10_000;

/// Largest regular message accepted.
pub const MAX_MESSAGE_SIZE: usize = MAX_VALUE_SIZE + 64 * 1024;

const TEXT_OID: i32 = 25;

/// Highest `$n` a statement may reference. Parameter counts travel as `i16`.
const MAX_PARAMS: usize = i16::MAX as usize;

static NEXT_SECRET: AtomicU32 = AtomicU32::new(1);

/// Errors reported to the client as an `ErrorResponse`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PgError {
    #[error("syntax error at or near \"{0}\"")]
    Syntax(String),

    #[error("unterminated quoted string")]
    UnterminatedString,

    #[error("there is no parameter ${0}")]
    UndefinedParameter(usize),

    #[error("null value for parameter ${0}")]
    NullParameter(usize),

    #[error("bind message supplies {got} parameters, but prepared statement requires {expected}")]
    ParameterCount { expected: usize, got: usize },

    #[error("prepared statement \"{0}\" does not exist")]
    MissingStatement(String),

    #[error("portal \"{0}\" does not exist")]
    MissingPortal(String),

    #[error("{0}")]
    Command(#[from] CommandError),
}

impl PgError {
    /// SQLSTATE for this error.
    pub fn code(&self) -> &'static str {
        match self {
            PgError::Syntax(_) | PgError::UnterminatedString => "42601",
            PgError::UndefinedParameter(_) => "42P02",
            PgError::ParameterCount { .. } => "08P01",
            PgError::MissingStatement(_) => "26000",
            PgError::MissingPortal(_) => "34000",
            PgError::NullParameter(_) | PgError::Command(_) => "XX000",
        }
    }
}

/// Statement or portal, as named by `Describe` and `Close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

/// A decoded frontend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgMessage {
    /// SSLRequest or GSSENCRequest; both are declined.
    EncryptionRequest,
    CancelRequest,
    Startup {
        params: Vec<(String, String)>,
    },
    Query(String),
    Parse {
        name: String,
        query: String,
    },
    Bind {
        portal: String,
        statement: String,
        params: Vec<Option<Bytes>>,
        binary_results: bool,
    },
    Describe {
        target: Target,
        name: String,
    },
    Execute {
        portal: String,
    },
    Close {
        target: Target,
        name: String,
    },
    Sync,
    Flush,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Set,
    Get,
    MGet { cas: bool },
    Del,
    DbSize,
    Flush,
    Sweep { purge: bool, asynchronous: bool },
    Stats,
}

impl Verb {
    /// Columns returned by the statement. Empty if it returns no rows.
    fn columns(self) -> &'static [&'static str] {
        match self {
            Verb::Get => &["value"],
            Verb::MGet { cas: false } => &["key", "value"],
            Verb::MGet { cas: true } => &["key", "value", "cas"],
            Verb::DbSize => &["count"],
            Verb::Stats => &["stat", "value"],
            Verb::Set | Verb::Del | Verb::Flush | Verb::Sweep { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    /// `$n`, 1-based.
    Param(usize),
    Literal(Bytes),
}

/// A parsed statement of the fixed grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    verb: Verb,
    args: Vec<Arg>,
    /// Highest `$n` referenced.
    params: usize,
}

#[derive(Debug, Clone)]
struct Portal {
    statement: Statement,
    params: Vec<Option<Bytes>>,
    binary_results: bool,
}

/// What an executed statement produced.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Outcome {
    rows: Vec<Vec<Bytes>>,
    tag: String,
}

/// Postgres wire codec. Keeps the prepared statements and portals of one
/// session.
#[derive(Debug, Default)]
pub struct PostgresCodec {
    started: bool,
    statements: HashMap<String, Statement>,
    portals: HashMap<String, Portal>,
    /// An extended-protocol message failed; ignore input until `Sync`.
    failed: bool,
}

impl PostgresCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_startup(&mut self, buf: &mut BytesMut) -> Result<Option<PgMessage>, FrameError> {
        if buf.len() < 8 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if !(8..=MAX_STARTUP_SIZE).contains(&len) {
            return Err(FrameError::InvalidLength(len as i64));
        }
        if buf.len() < len {
            return Ok(None);
        }

        let mut packet = buf.split_to(len).freeze();
        packet.advance(4);
        let code = packet.get_u32();
        match code {
            SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => Ok(Some(PgMessage::EncryptionRequest)),
            CANCEL_REQUEST_CODE => Ok(Some(PgMessage::CancelRequest)),
            PROTOCOL_VERSION => {
                let mut reader = Reader(packet);
                let mut params = Vec::new();
                loop {
                    let name = reader.string()?;
                    if name.is_empty() {
                        break;
                    }
                    params.push((name, reader.string()?));
                }
                self.started = true;
                Ok(Some(PgMessage::Startup { params }))
            }
            other => Err(FrameError::malformed(format!(
                "unsupported frontend protocol {}.{}",
                other >> 16,
                other & 0xffff
            ))),
        }
    }

    fn decode_message(&mut self, buf: &mut BytesMut) -> Result<Option<PgMessage>, FrameError> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let kind = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(FrameError::InvalidLength(len as i64));
        }
        if buf.len() < len + 1 {
            return Ok(None);
        }

        let mut body = buf.split_to(len + 1).freeze();
        body.advance(5);
        let mut r = Reader(body);

        let message = match kind {
            b'Q' => PgMessage::Query(r.string()?),
            b'P' => {
                let name = r.string()?;
                let query = r.string()?;
                // Declared parameter types are ignored: everything is text.
                PgMessage::Parse { name, query }
            }
            b'B' => {
                let portal = r.string()?;
                let statement = r.string()?;
                let formats = r.i16()?;
                for _ in 0..formats {
                    r.i16()?;
                }
                let count = r.i16()?;
                let mut params = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let len = r.i32()?;
                    params.push(if len < 0 { None } else { Some(r.bytes(len as usize)?) });
                }
                let result_formats = r.i16()?;
                let mut binary_results = false;
                for _ in 0..result_formats {
                    binary_results |= r.i16()? == 1;
                }
                PgMessage::Bind {
                    portal,
                    statement,
                    params,
                    binary_results,
                }
            }
            b'D' => {
                let target = r.target()?;
                PgMessage::Describe {
                    target,
                    name: r.string()?,
                }
            }
            b'E' => {
                let portal = r.string()?;
                // Row limits are not needed: a statement yields at most one row.
                r.i32()?;
                PgMessage::Execute { portal }
            }
            b'C' => {
                let target = r.target()?;
                PgMessage::Close {
                    target,
                    name: r.string()?,
                }
            }
            b'S' => PgMessage::Sync,
            b'H' => PgMessage::Flush,
            b'X' => PgMessage::Terminate,
            other => {
                return Err(FrameError::malformed(format!(
                    "unsupported frontend message type '{}'",
                    other as char
                )))
            }
        };
        Ok(Some(message))
    }

    fn describe(&self, target: Target, name: &str, out: &mut BytesMut) -> Result<(), PgError> {
        match target {
            Target::Statement => {
                let statement = self
                    .statements
                    .get(name)
                    .ok_or_else(|| PgError::MissingStatement(name.to_string()))?;
                write_message(out, b't', |m| {
                    m.put_i16(statement.params as i16);
                    for _ in 0..statement.params {
                        m.put_i32(TEXT_OID);
                    }
                });
                write_row_description(out, statement.verb.columns(), false);
            }
            Target::Portal => {
                let portal = self
                    .portals
                    .get(name)
                    .ok_or_else(|| PgError::MissingPortal(name.to_string()))?;
                write_row_description(out, portal.statement.verb.columns(), portal.binary_results);
            }
        }
        Ok(())
    }

    /// Runs one extended-protocol message. Errors switch the session into
    /// skip-until-Sync mode.
    fn extended(&mut self, message: PgMessage, commands: &CommandHandler, out: &mut BytesMut) -> Result<(), PgError> {
        match message {
            PgMessage::Parse { name, query } => {
                let statement = parse_statement(&query)?.ok_or_else(|| PgError::Syntax(String::new()))?;
                self.statements.insert(name, statement);
                write_message(out, b'1', |_| {});
            }
            PgMessage::Bind {
                portal,
                statement,
                params,
                binary_results,
            } => {
                let prepared = self
                    .statements
                    .get(&statement)
                    .ok_or(PgError::MissingStatement(statement))?;
                if params.len() != prepared.params {
                    return Err(PgError::ParameterCount {
                        expected: prepared.params,
                        got: params.len(),
                    });
                }
                let bound = Portal {
                    statement: prepared.clone(),
                    params,
                    binary_results,
                };
                self.portals.insert(portal, bound);
                write_message(out, b'2', |_| {});
            }
            PgMessage::Describe { target, name } => self.describe(target, &name, out)?,
            PgMessage::Execute { portal } => {
                let portal = self
                    .portals
                    .get(&portal)
                    .ok_or(PgError::MissingPortal(portal))?;
                let outcome = execute(&portal.statement, &portal.params, commands)?;
                write_outcome(out, &outcome);
            }
            PgMessage::Close { target, name } => {
                match target {
                    Target::Statement => {
                        self.statements.remove(&name);
                    }
                    Target::Portal => {
                        self.portals.remove(&name);
                    }
                }
                write_message(out, b'3', |_| {});
            }
            _ => {}
        }
        Ok(())
    }
}

impl Codec for PostgresCodec {
    type Request = PgMessage;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<PgMessage>, FrameError> {
        if self.started {
            self.decode_message(buf)
        } else {
            self.decode_startup(buf)
        }
    }

    fn handle(&mut self, message: PgMessage, commands: &CommandHandler, out: &mut BytesMut) -> Flow {
        match message {
            PgMessage::EncryptionRequest => out.put_u8(b'N'),
            PgMessage::CancelRequest | PgMessage::Terminate => return Flow::Close,
            PgMessage::Startup { params } => {
                let user = params
                    .iter()
                    .find(|(name, _)| name == "user")
                    .map(|(_, value)| value.as_str())
                    .unwrap_or_default();
                debug!(user, "postgres session started");
                write_startup(out);
            }
            PgMessage::Query(sql) => {
                self.failed = false;
                match parse_statement(&sql) {
                    Ok(None) => write_message(out, b'I', |_| {}),
                    Ok(Some(statement)) => match execute(&statement, &[], commands) {
                        Ok(outcome) => {
                            write_row_description(out, statement.verb.columns(), false);
                            write_outcome(out, &outcome);
                        }
                        Err(err) => write_error(out, &err),
                    },
                    Err(err) => write_error(out, &err),
                }
                write_ready(out);
            }
            PgMessage::Sync => {
                self.failed = false;
                write_ready(out);
            }
            PgMessage::Flush => {}
            message if self.failed => {
                debug!(?message, "discarding message until sync");
            }
            message => {
                if let Err(err) = self.extended(message, commands, out) {
                    write_error(out, &err);
                    self.failed = true;
                }
            }
        }
        Flow::Continue
    }

    fn encode_error(&mut self, err: &FrameError, out: &mut BytesMut) {
        write_error_fields(out, "08P01", &err.to_string());
    }
}

/// Cursor over a message body. Every read is bounds checked.
struct Reader(Bytes);

impl Reader {
    fn truncated() -> FrameError {
        FrameError::malformed("message truncated")
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        if self.0.remaining() < 1 {
            return Err(Self::truncated());
        }
        Ok(self.0.get_u8())
    }

    fn i16(&mut self) -> Result<i16, FrameError> {
        if self.0.remaining() < 2 {
            return Err(Self::truncated());
        }
        Ok(self.0.get_i16())
    }

    fn i32(&mut self) -> Result<i32, FrameError> {
        if self.0.remaining() < 4 {
            return Err(Self::truncated());
        }
        Ok(self.0.get_i32())
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes, FrameError> {
        if self.0.remaining() < len {
            return Err(Self::truncated());
        }
        Ok(self.0.split_to(len))
    }

    /// A NUL-terminated UTF-8 string.
    fn string(&mut self) -> Result<String, FrameError> {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| FrameError::malformed("missing string terminator"))?;
        let raw = self.0.split_to(end);
        self.0.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| FrameError::malformed("invalid UTF-8 in string"))
    }

    fn target(&mut self) -> Result<Target, FrameError> {
        match self.u8()? {
            b'S' => Ok(Target::Statement),
            b'P' => Ok(Target::Portal),
            other => Err(FrameError::malformed(format!(
                "invalid describe/close target '{}'",
                other as char
            ))),
        }
    }
}

/// Splits statement text into words, `$n` parameters and quoted literals.
/// Returns `None` for an empty statement.
fn parse_statement(sql: &str) -> Result<Option<Statement>, PgError> {
    let mut args = Vec::new();
    let mut chars = sql.trim().trim_end_matches(';').trim_end().chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' {
            chars.next();
            let mut literal = String::new();
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        literal.push('\'');
                    }
                    Some('\'') => break,
                    Some(other) => literal.push(other),
                    None => return Err(PgError::UnterminatedString),
                }
            }
            args.push(Arg::Literal(Bytes::from(literal)));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
            let param = word
                .strip_prefix('$')
                .map(|n| {
                    n.parse::<usize>()
                        .ok()
                        .filter(|n| (1..=MAX_PARAMS).contains(n))
                        .ok_or_else(|| PgError::Syntax(word.clone()))
                })
                .transpose()?;
            args.push(match param {
                Some(n) => Arg::Param(n),
                None => Arg::Literal(Bytes::from(word)),
            });
        }
    }

    if args.is_empty() {
        return Ok(None);
    }
    let head = args.remove(0);
    let Arg::Literal(name) = head else {
        return Err(PgError::Syntax(String::from("$")));
    };
    let name = String::from_utf8_lossy(&name).to_ascii_uppercase();

    // Optional SYNC or ASYNC trailer of FLUSH, SWEEP and PURGE.
    let asynchronous = match args.as_slice() {
        [] => Some(false),
        [Arg::Literal(m)] if m.eq_ignore_ascii_case(b"SYNC") => Some(false),
        [Arg::Literal(m)] if m.eq_ignore_ascii_case(b"ASYNC") => Some(true),
        _ => None,
    };

    let verb = match (name.as_str(), args.len()) {
        ("SET", 2) => Verb::Set,
        ("GET", 1) => Verb::Get,
        ("MGET", n) if n >= 1 => Verb::MGet { cas: false },
        ("MGETS", n) if n >= 1 => Verb::MGet { cas: true },
        ("DEL", n) if n >= 1 => Verb::Del,
        ("DBSIZE", 0) => Verb::DbSize,
        ("STATS", 0) => Verb::Stats,
        ("FLUSH", _) if asynchronous.is_some() => {
            args.clear();
            Verb::Flush
        }
        ("SWEEP" | "PURGE", _) if asynchronous.is_some() => {
            args.clear();
            Verb::Sweep {
                purge: name == "PURGE",
                asynchronous: asynchronous == Some(true),
            }
        }
        _ => return Err(PgError::Syntax(name)),
    };

    let params = args
        .iter()
        .filter_map(|arg| match arg {
            Arg::Param(n) => Some(*n),
            Arg::Literal(_) => None,
        })
        .max()
        .unwrap_or(0);

    Ok(Some(Statement { verb, args, params }))
}

fn resolve(args: &[Arg], params: &[Option<Bytes>]) -> Result<Vec<Bytes>, PgError> {
    args.iter()
        .map(|arg| match arg {
            Arg::Literal(value) => Ok(value.clone()),
            Arg::Param(n) => match params.get(n - 1) {
                Some(Some(value)) => Ok(value.clone()),
                Some(None) => Err(PgError::NullParameter(*n)),
                None => Err(PgError::UndefinedParameter(*n)),
            },
        })
        .collect()
}

fn execute(statement: &Statement, params: &[Option<Bytes>], commands: &CommandHandler) -> Result<Outcome, PgError> {
    let mut args = resolve(&statement.args, params)?.into_iter();

    let outcome = match statement.verb {
        Verb::Set => {
            let command = Command::Set {
                key: args.next().unwrap_or_default(),
                value: args.next().unwrap_or_default(),
                condition: SetCondition::Always,
                expiry: Expiry::Never,
                flags: 0,
                get: false,
            };
            let stored = matches!(commands.execute(command)?, Reply::Stored(true));
            Outcome {
                rows: Vec::new(),
                tag: format!("SET {}", stored as u8),
            }
        }
        Verb::Get => {
            let rows = match commands.execute(Command::Get {
                key: args.next().unwrap_or_default(),
            })? {
                Reply::Bulk(Some(value)) => vec![vec![value]],
                _ => Vec::new(),
            };
            Outcome {
                tag: format!("GET {}", rows.len()),
                rows,
            }
        }
        Verb::MGet { cas } => {
            let entries = match commands.execute(Command::MGets { keys: args.collect() })? {
                Reply::Entries(entries) => entries,
                _ => Vec::new(),
            };
            let rows: Vec<Vec<Bytes>> = entries
                .into_iter()
                .flatten()
                .map(|item| {
                    let mut row = vec![item.key, item.value];
                    if cas {
                        row.push(Bytes::from(item.version.to_string()));
                    }
                    row
                })
                .collect();
            Outcome {
                tag: format!("MGET {}", rows.len()),
                rows,
            }
        }
        Verb::Del => {
            let keys: Vec<Bytes> = args.collect();
            let removed = match commands.execute(Command::Del { keys })? {
                Reply::Integer(n) => n,
                _ => 0,
            };
            Outcome {
                rows: Vec::new(),
                tag: format!("DEL {}", removed),
            }
        }
        Verb::DbSize => {
            let count = match commands.execute(Command::DbSize)? {
                Reply::Integer(n) => n,
                _ => 0,
            };
            Outcome {
                rows: vec![vec![Bytes::from(count.to_string())]],
                tag: String::from("DBSIZE 1"),
            }
        }
        Verb::Flush => {
            commands.execute(Command::Flush)?;
            Outcome {
                rows: Vec::new(),
                tag: String::from("FLUSH SYNC"),
            }
        }
        Verb::Sweep { purge, asynchronous } => {
            commands.execute(Command::Sweep)?;
            Outcome {
                rows: Vec::new(),
                tag: format!(
                    "{} {}",
                    if purge { "PURGE" } else { "SWEEP" },
                    if asynchronous { "ASYNC" } else { "SYNC" }
                ),
            }
        }
        Verb::Stats => {
            let rows: Vec<Vec<Bytes>> = match commands.execute(Command::Stats)? {
                Reply::Stats(stats) => stats
                    .into_iter()
                    .map(|(name, value)| vec![Bytes::from_static(name.as_bytes()), Bytes::from(value)])
                    .collect(),
                _ => Vec::new(),
            };
            Outcome {
                tag: format!("STATS {}", rows.len()),
                rows,
            }
        }
    };
    Ok(outcome)
}

/// Appends a message of `kind`, filling in its length once `body` ran.
fn write_message(out: &mut BytesMut, kind: u8, body: impl FnOnce(&mut BytesMut)) {
    out.put_u8(kind);
    let at = out.len();
    out.put_u32(0);
    body(out);
    let len = (out.len() - at) as u32;
    out[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn write_startup(out: &mut BytesMut) {
    write_message(out, b'R', |m| m.put_i32(0));
    for (name, value) in [
        ("server_version", "16.0"),
        ("server_encoding", "UTF8"),
        ("client_encoding", "UTF8"),
        ("standard_conforming_strings", "on"),
        ("DateStyle", "ISO, MDY"),
        ("integer_datetimes", "on"),
    ] {
        write_message(out, b'S', |m| {
            put_cstr(m, name);
            put_cstr(m, value);
        });
    }
    write_message(out, b'K', |m| {
        m.put_u32(process::id());
        m.put_u32(NEXT_SECRET.fetch_add(1, Ordering::Relaxed));
    });
    write_ready(out);
}

fn write_ready(out: &mut BytesMut) {
    write_message(out, b'Z', |m| m.put_u8(b'I'));
}

/// RowDescription for a single text column, or NoData.
fn write_row_description(out: &mut BytesMut, columns: &[&str], binary: bool) {
    if columns.is_empty() {
        return write_message(out, b'n', |_| {});
    }
    write_message(out, b'T', |m| {
        m.put_i16(columns.len() as i16);
        for column in columns {
            put_cstr(m, column);
            m.put_i32(0); // table oid
            m.put_i16(0); // attribute number
            m.put_i32(TEXT_OID);
            m.put_i16(-1); // variable length
            m.put_i32(-1); // type modifier
            m.put_i16(binary as i16);
        }
    });
}

/// DataRows followed by CommandComplete.
fn write_outcome(out: &mut BytesMut, outcome: &Outcome) {
    for row in &outcome.rows {
        write_message(out, b'D', |m| {
            m.put_i16(row.len() as i16);
            for value in row {
                m.put_i32(value.len() as i32);
                m.put_slice(value);
            }
        });
    }
    write_message(out, b'C', |m| put_cstr(m, &outcome.tag));
}

fn write_error(out: &mut BytesMut, err: &PgError) {
    debug!(error = %err, code = err.code(), "postgres statement failed");
    write_error_fields(out, err.code(), &err.to_string());
}

fn write_error_fields(out: &mut BytesMut, code: &str, message: &str) {
    write_message(out, b'E', |m| {
        for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message)] {
            m.put_u8(field);
            put_cstr(m, value);
        }
        m.put_u8(0);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use std::sync::Arc;

    fn frontend(kind: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
        let mut out = BytesMut::new();
        write_message(&mut out, kind, body);
        out
    }

    fn startup_packet(code: u32, params: &[(&str, &str)]) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u32(code);
        for (name, value) in params {
            put_cstr(&mut body, name);
            put_cstr(&mut body, value);
        }
        if !params.is_empty() {
            body.put_u8(0);
        }
        let mut out = BytesMut::new();
        out.put_u32(body.len() as u32 + 4);
        out.put_slice(&body);
        out
    }

    /// Splits backend output into (kind, body) pairs. The lone `N` reply to
    /// an SSLRequest has no length and is not expected here.
    fn messages(mut out: BytesMut) -> Vec<(u8, Bytes)> {
        let mut messages = Vec::new();
        while !out.is_empty() {
            let kind = out[0];
            let len = u32::from_be_bytes([out[1], out[2], out[3], out[4]]) as usize;
            let frame = out.split_to(len + 1).freeze();
            messages.push((kind, frame.slice(5..)));
        }
        messages
    }

    fn kinds(out: BytesMut) -> String {
        messages(out).iter().map(|(k, _)| *k as char).collect()
    }

    struct Session {
        codec: PostgresCodec,
        commands: CommandHandler,
    }

    impl Session {
        fn started() -> Self {
            let mut session = Self {
                codec: PostgresCodec::new(),
                commands: CommandHandler::new(Arc::new(StorageEngine::new())),
            };
            session.send(&startup_packet(PROTOCOL_VERSION, &[("user", "test")]));
            session
        }

        fn send(&mut self, input: &[u8]) -> BytesMut {
            let mut buf = BytesMut::from(input);
            let mut out = BytesMut::new();
            while let Some(message) = self.codec.decode(&mut buf).unwrap() {
                if self.codec.handle(message, &self.commands, &mut out) == Flow::Close {
                    break;
                }
            }
            out
        }

        fn query(&mut self, sql: &str) -> BytesMut {
            self.send(&frontend(b'Q', |m| put_cstr(m, sql)))
        }

        fn extended(&mut self, sql: &str, params: &[&str]) -> BytesMut {
            let mut input = BytesMut::new();
            input.extend_from_slice(&frontend(b'P', |m| {
                put_cstr(m, "stmt");
                put_cstr(m, sql);
                m.put_i16(0);
            }));
            input.extend_from_slice(&frontend(b'D', |m| {
                m.put_u8(b'S');
                put_cstr(m, "stmt");
            }));
            input.extend_from_slice(&frontend(b'S', |_| {}));
            input.extend_from_slice(&frontend(b'B', |m| {
                put_cstr(m, "");
                put_cstr(m, "stmt");
                m.put_i16(0);
                m.put_i16(params.len() as i16);
                for p in params {
                    m.put_i32(p.len() as i32);
                    m.put_slice(p.as_bytes());
                }
                m.put_i16(0);
            }));
            input.extend_from_slice(&frontend(b'D', |m| {
                m.put_u8(b'P');
                put_cstr(m, "");
            }));
            input.extend_from_slice(&frontend(b'E', |m| {
                put_cstr(m, "");
                m.put_i32(0);
            }));
            input.extend_from_slice(&frontend(b'S', |_| {}));
            self.send(&input)
        }
    }

    fn tag(out: BytesMut) -> String {
        messages(out)
            .into_iter()
            .find(|(k, _)| *k == b'C')
            .map(|(_, body)| String::from_utf8_lossy(&body[..body.len() - 1]).into_owned())
            .unwrap_or_default()
    }

    #[test]
    fn test_ssl_request_declined() {
        let mut codec = PostgresCodec::new();
        let commands = CommandHandler::new(Arc::new(StorageEngine::new()));
        let mut buf = startup_packet(SSL_REQUEST_CODE, &[]);
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message, PgMessage::EncryptionRequest);
        let mut out = BytesMut::new();
        codec.handle(message, &commands, &mut out);
        assert_eq!(&out[..], b"N");
        assert!(!codec.started);
    }

    #[test]
    fn test_startup_sequence() {
        let mut codec = PostgresCodec::new();
        let commands = CommandHandler::new(Arc::new(StorageEngine::new()));
        let mut buf = startup_packet(PROTOCOL_VERSION, &[("user", "u"), ("database", "d")]);
        let message = codec.decode(&mut buf).unwrap().unwrap();
        let mut out = BytesMut::new();
        codec.handle(message, &commands, &mut out);
        assert_eq!(kinds(out), "RSSSSSSKZ");
        assert!(codec.started);
    }

    #[test]
    fn test_simple_query_set_get() {
        let mut s = Session::started();
        assert_eq!(tag(s.query("SET greeting 'hello world'")), "SET 1");

        let out = s.query("get greeting;");
        let msgs = messages(out);
        let seen: String = msgs.iter().map(|(k, _)| *k as char).collect();
        assert_eq!(seen, "TDCZ");
        assert_eq!(&msgs[1].1[6..], b"hello world");

        assert_eq!(tag(s.query("GET missing")), "GET 0");
        assert_eq!(kinds(s.query("GET missing")), "TCZ");
    }

    #[test]
    fn test_extended_flow() {
        let mut s = Session::started();
        let out = s.extended("SET $1 $2", &["k", "v"]);
        assert_eq!(kinds(out.clone()), "1tnZ2nCZ");
        assert_eq!(tag(out), "SET 1");

        let out = s.extended("GET $1", &["k"]);
        assert_eq!(kinds(out.clone()), "1tTZ2TDCZ");
        assert_eq!(tag(out), "GET 1");

        assert_eq!(tag(s.extended("DEL $1", &["k"])), "DEL 1");
        assert_eq!(tag(s.extended("DEL $1", &["k"])), "DEL 0");
        assert_eq!(kinds(s.extended("GET $1", &["k"])), "1tTZ2TCZ");
    }

    #[test]
    fn test_dbsize_and_flush() {
        let mut s = Session::started();
        s.query("SET a 1");
        s.query("SET b 2");
        let msgs = messages(s.extended("DBSIZE", &[]));
        let row = msgs.iter().find(|(k, _)| *k == b'D').unwrap();
        assert_eq!(&row.1[6..], b"2");
        assert_eq!(tag(s.query("FLUSH")), "FLUSH SYNC");
        assert_eq!(tag(s.query("DBSIZE")), "DBSIZE 1");
    }

    #[test]
    fn test_syntax_error_then_recovery() {
        let mut s = Session::started();
        let out = s.query("SELECT 1");
        let msgs = messages(out);
        assert_eq!(msgs[0].0, b'E');
        assert!(String::from_utf8_lossy(&msgs[0].1).contains("42601"));
        assert_eq!(msgs[1].0, b'Z');

        // After a failed Parse the statement is unknown, so the Bind fails
        // too and its Describe/Execute are skipped up to the next Sync.
        let out = s.extended("NOPE $1", &["x"]);
        assert_eq!(kinds(out), "EZEZ");
        assert_eq!(tag(s.query("SET k v")), "SET 1");
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let mut s = Session::started();
        let out = s.extended("SET $1 $2", &["only"]);
        assert_eq!(kinds(out), "1tnZEZ");
    }

    #[test]
    fn test_empty_query_and_terminate() {
        let mut s = Session::started();
        assert_eq!(kinds(s.query("  ")), "IZ");
        let out = s.send(&frontend(b'X', |_| {}));
        assert!(out.is_empty());
    }

    #[test]
    fn test_parse_statement_forms() {
        let statement = parse_statement("set $1 $2").unwrap().unwrap();
        assert_eq!(statement.verb, Verb::Set);
        assert_eq!(statement.params, 2);
        assert!(parse_statement("").unwrap().is_none());
        assert!(parse_statement("FLUSH SYNC").is_ok());
        assert_eq!(
            parse_statement("GET 'unterminated"),
            Err(PgError::UnterminatedString)
        );
        assert!(matches!(parse_statement("GET $0"), Err(PgError::Syntax(_))));
        assert!(matches!(parse_statement("SET onlykey"), Err(PgError::Syntax(_))));
    }

    #[test]
    fn test_parameter_numbers_fit_the_wire() {
        assert_eq!(parse_statement("GET $32767").unwrap().unwrap().params, 32767);
        assert!(matches!(parse_statement("GET $32768"), Err(PgError::Syntax(_))));
        assert!(matches!(
            parse_statement("GET $99999999999999999999999"),
            Err(PgError::Syntax(_))
        ));

        let mut s = Session::started();
        let out = s.send(&frontend(b'P', |m| {
            put_cstr(m, "big");
            put_cstr(m, "GET $70000");
            m.put_i16(0);
        }));
        let msgs = messages(out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, b'E');
        assert!(String::from_utf8_lossy(&msgs[0].1).contains("42601"));
        assert_eq!(kinds(s.send(&frontend(b'S', |_| {}))), "Z");
    }

    #[test]
    fn test_mget_rows() {
        let mut s = Session::started();
        s.query("SET a 1");
        s.query("SET b 2");

        let msgs = messages(s.query("MGET a missing b"));
        let seen: String = msgs.iter().map(|(k, _)| *k as char).collect();
        assert_eq!(seen, "TDDCZ");
        // column count, then key and value
        assert_eq!(&msgs[1].1[..2], &[0, 2]);
        assert_eq!(&msgs[1].1[2..], b"\0\0\0\x01a\0\0\0\x011");
        assert_eq!(tag(s.query("MGET a missing b")), "MGET 2");

        let msgs = messages(s.extended("MGETS $1", &["a"]));
        let row = msgs.iter().find(|(k, _)| *k == b'D').unwrap();
        assert_eq!(&row.1[..2], &[0, 3]);
        assert_eq!(tag(s.extended("MGETS $1", &["missing"])), "MGET 0");
    }

    #[test]
    fn test_stats_and_sweep() {
        let mut s = Session::started();
        s.query("SET a 1");

        let out = s.query("STATS");
        let msgs = messages(out.clone());
        assert_eq!(msgs[0].0, b'T');
        assert_eq!(&msgs[0].1[..2], &[0, 2]);
        assert!(tag(out).starts_with("STATS "));
        assert!(matches!(parse_statement("STATS items"), Err(PgError::Syntax(_))));

        assert_eq!(tag(s.query("SWEEP")), "SWEEP SYNC");
        assert_eq!(tag(s.query("purge async")), "PURGE ASYNC");
        assert_eq!(tag(s.query("FLUSH ASYNC")), "FLUSH SYNC");
        assert!(matches!(parse_statement("SWEEP later"), Err(PgError::Syntax(_))));
    }

    #[test]
    fn test_bad_startup_length() {
        let mut codec = PostgresCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 0, 0, 0, 0][..]);
        assert_eq!(codec.decode(&mut buf), Err(FrameError::InvalidLength(2)));
    }
}
