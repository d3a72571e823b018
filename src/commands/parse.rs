//! Command table and argument parsing.
//!
//! Lowers a `(name, args...)` request, as carried by RESP, into a
//! [`Command`]. Names are case-insensitive. Arity is checked against the
//! table before any argument is looked at, so a malformed request never
//! reaches the engine.

use super::command::{Command, CommandError, CounterOp, Expiry, TimeUnit};
use crate::storage::engine::MAX_TTL;
use crate::storage::{Direction, Placement, SetCondition};
use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Accepted argument counts, including the command name itself.
#[derive(Debug, Clone, Copy)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(want) => n == want,
            Arity::AtLeast(min) => n >= min,
            Arity::Between(min, max) => (min..=max).contains(&n),
        }
    }
}

const TABLE: &[(&str, Arity)] = &[
    ("PING", Arity::Between(1, 2)),
    ("ECHO", Arity::Exact(2)),
    ("QUIT", Arity::Exact(1)),
    ("SET", Arity::AtLeast(3)),
    ("SETEX", Arity::Exact(4)),
    ("GET", Arity::Exact(2)),
    ("MGET", Arity::AtLeast(2)),
    ("MGETS", Arity::AtLeast(2)),
    ("DEL", Arity::AtLeast(2)),
    ("EXISTS", Arity::AtLeast(2)),
    ("KEYS", Arity::Exact(2)),
    ("DBSIZE", Arity::Exact(1)),
    ("TTL", Arity::Exact(2)),
    ("PTTL", Arity::Exact(2)),
    ("EXPIRE", Arity::Exact(3)),
    ("PEXPIRE", Arity::Exact(3)),
    ("PERSIST", Arity::Exact(2)),
    ("TOUCH", Arity::AtLeast(2)),
    ("INCR", Arity::Exact(2)),
    ("DECR", Arity::Exact(2)),
    ("INCRBY", Arity::Exact(3)),
    ("DECRBY", Arity::Exact(3)),
    ("UINCR", Arity::Exact(2)),
    ("UDECR", Arity::Exact(2)),
    ("UINCRBY", Arity::Exact(3)),
    ("UDECRBY", Arity::Exact(3)),
    ("APPEND", Arity::Exact(3)),
    ("PREPEND", Arity::Exact(3)),
    ("FLUSH", Arity::Between(1, 2)),
    ("FLUSHDB", Arity::Between(1, 2)),
    ("FLUSHALL", Arity::Between(1, 2)),
    ("SWEEP", Arity::Between(1, 2)),
    ("PURGE", Arity::Between(1, 2)),
    ("STATS", Arity::AtLeast(1)),
];

fn lookup(name: &str) -> Option<Arity> {
    TABLE
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|&(_, arity)| arity)
}

/// Returns true if `name` is in the command table, in any case.
pub fn is_known(name: &[u8]) -> bool {
    std::str::from_utf8(name).is_ok_and(|name| lookup(name).is_some())
}

pub(crate) fn parse_i64(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotAnInteger)
}

pub(crate) fn parse_u64(arg: &[u8]) -> Result<u64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotAnInteger)
}

impl Command {
    /// Builds a command from its name and arguments.
    pub fn from_args(args: Vec<Bytes>) -> Result<Command, CommandError> {
        let Some(first) = args.first() else {
            return Err(CommandError::UnknownCommand(String::new()));
        };
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();
        let arity = lookup(&name)
            .ok_or_else(|| CommandError::UnknownCommand(String::from_utf8_lossy(first).into_owned()))?;
        if !arity.accepts(args.len()) {
            return Err(CommandError::WrongArity(name.to_ascii_lowercase()));
        }

        let mut rest = args.into_iter().skip(1);

        let command = match name.as_str() {
            "PING" => {
                let message = take(&mut rest);
                Command::Ping((!message.is_empty()).then_some(message))
            }
            "ECHO" => Command::Echo(take(&mut rest)),
            "QUIT" => Command::Quit,
            "SET" => {
                let key = take(&mut rest);
                let value = take(&mut rest);
                let options: Vec<Bytes> = rest.collect();
                return parse_set(key, value, &options);
            }
            "SETEX" => {
                let key = take(&mut rest);
                let seconds = parse_i64(&take(&mut rest))?;
                if seconds <= 0 {
                    return Err(CommandError::InvalidExpire("setex".to_string()));
                }
                Command::Set {
                    key,
                    value: take(&mut rest),
                    condition: SetCondition::Always,
                    expiry: Expiry::In(Duration::from_secs(seconds as u64)),
                    flags: 0,
                    get: false,
                }
            }
            "GET" => Command::Get { key: take(&mut rest) },
            "MGET" => Command::MGet { keys: rest.collect() },
            "MGETS" => Command::MGets { keys: rest.collect() },
            "DEL" => Command::Del { keys: rest.collect() },
            "EXISTS" | "TOUCH" => Command::Exists { keys: rest.collect() },
            "KEYS" => Command::Keys { pattern: take(&mut rest) },
            "DBSIZE" => Command::DbSize,
            "TTL" => Command::Ttl {
                key: take(&mut rest),
                unit: TimeUnit::Seconds,
            },
            "PTTL" => Command::Ttl {
                key: take(&mut rest),
                unit: TimeUnit::Milliseconds,
            },
            "EXPIRE" | "PEXPIRE" => {
                let key = take(&mut rest);
                let amount = parse_i64(&take(&mut rest))?;
                let unit = if name == "EXPIRE" {
                    TimeUnit::Seconds
                } else {
                    TimeUnit::Milliseconds
                };
                Command::Expire {
                    key,
                    expiry: relative_expiry(amount, unit),
                }
            }
            "PERSIST" => Command::Persist { key: take(&mut rest) },
            "INCR" => counter(take(&mut rest), CounterOp::Add(1)),
            "DECR" => counter(take(&mut rest), CounterOp::Sub(1)),
            "INCRBY" => {
                let key = take(&mut rest);
                counter(key, CounterOp::Add(parse_i64(&take(&mut rest))?))
            }
            "DECRBY" => {
                let key = take(&mut rest);
                counter(key, CounterOp::Sub(parse_i64(&take(&mut rest))?))
            }
            "UINCR" => counter(take(&mut rest), CounterOp::Unsigned(1, Direction::Up)),
            "UDECR" => counter(take(&mut rest), CounterOp::Unsigned(1, Direction::Down)),
            "UINCRBY" => {
                let key = take(&mut rest);
                counter(key, CounterOp::Unsigned(parse_u64(&take(&mut rest))?, Direction::Up))
            }
            "UDECRBY" => {
                let key = take(&mut rest);
                counter(key, CounterOp::Unsigned(parse_u64(&take(&mut rest))?, Direction::Down))
            }
            "APPEND" | "PREPEND" => Command::Concat {
                key: take(&mut rest),
                value: take(&mut rest),
                placement: if name == "APPEND" {
                    Placement::Back
                } else {
                    Placement::Front
                },
                create: true,
            },
            "FLUSH" | "FLUSHDB" | "FLUSHALL" => {
                sync_mode(&take(&mut rest))?;
                Command::Flush
            }
            "SWEEP" | "PURGE" => {
                sync_mode(&take(&mut rest))?;
                Command::Sweep
            }
            "STATS" => {
                if rest.next().is_some() {
                    return Err(CommandError::Syntax);
                }
                Command::Stats
            }
            _ => return Err(CommandError::UnknownCommand(name)),
        };
        Ok(command)
    }
}

/// Next argument. Arity was checked up front, so a missing one only happens
/// for optional trailing arguments and reads as empty.
fn take(rest: &mut impl Iterator<Item = Bytes>) -> Bytes {
    rest.next().unwrap_or_default()
}

/// Optional `SYNC` or `ASYNC` trailer. Both run inline.
fn sync_mode(mode: &[u8]) -> Result<(), CommandError> {
    if mode.is_empty() || ["SYNC", "ASYNC"].iter().any(|m| m.as_bytes().eq_ignore_ascii_case(mode)) {
        Ok(())
    } else {
        Err(CommandError::Syntax)
    }
}

fn counter(key: Bytes, op: CounterOp) -> Command {
    Command::Counter { key, op }
}

/// `amount` units from now. Non-positive amounts are already expired.
fn relative_expiry(amount: i64, unit: TimeUnit) -> Expiry {
    if amount <= 0 {
        return Expiry::Expired;
    }
    let amount = amount as u64;
    Expiry::In(match unit {
        TimeUnit::Seconds => Duration::from_secs(amount),
        TimeUnit::Milliseconds => Duration::from_millis(amount),
    })
}

/// SET key value [NX|XX] [GET] [EX s|PX ms|EXAT ts|PXAT ms|KEEPTTL]
fn parse_set(key: Bytes, value: Bytes, options: &[Bytes]) -> Result<Command, CommandError> {
    let mut condition = SetCondition::Always;
    let mut expiry = Expiry::Never;
    let mut get = false;
    let mut expiry_given = false;

    let mut iter = options.iter();
    while let Some(option) = iter.next() {
        let option = String::from_utf8_lossy(option).to_ascii_uppercase();
        match option.as_str() {
            "NX" | "XX" => {
                if condition != SetCondition::Always {
                    return Err(CommandError::Syntax);
                }
                condition = if option == "NX" {
                    SetCondition::IfAbsent
                } else {
                    SetCondition::IfPresent
                };
            }
            "GET" => get = true,
            "KEEPTTL" => {
                if expiry_given {
                    return Err(CommandError::Syntax);
                }
                expiry_given = true;
                expiry = Expiry::Keep;
            }
            "EX" | "PX" | "EXAT" | "PXAT" => {
                if expiry_given {
                    return Err(CommandError::Syntax);
                }
                expiry_given = true;
                let amount = parse_i64(iter.next().ok_or(CommandError::Syntax)?)?;
                if amount <= 0 {
                    return Err(CommandError::InvalidExpire("set".to_string()));
                }
                let amount = amount as u64;
                expiry = match option.as_str() {
                    "EX" => Expiry::In(Duration::from_secs(amount)),
                    "PX" => Expiry::In(Duration::from_millis(amount)),
                    "EXAT" => Expiry::At(unix_time(Duration::from_secs(amount))),
                    _ => Expiry::At(unix_time(Duration::from_millis(amount))),
                };
            }
            _ => return Err(CommandError::Syntax),
        }
    }

    Ok(Command::Set {
        key,
        value,
        condition,
        expiry,
        flags: 0,
        get,
    })
}

/// Time since the epoch to `SystemTime`, no later than `MAX_TTL` from now.
pub(crate) fn unix_time(since_epoch: Duration) -> SystemTime {
    let now = SystemTime::now();
    let latest = now.checked_add(MAX_TTL).unwrap_or(now);
    UNIX_EPOCH
        .checked_add(since_epoch)
        .map_or(latest, |at| at.min(latest))
}
