//! Protocol-agnostic commands and replies.
//!
//! Every adapter lowers its wire request into a [`Command`] and renders the
//! [`Reply`] (or [`CommandError`]) that comes back in its own format.

use crate::storage::engine::deadline_after;
use crate::storage::{CasOutcome, Direction, Placement, SetCondition, StorageError};
use bytes::Bytes;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

/// Errors raised while validating or executing a command.
///
/// `Display` gives the message without the `ERR ` prefix that RESP adds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("syntax error")]
    Syntax,

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("increment or decrement would overflow")]
    OutOfRange,

    #[error("invalid expire time in '{0}' command")]
    InvalidExpire(String),

    #[error("invalid key")]
    InvalidKey,
}

impl From<StorageError> for CommandError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::EmptyKey => CommandError::InvalidKey,
            StorageError::NotAnInteger => CommandError::NotAnInteger,
            StorageError::OutOfRange => CommandError::OutOfRange,
        }
    }
}

/// When a written value should expire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiry {
    #[default]
    Never,
    In(Duration),
    At(SystemTime),
    /// Already in the past: the write lands but is never visible.
    Expired,
    /// Keep whatever deadline the entry already has.
    Keep,
}

impl Expiry {
    /// Absolute deadline for this expiry, relative to `now`. Far-future
    /// requests are clamped to `MAX_TTL`.
    pub fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            Expiry::Never | Expiry::Keep => None,
            Expiry::In(ttl) => Some(deadline_after(now, ttl)),
            Expiry::At(at) => Some(match at.duration_since(SystemTime::now()) {
                Ok(left) => deadline_after(now, left),
                Err(_) => now,
            }),
            Expiry::Expired => Some(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
}

/// Arithmetic applied by a counter command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    /// Signed add; missing keys start at 0.
    Add(i64),
    /// Signed subtract; missing keys start at 0.
    Sub(i64),
    /// Checked unsigned arithmetic; missing keys start at 0.
    Unsigned(u64, Direction),
    /// Wrapping unsigned arithmetic; missing keys stay missing.
    Wrapping(u64, Direction),
}

/// A single request against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Quit,
    Set {
        key: Bytes,
        value: Bytes,
        condition: SetCondition,
        expiry: Expiry,
        flags: u32,
        /// Reply with the previous value instead of a status.
        get: bool,
    },
    Get {
        key: Bytes,
    },
    /// Full entries (value, flags, version) for each live key.
    Gets {
        keys: Vec<Bytes>,
    },
    Cas {
        key: Bytes,
        value: Bytes,
        flags: u32,
        expiry: Expiry,
        version: u64,
    },
    Del {
        keys: Vec<Bytes>,
    },
    Exists {
        keys: Vec<Bytes>,
    },
    MGet {
        keys: Vec<Bytes>,
    },
    /// Like `MGet`, keeping each key's position and its version.
    MGets {
        keys: Vec<Bytes>,
    },
    Keys {
        pattern: Bytes,
    },
    DbSize,
    Ttl {
        key: Bytes,
        unit: TimeUnit,
    },
    Expire {
        key: Bytes,
        expiry: Expiry,
    },
    Persist {
        key: Bytes,
    },
    Counter {
        key: Bytes,
        op: CounterOp,
    },
    Concat {
        key: Bytes,
        value: Bytes,
        placement: Placement,
        /// Create a missing key instead of refusing to store.
        create: bool,
    },
    Flush,
    /// Flush once `Expiry` comes due. A deadline already passed flushes now.
    DelayedFlush(Expiry),
    /// Run one expiry sweep now.
    Sweep,
    Stats,
}

impl Command {
    /// Canonical name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping(_) => "PING",
            Command::Echo(_) => "ECHO",
            Command::Quit => "QUIT",
            Command::Set { .. } => "SET",
            Command::Get { .. } => "GET",
            Command::Gets { .. } => "GETS",
            Command::Cas { .. } => "CAS",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::MGet { .. } => "MGET",
            Command::MGets { .. } => "MGETS",
            Command::Keys { .. } => "KEYS",
            Command::DbSize => "DBSIZE",
            Command::Ttl { .. } => "TTL",
            Command::Expire { .. } => "EXPIRE",
            Command::Persist { .. } => "PERSIST",
            Command::Counter { op, .. } => match op {
                CounterOp::Add(_) => "INCRBY",
                CounterOp::Sub(_) => "DECRBY",
                CounterOp::Unsigned(_, Direction::Up) => "UINCRBY",
                CounterOp::Unsigned(_, Direction::Down) => "UDECRBY",
                CounterOp::Wrapping(_, Direction::Up) => "INCR",
                CounterOp::Wrapping(_, Direction::Down) => "DECR",
            },
            Command::Concat { placement, .. } => match placement {
                Placement::Front => "PREPEND",
                Placement::Back => "APPEND",
            },
            Command::Flush | Command::DelayedFlush(_) => "FLUSH",
            Command::Sweep => "SWEEP",
            Command::Stats => "STATS",
        }
    }

    /// Keys this command writes. Reads of an empty key are harmless misses,
    /// but writes must never create one.
    fn written_key(&self) -> Option<&Bytes> {
        match self {
            Command::Set { key, .. }
            | Command::Cas { key, .. }
            | Command::Counter { key, .. }
            | Command::Concat { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Shared validation, applied before any command reaches the engine.
    pub fn validate(&self) -> Result<(), CommandError> {
        match self.written_key() {
            Some(key) if key.is_empty() => Err(CommandError::InvalidKey),
            _ => Ok(()),
        }
    }
}

/// One hit of a [`Command::Gets`] or [`Command::MGets`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Bytes,
    pub value: Bytes,
    pub flags: u32,
    pub version: u64,
}

/// The result of a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Generic acknowledgement.
    Ok,
    Status(&'static str),
    /// A value, or `None` when absent.
    Bulk(Option<Bytes>),
    /// Outcome of a conditional write.
    Stored(bool),
    Integer(i64),
    /// Unsigned counter result. Kept apart from `Integer` so values above
    /// `i64::MAX` survive.
    Unsigned(u64),
    Values(Vec<Option<Bytes>>),
    Items(Vec<Item>),
    /// One slot per requested key, `None` for misses.
    Entries(Vec<Option<Item>>),
    /// Named server statistics, in display order.
    Stats(Vec<(&'static str, String)>),
    Cas(CasOutcome),
    /// The key a command needed did not exist.
    NotFound,
    /// The client asked to end the session.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_written_key() {
        let set = Command::Set {
            key: Bytes::new(),
            value: Bytes::from("v"),
            condition: SetCondition::Always,
            expiry: Expiry::Never,
            flags: 0,
            get: false,
        };
        assert_eq!(set.validate(), Err(CommandError::InvalidKey));

        let get = Command::Get { key: Bytes::new() };
        assert_eq!(get.validate(), Ok(()));
    }

    #[test]
    fn test_expiry_deadlines() {
        let now = Instant::now();

        assert_eq!(Expiry::Never.deadline(now), None);
        assert_eq!(Expiry::Expired.deadline(now), Some(now));
        assert_eq!(
            Expiry::In(Duration::from_secs(5)).deadline(now),
            Some(now + Duration::from_secs(5))
        );

        let past = SystemTime::now() - Duration::from_secs(10);
        assert_eq!(Expiry::At(past).deadline(now), Some(now));

        let future = SystemTime::now() + Duration::from_secs(100);
        let deadline = Expiry::At(future).deadline(now).unwrap();
        assert!(deadline > now + Duration::from_secs(98));
    }

    #[test]
    fn test_huge_expiry_is_clamped() {
        use crate::storage::engine::MAX_TTL;

        let now = Instant::now();
        let huge = Duration::from_secs(i64::MAX as u64);
        assert_eq!(Expiry::In(huge).deadline(now), Some(now + MAX_TTL));
        assert_eq!(Expiry::In(Duration::MAX).deadline(now), Some(now + MAX_TTL));

        let far = SystemTime::UNIX_EPOCH + Duration::from_secs(1 << 40);
        assert_eq!(Expiry::At(far).deadline(now), Some(now + MAX_TTL));
    }

    #[test]
    fn test_storage_error_mapping() {
        assert_eq!(
            CommandError::from(StorageError::OutOfRange).to_string(),
            "increment or decrement would overflow"
        );
        assert_eq!(
            CommandError::from(StorageError::NotAnInteger).to_string(),
            "value is not an integer or out of range"
        );
    }
}
