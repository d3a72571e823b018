//! Command Handler Module
//!
//! The only code that talks to the [`StorageEngine`]. Each [`Command`] is
//! validated once, executed, and turned into a protocol-neutral [`Reply`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  memcache │ RESP │ HTTP │ Postgres      (protocol adapters)  │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │ Command
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │        validate() ───> execute() ───> Reply / Error         │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           ▼
//!                     StorageEngine
//! ```

use super::command::{Command, CommandError, CounterOp, Expiry, Item, Reply, TimeUnit};
use crate::storage::{KeyPattern, KeyTtl, SetOptions, StorageEngine};
use std::process;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Executes commands against the shared storage engine.
#[derive(Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// Validates and runs a command.
    pub fn execute(&self, command: Command) -> Result<Reply, CommandError> {
        command.validate()?;
        trace!(command = command.name(), "Executing command");

        let storage = &self.storage;
        let reply = match command {
            Command::Ping(None) => Reply::Status("PONG"),
            Command::Ping(Some(message)) | Command::Echo(message) => Reply::Bulk(Some(message)),
            Command::Quit => Reply::Close,

            Command::Set {
                key,
                value,
                condition,
                expiry,
                flags,
                get,
            } => {
                let options = SetOptions {
                    condition,
                    expires_at: expiry.deadline(Instant::now()),
                    keep_ttl: expiry == Expiry::Keep,
                    flags,
                    return_previous: get,
                };
                let outcome = storage.set_with(key, value, options)?;
                if get {
                    Reply::Bulk(outcome.previous)
                } else {
                    Reply::Stored(outcome.stored)
                }
            }

            Command::Get { key } => Reply::Bulk(storage.get(&key)),

            Command::Gets { keys } => Reply::Items(
                keys.into_iter()
                    .filter_map(|key| {
                        storage.get_entry(&key).map(|entry| Item {
                            key,
                            value: entry.value,
                            flags: entry.flags,
                            version: entry.version,
                        })
                    })
                    .collect(),
            ),

            Command::Cas {
                key,
                value,
                flags,
                expiry,
                version,
            } => Reply::Cas(storage.cas(
                &key,
                value,
                version,
                flags,
                expiry.deadline(Instant::now()),
            )),

            Command::Del { keys } => Reply::Integer(storage.delete_many(&keys) as i64),
            Command::Exists { keys } => Reply::Integer(storage.exists_many(&keys) as i64),
            Command::MGet { keys } => Reply::Values(storage.mget(&keys)),

            Command::MGets { keys } => Reply::Entries(
                keys.into_iter()
                    .map(|key| {
                        storage.get_entry(&key).map(|entry| Item {
                            key,
                            value: entry.value,
                            flags: entry.flags,
                            version: entry.version,
                        })
                    })
                    .collect(),
            ),

            Command::Keys { pattern } => Reply::Values(
                storage
                    .keys(&KeyPattern::parse(&pattern))
                    .into_iter()
                    .map(Some)
                    .collect(),
            ),

            Command::DbSize => Reply::Integer(storage.len() as i64),

            Command::Ttl { key, unit } => Reply::Integer(match storage.ttl(&key) {
                KeyTtl::Missing => -2,
                KeyTtl::Persistent => -1,
                KeyTtl::Expires(left) => match unit {
                    TimeUnit::Seconds => left.as_secs() as i64,
                    TimeUnit::Milliseconds => left.as_millis() as i64,
                },
            }),

            Command::Expire { key, expiry } => {
                let changed = match expiry {
                    Expiry::Keep => storage.exists(&key),
                    other => storage.expire_at(&key, other.deadline(Instant::now())),
                };
                Reply::Integer(changed as i64)
            }

            Command::Persist { key } => Reply::Integer(storage.persist(&key) as i64),

            Command::Counter { key, op } => match op {
                CounterOp::Add(delta) => Reply::Integer(storage.incr_by(&key, delta)?),
                CounterOp::Sub(delta) => Reply::Integer(storage.decr_by(&key, delta)?),
                CounterOp::Unsigned(delta, direction) => {
                    Reply::Unsigned(storage.unsigned_by(&key, delta, direction)?)
                }
                CounterOp::Wrapping(delta, direction) => {
                    match storage.wrapping_by(&key, delta, direction)? {
                        Some(n) => Reply::Unsigned(n),
                        None => Reply::NotFound,
                    }
                }
            },

            Command::Concat {
                key,
                value,
                placement,
                create,
            } => {
                let len = storage.concat(&key, &value, placement, create)?;
                match len {
                    Some(len) if create => Reply::Integer(len as i64),
                    stored => Reply::Stored(stored.is_some()),
                }
            }

            Command::Flush => {
                storage.flush();
                Reply::Ok
            }

            Command::DelayedFlush(expiry) => {
                let now = Instant::now();
                match expiry.deadline(now) {
                    Some(deadline) if deadline > now => {
                        debug!(delay_ms = (deadline - now).as_millis() as u64, "Flush scheduled");
                        storage.flush_at(deadline);
                    }
                    _ => storage.flush(),
                }
                Reply::Ok
            }

            Command::Sweep => {
                let sweep = storage.cleanup_expired();
                debug!(scanned = sweep.scanned, expired = sweep.expired, "Manual sweep");
                Reply::Ok
            }

            Command::Stats => Reply::Stats(self.stats()),
        };

        Ok(reply)
    }

    /// Server statistics, named the way memcached names them.
    fn stats(&self) -> Vec<(&'static str, String)> {
        let stats = self.storage.stats();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        vec![
            ("pid", process::id().to_string()),
            ("uptime", self.storage.uptime().as_secs().to_string()),
            ("time", now.to_string()),
            ("version", crate::VERSION.to_string()),
            ("curr_items", stats.keys.to_string()),
            ("cmd_get", stats.get_ops.to_string()),
            ("cmd_set", stats.set_ops.to_string()),
            ("cmd_delete", stats.del_ops.to_string()),
            ("expired", stats.expired.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CasOutcome, Direction, Placement, SetCondition};
    use bytes::Bytes;
    use std::time::Duration;

    fn create_handler() -> CommandHandler {
        CommandHandler::new(Arc::new(StorageEngine::new()))
    }

    fn run(handler: &CommandHandler, args: &[&str]) -> Result<Reply, CommandError> {
        let command = Command::from_args(args.iter().map(|s| Bytes::from(s.to_string())).collect())?;
        handler.execute(command)
    }

    fn bulk(s: &str) -> Reply {
        Reply::Bulk(Some(Bytes::from(s.to_string())))
    }

    #[test]
    fn test_ping_echo() {
        let handler = create_handler();

        assert_eq!(run(&handler, &["PING"]), Ok(Reply::Status("PONG")));
        assert_eq!(run(&handler, &["PING", "hi"]), Ok(bulk("hi")));
        assert_eq!(run(&handler, &["ECHO", "hello"]), Ok(bulk("hello")));
        assert_eq!(run(&handler, &["QUIT"]), Ok(Reply::Close));
    }

    #[test]
    fn test_set_get_del() {
        let handler = create_handler();

        assert_eq!(run(&handler, &["SET", "k", "v"]), Ok(Reply::Stored(true)));
        assert_eq!(run(&handler, &["GET", "k"]), Ok(bulk("v")));
        assert_eq!(run(&handler, &["DEL", "k", "k"]), Ok(Reply::Integer(1)));
        assert_eq!(run(&handler, &["GET", "k"]), Ok(Reply::Bulk(None)));
        assert_eq!(run(&handler, &["EXISTS", "k"]), Ok(Reply::Integer(0)));
    }

    #[test]
    fn test_empty_key_is_rejected_before_engine() {
        let handler = create_handler();

        assert_eq!(run(&handler, &["SET", "", "v"]), Err(CommandError::InvalidKey));
        assert_eq!(run(&handler, &["INCR", ""]), Err(CommandError::InvalidKey));
        assert_eq!(run(&handler, &["DBSIZE"]), Ok(Reply::Integer(0)));
    }

    #[test]
    fn test_set_nx_xx_get() {
        let handler = create_handler();

        assert_eq!(run(&handler, &["SET", "k", "1", "XX"]), Ok(Reply::Stored(false)));
        assert_eq!(run(&handler, &["SET", "k", "1", "NX"]), Ok(Reply::Stored(true)));
        assert_eq!(run(&handler, &["SET", "k", "2", "NX"]), Ok(Reply::Stored(false)));
        assert_eq!(run(&handler, &["SET", "k", "3", "GET"]), Ok(bulk("1")));
        assert_eq!(run(&handler, &["GET", "k"]), Ok(bulk("3")));
    }

    #[test]
    fn test_ttl_family() {
        let handler = create_handler();

        assert_eq!(run(&handler, &["TTL", "hello"]), Ok(Reply::Integer(-2)));
        assert_eq!(run(&handler, &["EXPIRE", "hello", "10"]), Ok(Reply::Integer(0)));

        run(&handler, &["SET", "hello", "world"]).unwrap();
        assert_eq!(run(&handler, &["TTL", "hello"]), Ok(Reply::Integer(-1)));
        assert_eq!(run(&handler, &["PTTL", "hello"]), Ok(Reply::Integer(-1)));

        assert_eq!(run(&handler, &["EXPIRE", "hello", "10"]), Ok(Reply::Integer(1)));
        assert_eq!(run(&handler, &["TTL", "hello"]), Ok(Reply::Integer(9)));

        run(&handler, &["SET", "hello", "world", "EX", "10"]).unwrap();
        match run(&handler, &["PTTL", "hello"]) {
            Ok(Reply::Integer(ms)) => assert!(ms > 9000 && ms <= 10000),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(run(&handler, &["PERSIST", "hello"]), Ok(Reply::Integer(1)));
        assert_eq!(run(&handler, &["TTL", "hello"]), Ok(Reply::Integer(-1)));
    }

    #[test]
    fn test_expire_counts_down_then_removes() {
        let handler = create_handler();

        run(&handler, &["SET", "k", "v"]).unwrap();
        assert_eq!(run(&handler, &["EXPIRE", "k", "2"]), Ok(Reply::Integer(1)));

        let pttl = |handler: &CommandHandler| match run(handler, &["PTTL", "k"]) {
            Ok(Reply::Integer(ms)) => ms,
            other => panic!("unexpected {:?}", other),
        };
        let first = pttl(&handler);
        assert!(first > 1500 && first <= 2000);

        std::thread::sleep(Duration::from_millis(300));
        let second = pttl(&handler);
        assert!(second < first);
        assert!(second > 0);

        std::thread::sleep(Duration::from_millis(2000));
        assert_eq!(run(&handler, &["TTL", "k"]), Ok(Reply::Integer(-2)));
        assert_eq!(run(&handler, &["GET", "k"]), Ok(Reply::Bulk(None)));
    }

    #[test]
    fn test_huge_ttls_are_clamped() {
        let handler = create_handler();
        let max_secs = crate::storage::engine::MAX_TTL.as_secs() as i64;
        let ttl = |handler: &CommandHandler, key: &str| match run(handler, &["TTL", key]) {
            Ok(Reply::Integer(secs)) => secs,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(
            run(&handler, &["SET", "ex", "v", "EX", "9223372036854775807"]),
            Ok(Reply::Stored(true))
        );
        assert!(ttl(&handler, "ex") > max_secs - 5 && ttl(&handler, "ex") <= max_secs);

        assert_eq!(
            run(&handler, &["SET", "exat", "v", "EXAT", "9223372036854775807"]),
            Ok(Reply::Stored(true))
        );
        assert!(ttl(&handler, "exat") > 0 && ttl(&handler, "exat") <= max_secs);

        run(&handler, &["SET", "k", "v"]).unwrap();
        assert_eq!(
            run(&handler, &["EXPIRE", "k", "9223372036854775807"]),
            Ok(Reply::Integer(1))
        );
        assert!(ttl(&handler, "k") > max_secs - 5 && ttl(&handler, "k") <= max_secs);

        assert_eq!(
            run(&handler, &["PEXPIRE", "k", "9223372036854775807"]),
            Ok(Reply::Integer(1))
        );
        assert_eq!(run(&handler, &["GET", "k"]), Ok(bulk("v")));
    }

    #[test]
    fn test_short_px_expires() {
        let handler = create_handler();

        run(&handler, &["SET", "hello", "world", "PX", "50"]).unwrap();
        assert_eq!(run(&handler, &["TTL", "hello"]), Ok(Reply::Integer(0)));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(run(&handler, &["TTL", "hello"]), Ok(Reply::Integer(-2)));
        assert_eq!(run(&handler, &["GET", "hello"]), Ok(Reply::Bulk(None)));
        assert_eq!(run(&handler, &["DBSIZE"]), Ok(Reply::Integer(0)));
    }

    #[test]
    fn test_keep_ttl() {
        let handler = create_handler();

        run(&handler, &["SET", "k", "v", "EX", "100"]).unwrap();
        run(&handler, &["SET", "k", "w", "KEEPTTL"]).unwrap();
        match run(&handler, &["TTL", "k"]) {
            Ok(Reply::Integer(secs)) => assert!(secs > 90),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_mget_and_keys() {
        let handler = create_handler();
        run(&handler, &["SET", "apple", "1"]).unwrap();
        run(&handler, &["SET", "banana", "2"]).unwrap();

        assert_eq!(
            run(&handler, &["MGET", "apple", "nope", "banana"]),
            Ok(Reply::Values(vec![
                Some(Bytes::from("1")),
                None,
                Some(Bytes::from("2"))
            ]))
        );
        assert_eq!(
            run(&handler, &["KEYS", "*a"]),
            Ok(Reply::Values(vec![Some(Bytes::from("banana"))]))
        );
    }

    #[test]
    fn test_signed_counters() {
        let handler = create_handler();

        assert_eq!(run(&handler, &["INCR", "hello"]), Ok(Reply::Integer(1)));
        assert_eq!(run(&handler, &["INCRBY", "hello", "25"]), Ok(Reply::Integer(26)));
        assert_eq!(run(&handler, &["DECR", "hello"]), Ok(Reply::Integer(25)));

        run(&handler, &["SET", "hello", "9223372036854775807"]).unwrap();
        assert_eq!(run(&handler, &["INCR", "hello"]), Err(CommandError::OutOfRange));
        assert_eq!(
            run(&handler, &["DECRBY", "hello", "10"]),
            Ok(Reply::Integer(9223372036854775797))
        );

        run(&handler, &["SET", "hello", "world"]).unwrap();
        assert_eq!(run(&handler, &["INCR", "hello"]), Err(CommandError::NotAnInteger));
    }

    #[test]
    fn test_unsigned_counters() {
        let handler = create_handler();

        assert_eq!(run(&handler, &["UINCR", "hello"]), Ok(Reply::Unsigned(1)));
        run(&handler, &["SET", "hello", "18446744073709551614"]).unwrap();
        assert_eq!(run(&handler, &["UINCR", "hello"]), Ok(Reply::Unsigned(u64::MAX)));
        assert_eq!(run(&handler, &["UINCR", "hello"]), Err(CommandError::OutOfRange));

        run(&handler, &["DEL", "hello"]).unwrap();
        assert_eq!(run(&handler, &["UDECR", "hello"]), Err(CommandError::OutOfRange));
        assert_eq!(run(&handler, &["UINCRBY", "hello", "10"]), Ok(Reply::Unsigned(10)));
        assert_eq!(run(&handler, &["UDECRBY", "hello", "3"]), Ok(Reply::Unsigned(7)));
    }

    #[test]
    fn test_wrapping_counter_reports_missing() {
        let handler = create_handler();
        let key = Bytes::from("n");
        let incr = |delta| Command::Counter {
            key: key.clone(),
            op: CounterOp::Wrapping(delta, Direction::Up),
        };

        assert_eq!(handler.execute(incr(1)), Ok(Reply::NotFound));
        run(&handler, &["SET", "n", "18446744073709551615"]).unwrap();
        assert_eq!(handler.execute(incr(2)), Ok(Reply::Unsigned(1)));
    }

    #[test]
    fn test_append_prepend() {
        let handler = create_handler();

        run(&handler, &["SET", "hello", "A"]).unwrap();
        assert_eq!(run(&handler, &["APPEND", "hello", "BC"]), Ok(Reply::Integer(3)));
        assert_eq!(run(&handler, &["GET", "hello"]), Ok(bulk("ABC")));

        run(&handler, &["SET", "hello", "A"]).unwrap();
        assert_eq!(run(&handler, &["PREPEND", "hello", "BC"]), Ok(Reply::Integer(3)));
        assert_eq!(run(&handler, &["GET", "hello"]), Ok(bulk("BCA")));

        let strict = Command::Concat {
            key: Bytes::from("absent"),
            value: Bytes::from("x"),
            placement: Placement::Back,
            create: false,
        };
        assert_eq!(handler.execute(strict), Ok(Reply::Stored(false)));
    }

    #[test]
    fn test_gets_and_cas() {
        let handler = create_handler();
        let add = Command::Set {
            key: Bytes::from("counter"),
            value: Bytes::from("0"),
            condition: SetCondition::IfAbsent,
            expiry: Expiry::Never,
            flags: 16,
            get: false,
        };
        assert_eq!(handler.execute(add), Ok(Reply::Stored(true)));

        let gets = Command::Gets {
            keys: vec![Bytes::from("counter"), Bytes::from("missing")],
        };
        let item = match handler.execute(gets) {
            Ok(Reply::Items(mut items)) => {
                assert_eq!(items.len(), 1);
                items.remove(0)
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(item.flags, 16);

        let cas = |version| Command::Cas {
            key: Bytes::from("counter"),
            value: Bytes::from("1"),
            flags: 16,
            expiry: Expiry::Never,
            version,
        };
        assert_eq!(handler.execute(cas(item.version)), Ok(Reply::Cas(CasOutcome::Stored)));
        assert_eq!(handler.execute(cas(item.version)), Ok(Reply::Cas(CasOutcome::Exists)));
    }

    #[test]
    fn test_setex_and_mgets() {
        let handler = create_handler();

        assert_eq!(run(&handler, &["SETEX", "a", "100", "1"]), Ok(Reply::Stored(true)));
        match run(&handler, &["TTL", "a"]) {
            Ok(Reply::Integer(secs)) => assert!(secs > 90 && secs <= 100),
            other => panic!("unexpected {:?}", other),
        }

        let entries = match run(&handler, &["MGETS", "a", "missing", "a"]) {
            Ok(Reply::Entries(entries)) => entries,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(entries.len(), 3);
        assert!(entries[1].is_none());
        let first = entries[0].as_ref().unwrap();
        assert_eq!(first.value, Bytes::from("1"));
        assert_eq!(entries[2].as_ref().unwrap().version, first.version);
    }

    #[test]
    fn test_sweep_and_stats() {
        let handler = create_handler();

        run(&handler, &["SET", "short", "v", "PX", "10"]).unwrap();
        run(&handler, &["SET", "long", "v"]).unwrap();
        run(&handler, &["GET", "long"]).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(run(&handler, &["SWEEP"]), Ok(Reply::Ok));
        assert_eq!(run(&handler, &["PURGE", "ASYNC"]), Ok(Reply::Ok));

        let stats = match run(&handler, &["STATS"]) {
            Ok(Reply::Stats(stats)) => stats,
            other => panic!("unexpected {:?}", other),
        };
        let stat = |name: &str| {
            stats
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(stat("curr_items"), "1");
        assert_eq!(stat("expired"), "1");
        assert_eq!(stat("version"), crate::VERSION);
        assert_eq!(stat("pid"), std::process::id().to_string());
    }

    #[test]
    fn test_delayed_flush() {
        let handler = create_handler();
        run(&handler, &["SET", "a", "1"]).unwrap();

        let later = Command::DelayedFlush(Expiry::In(Duration::from_millis(50)));
        assert_eq!(handler.execute(later), Ok(Reply::Ok));
        assert_eq!(run(&handler, &["SWEEP"]), Ok(Reply::Ok));
        assert_eq!(run(&handler, &["DBSIZE"]), Ok(Reply::Integer(1)));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(run(&handler, &["SWEEP"]), Ok(Reply::Ok));
        assert_eq!(run(&handler, &["DBSIZE"]), Ok(Reply::Integer(0)));

        run(&handler, &["SET", "a", "1"]).unwrap();
        assert_eq!(handler.execute(Command::DelayedFlush(Expiry::Expired)), Ok(Reply::Ok));
        assert_eq!(run(&handler, &["DBSIZE"]), Ok(Reply::Integer(0)));
    }

    #[test]
    fn test_flush_and_dbsize() {
        let handler = create_handler();

        run(&handler, &["SET", "a", "1"]).unwrap();
        run(&handler, &["SET", "b", "2"]).unwrap();
        assert_eq!(run(&handler, &["DBSIZE"]), Ok(Reply::Integer(2)));
        assert_eq!(run(&handler, &["FLUSH"]), Ok(Reply::Ok));
        assert_eq!(run(&handler, &["DBSIZE"]), Ok(Reply::Integer(0)));
    }
}
