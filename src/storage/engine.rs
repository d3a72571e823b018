//! Thread-Safe Storage Engine with Expiry, Versions and Counters
//!
//! This module implements the single key/value store shared by every
//! protocol front end. It knows nothing about wire formats: adapters reach it
//! only through the command set.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: keys are hashed onto N shards, each an `RwLock<HashMap>`.
//! 2. **Lazy Expiry**: an expired entry is invisible to readers and removed by the
//!    next writer that touches it, or by the background sweeper.
//! 3. **Versions**: every mutation stamps the entry with a fresh value from one
//!    engine-wide counter, taken while the shard write lock is held. That stamp
//!    is the CAS token handed out by `gets`.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! │                 version: AtomicU64 (global)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Read-modify-write operations (CAS, counters, append) run entirely under
//! one shard write lock, so racing callers on the same key are serialized.
//! `flush` holds every shard's write lock at once.

use bytes::{Bytes, BytesMut};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::pattern::KeyPattern;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 64;

/// Longest time to live an entry can carry. Larger requests are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + ttl`, with `ttl` clamped to [`MAX_TTL`].
#[inline]
pub fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    let ttl = ttl.min(MAX_TTL);
    now.checked_add(ttl).unwrap_or(now)
}

/// Errors returned by engine operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("empty key")]
    EmptyKey,

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("increment or decrement would overflow")]
    OutOfRange,
}

/// A stored value with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// CAS token. Changes on every mutation and is never handed out twice.
    pub version: u64,
    /// Opaque client flags (memcached).
    pub flags: u32,
}

impl Entry {
    #[inline]
    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Remaining time to live, or None if the entry never expires.
    pub fn ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|exp| exp.saturating_duration_since(Instant::now()))
    }
}

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetCondition {
    #[default]
    Always,
    /// Only store when the key is absent (NX, memcached `add`).
    IfAbsent,
    /// Only store when the key is present (XX, memcached `replace`).
    IfPresent,
}

/// Options for [`StorageEngine::set_with`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub condition: SetCondition,
    pub expires_at: Option<Instant>,
    /// Keep the existing deadline instead of `expires_at`.
    pub keep_ttl: bool,
    pub flags: u32,
    /// Report the value that was replaced.
    pub return_previous: bool,
}

/// Result of [`StorageEngine::set_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    pub stored: bool,
    pub previous: Option<Bytes>,
}

/// Result of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Stored,
    /// The entry changed since the token was issued.
    Exists,
    NotFound,
}

/// Expiry state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// Which end of the value `concat` writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Front,
    Back,
}

/// Direction of an unsigned counter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

type ShardMap = HashMap<Bytes, Entry>;

/// A single shard containing a portion of the key-value pairs.
#[derive(Debug, Default)]
struct Shard {
    data: RwLock<ShardMap>,
}

impl Shard {
    fn read(&self) -> RwLockReadGuard<'_, ShardMap> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ShardMap> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The shared storage engine.
///
/// Wrapped in an `Arc` and shared by every connection task. All operations
/// are thread-safe and short: no lock is ever held across an await point.
///
/// # Example
///
/// ```
/// use polykv::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("poly")).unwrap();
/// assert_eq!(engine.get(b"name"), Some(Bytes::from("poly")));
///
/// engine.set_with_ttl(Bytes::from("session"), Bytes::from("abc123"), Duration::from_secs(60)).unwrap();
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,

    /// Last version handed out
    version: AtomicU64,

    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,

    /// Deadline of a delayed flush, if one is pending
    pending_flush: Mutex<Option<Instant>>,
    started: Instant,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("version", &self.version.load(Ordering::Relaxed))
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates a new storage engine with [`DEFAULT_SHARDS`] shards.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Creates a storage engine with `shards` shards (at least one).
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Shard::default()).collect(),
            version: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
            pending_flush: Mutex::new(None),
            started: Instant::now(),
        }
    }

    /// Time since the engine was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Must be called with the owning shard's write lock held.
    #[inline]
    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drops `key` from a write-locked shard if it has expired.
    fn purge_expired(&self, data: &mut ShardMap, key: &[u8], now: Instant) {
        if data.get(key).is_some_and(|e| e.is_expired_at(now)) {
            data.remove(key);
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs `f` against the live entry for `key`, if any, under a read lock.
    fn with_live<T>(&self, key: &[u8], f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let now = Instant::now();
        let data = self.shard(key).read();
        data.get(key).filter(|e| !e.is_expired_at(now)).map(f)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Sets a key-value pair without expiry.
    pub fn set(&self, key: Bytes, value: Bytes) -> Result<(), StorageError> {
        self.set_with(key, value, SetOptions::default()).map(|_| ())
    }

    /// Sets a key-value pair that expires after `ttl`.
    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) -> Result<(), StorageError> {
        let options = SetOptions {
            expires_at: Some(deadline_after(Instant::now(), ttl)),
            ..SetOptions::default()
        };
        self.set_with(key, value, options).map(|_| ())
    }

    /// Conditional, option-driven write. Creates or overwrites the entry and
    /// bumps its version when the condition holds.
    pub fn set_with(
        &self,
        key: Bytes,
        value: Bytes,
        options: SetOptions,
    ) -> Result<SetOutcome, StorageError> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut data = self.shard(&key).write();
        self.purge_expired(&mut data, &key, now);

        let current = data.get(&key);
        let allowed = match options.condition {
            SetCondition::Always => true,
            SetCondition::IfAbsent => current.is_none(),
            SetCondition::IfPresent => current.is_some(),
        };
        let previous = if options.return_previous {
            current.map(|e| e.value.clone())
        } else {
            None
        };
        if !allowed {
            return Ok(SetOutcome {
                stored: false,
                previous,
            });
        }

        let expires_at = if options.keep_ttl {
            current.and_then(|e| e.expires_at)
        } else {
            options.expires_at
        };
        let version = self.next_version();
        data.insert(
            key,
            Entry {
                value,
                expires_at,
                version,
                flags: options.flags,
            },
        );

        Ok(SetOutcome {
            stored: true,
            previous,
        })
    }

    /// Replaces the value only if the entry still carries `expected` as its
    /// version.
    pub fn cas(
        &self,
        key: &Bytes,
        value: Bytes,
        expected: u64,
        flags: u32,
        expires_at: Option<Instant>,
    ) -> CasOutcome {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut data = self.shard(key).write();
        self.purge_expired(&mut data, key, now);

        let Some(entry) = data.get_mut(&key[..]) else {
            return CasOutcome::NotFound;
        };
        if entry.version != expected {
            return CasOutcome::Exists;
        }

        entry.value = value;
        entry.flags = flags;
        entry.expires_at = expires_at;
        entry.version = self.next_version();
        CasOutcome::Stored
    }

    /// Concatenates `data` onto the stored value and returns the new length.
    ///
    /// With `create` a missing key starts out empty; without it the call
    /// returns `Ok(None)` for a missing key. Expiry and flags are kept.
    pub fn concat(
        &self,
        key: &Bytes,
        data: &[u8],
        placement: Placement,
        create: bool,
    ) -> Result<Option<usize>, StorageError> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut map = self.shard(key).write();
        self.purge_expired(&mut map, key, now);

        let version = self.next_version();
        match map.entry(key.clone()) {
            MapEntry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                let mut joined = BytesMut::with_capacity(entry.value.len() + data.len());
                match placement {
                    Placement::Front => {
                        joined.extend_from_slice(data);
                        joined.extend_from_slice(&entry.value);
                    }
                    Placement::Back => {
                        joined.extend_from_slice(&entry.value);
                        joined.extend_from_slice(data);
                    }
                }
                entry.value = joined.freeze();
                entry.version = version;
                Ok(Some(entry.value.len()))
            }
            MapEntry::Vacant(slot) if create => {
                slot.insert(Entry {
                    value: Bytes::copy_from_slice(data),
                    expires_at: None,
                    version,
                    flags: 0,
                });
                Ok(Some(data.len()))
            }
            MapEntry::Vacant(_) => Ok(None),
        }
    }

    /// Appends to a value, creating it when absent.
    pub fn append(&self, key: &Bytes, data: &[u8]) -> Result<usize, StorageError> {
        self.concat(key, data, Placement::Back, true)
            .map(|len| len.unwrap_or_default())
    }

    /// Prepends to a value, creating it when absent.
    pub fn prepend(&self, key: &Bytes, data: &[u8]) -> Result<usize, StorageError> {
        self.concat(key, data, Placement::Front, true)
            .map(|len| len.unwrap_or_default())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Gets the value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.with_live(key, |e| e.value.clone())
    }

    /// Gets the full entry, including its version and flags.
    pub fn get_entry(&self, key: &[u8]) -> Option<Entry> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.with_live(key, Entry::clone)
    }

    /// Gets several values in order. Missing keys yield `None` in place.
    pub fn mget(&self, keys: &[Bytes]) -> Vec<Option<Bytes>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.with_live(key, |_| ()).is_some()
    }

    /// Counts live keys. Repeated keys count once per occurrence.
    pub fn exists_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|k| self.exists(k)).count() as u64
    }

    pub fn ttl(&self, key: &[u8]) -> KeyTtl {
        self.with_live(key, |e| match e.ttl() {
            Some(left) => KeyTtl::Expires(left),
            None => KeyTtl::Persistent,
        })
        .unwrap_or(KeyTtl::Missing)
    }

    /// Returns every live key matching `pattern`, in no particular order.
    ///
    /// **Warning**: scans every shard.
    pub fn keys(&self, pattern: &KeyPattern) -> Vec<Bytes> {
        let now = Instant::now();
        let mut result = Vec::new();
        for shard in &self.shards {
            let data = shard.read();
            result.extend(
                data.iter()
                    .filter(|(key, entry)| !entry.is_expired_at(now) && pattern.matches(key))
                    .map(|(key, _)| key.clone()),
            );
        }
        result
    }

    /// Number of live keys.
    pub fn len(&self) -> u64 {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|e| !e.is_expired_at(now))
                    .count() as u64
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // DELETES AND EXPIRY
    // ========================================================================

    /// Deletes a key. Returns `true` if a live key was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut data = self.shard(key).write();
        match data.remove(key) {
            Some(entry) if entry.is_expired_at(now) => {
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Deletes several keys and returns how many were removed.
    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|k| self.delete(k)).count() as u64
    }

    /// Sets or clears the deadline of a live key. A deadline that has already
    /// passed removes the key. Returns `false` if the key was absent.
    pub fn expire_at(&self, key: &[u8], deadline: Option<Instant>) -> bool {
        let now = Instant::now();
        let mut data = self.shard(key).write();
        self.purge_expired(&mut data, key, now);

        if deadline.is_some_and(|d| d <= now) {
            let removed = data.remove(key).is_some();
            if removed {
                self.expired_count.fetch_add(1, Ordering::Relaxed);
            }
            return removed;
        }

        let version = self.next_version();
        match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = deadline;
                entry.version = version;
                true
            }
            None => false,
        }
    }

    /// Sets a key's time to live.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        self.expire_at(key, Some(deadline_after(Instant::now(), ttl)))
    }

    /// Removes a key's deadline. Returns `true` only if one was removed.
    pub fn persist(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let mut data = self.shard(key).write();
        self.purge_expired(&mut data, key, now);

        let Some(entry) = data.get_mut(key).filter(|e| e.expires_at.is_some()) else {
            return false;
        };
        entry.expires_at = None;
        entry.version = self.next_version();
        true
    }

    /// Clears every key. All shard write locks are held for the duration, so
    /// no reader ever sees a partially flushed store.
    pub fn flush(&self) {
        let mut guards: Vec<_> = self.shards.iter().map(Shard::write).collect();
        for data in guards.iter_mut() {
            data.clear();
        }
    }

    /// Schedules a flush for `deadline`. A newer schedule replaces an older
    /// one. The flush runs on the first [`cleanup_expired`] pass at or after
    /// the deadline.
    ///
    /// [`cleanup_expired`]: StorageEngine::cleanup_expired
    pub fn flush_at(&self, deadline: Instant) {
        *self.pending_flush.lock().unwrap_or_else(PoisonError::into_inner) = Some(deadline);
    }

    /// Runs the scheduled flush if it is due. Returns `true` if it ran.
    pub fn run_pending_flush(&self, now: Instant) -> bool {
        {
            let mut pending = self.pending_flush.lock().unwrap_or_else(PoisonError::into_inner);
            match *pending {
                Some(deadline) if deadline <= now => *pending = None,
                _ => return false,
            }
        }
        self.flush();
        true
    }

    /// Removes expired keys from every shard, after running a due delayed
    /// flush.
    ///
    /// Called by the background expiry sweeper.
    pub fn cleanup_expired(&self) -> Sweep {
        let now = Instant::now();
        self.run_pending_flush(now);
        let mut sweep = Sweep::default();

        for shard in &self.shards {
            let mut data = shard.write();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired_at(now));
            sweep.scanned += before as u64;
            sweep.expired += (before - data.len()) as u64;
        }

        if sweep.expired > 0 {
            self.expired_count.fetch_add(sweep.expired, Ordering::Relaxed);
        }
        sweep
    }

    // ========================================================================
    // COUNTERS
    // ========================================================================

    /// Parses the live value as `T`, applies `f` and stores the result, all
    /// under one write lock. Expiry and flags survive the update.
    ///
    /// A missing key is treated as zero when `create` is set, otherwise the
    /// call returns `Ok(None)`.
    fn update_number<T>(
        &self,
        key: &Bytes,
        create: bool,
        f: impl FnOnce(T) -> Result<T, StorageError>,
    ) -> Result<Option<T>, StorageError>
    where
        T: std::str::FromStr + ToString + Default,
    {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let now = Instant::now();
        let mut data = self.shard(key).write();
        self.purge_expired(&mut data, key, now);

        let current = match data.get(&key[..]) {
            Some(entry) => std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<T>().ok())
                .ok_or(StorageError::NotAnInteger)?,
            None if create => T::default(),
            None => return Ok(None),
        };

        let updated = f(current)?;
        let value = Bytes::from(updated.to_string());
        let version = self.next_version();
        match data.entry(key.clone()) {
            MapEntry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.value = value;
                entry.version = version;
            }
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    value,
                    expires_at: None,
                    version,
                    flags: 0,
                });
            }
        }
        Ok(Some(updated))
    }

    /// Increments a signed counter by 1.
    pub fn incr(&self, key: &Bytes) -> Result<i64, StorageError> {
        self.incr_by(key, 1)
    }

    /// Adds `delta` to a signed 64-bit counter. Missing keys start at 0.
    pub fn incr_by(&self, key: &Bytes, delta: i64) -> Result<i64, StorageError> {
        self.update_number(key, true, |n: i64| {
            n.checked_add(delta).ok_or(StorageError::OutOfRange)
        })
        .map(Option::unwrap_or_default)
    }

    /// Decrements a signed counter by 1.
    pub fn decr(&self, key: &Bytes) -> Result<i64, StorageError> {
        self.decr_by(key, 1)
    }

    /// Subtracts `delta` from a signed 64-bit counter.
    pub fn decr_by(&self, key: &Bytes, delta: i64) -> Result<i64, StorageError> {
        self.update_number(key, true, |n: i64| {
            n.checked_sub(delta).ok_or(StorageError::OutOfRange)
        })
        .map(Option::unwrap_or_default)
    }

    /// Moves an unsigned 64-bit counter by `delta`. Leaving `[0, u64::MAX]`
    /// fails with `OutOfRange`.
    pub fn unsigned_by(
        &self,
        key: &Bytes,
        delta: u64,
        direction: Direction,
    ) -> Result<u64, StorageError> {
        self.update_number(key, true, |n: u64| {
            match direction {
                Direction::Up => n.checked_add(delta),
                Direction::Down => n.checked_sub(delta),
            }
            .ok_or(StorageError::OutOfRange)
        })
        .map(Option::unwrap_or_default)
    }

    /// Memcached counter: wraps around in the unsigned domain and leaves a
    /// missing key missing (`Ok(None)`).
    pub fn wrapping_by(
        &self,
        key: &Bytes,
        delta: u64,
        direction: Direction,
    ) -> Result<Option<u64>, StorageError> {
        self.update_number(key, false, |n: u64| {
            Ok(match direction {
                Direction::Up => n.wrapping_add(delta),
                Direction::Down => n.wrapping_sub(delta),
            })
        })
    }

    /// Returns database statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.len(),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one [`StorageEngine::cleanup_expired`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sweep {
    /// Entries examined, expired or not
    pub scanned: u64,
    pub expired: u64,
}

/// Database statistics.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Number of live keys
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    /// Expired keys removed so far
    pub expired: u64,
}
