//! Storage Engine Module
//!
//! The sharded key-value store shared by every protocol, its key patterns
//! and the background expiry sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...N     │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use polykv::storage::{KeyPattern, StorageEngine};
//! use bytes::Bytes;
//!
//! let engine = StorageEngine::new();
//! engine.set(Bytes::from("user:1"), Bytes::from("ada")).unwrap();
//! engine.set(Bytes::from("user:2"), Bytes::from("alan")).unwrap();
//!
//! assert_eq!(engine.keys(&KeyPattern::parse(b"user:*")).len(), 2);
//! assert_eq!(engine.incr(&Bytes::from("visits")), Ok(1));
//! ```

pub mod engine;
pub mod expiry;
pub mod pattern;

pub use engine::{
    CasOutcome, Direction, Entry, KeyTtl, Placement, SetCondition, SetOptions, SetOutcome,
    StorageEngine, StorageError, StorageStats, Sweep,
};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use pattern::KeyPattern;
