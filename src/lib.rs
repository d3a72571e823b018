//! # polykv - One In-Memory Store, Four Wire Protocols
//!
//! polykv is an in-memory key-value server that answers memcached, Redis
//! (RESP), HTTP and a small Postgres dialect on a single TCP port. Every
//! protocol reads and writes the same store, so a key set through
//! `redis-cli` is immediately visible to `curl` or `psql`.
//!
//! ## Features
//!
//! - **Protocol sniffing**: the first bytes of a connection pick the adapter
//! - **Sharded storage**: independent `RwLock`s per shard
//! - **Versioned entries**: every mutation bumps a global version used for CAS
//! - **TTL support**: lazy expiry on access plus an adaptive background sweeper
//! - **Async I/O**: one Tokio task per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              polykv                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌───────────────────────────┐    │
//! │  │ TCP Server  │───>│   sniff     │───>│ memcache │ RESP │ HTTP │ PG │    │
//! │  │ (Listener)  │    │ (dispatch)  │    │      protocol codecs      │    │
//! │  └─────────────┘    └─────────────┘    └─────────────┬─────────────┘    │
//! │                                                      │ Command          │
//! │                                                      ▼                  │
//! │                                              ┌───────────────┐          │
//! │                                              │CommandHandler │          │
//! │                                              └───────┬───────┘          │
//! │                                                      ▼                  │
//! │                     ┌──────────────────────────────────────────────┐    │
//! │                     │              StorageEngine                   │    │
//! │                     │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │    │
//! │                     │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │    │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │    │
//! │                     └──────────────────────────────────────────────┘    │
//! │                                       ▲                                 │
//! │                     ┌─────────────────┴───────────────────────────────┐ │
//! │                     │           ExpirySweeper (Tokio task)            │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use polykv::storage::{StorageEngine, start_expiry_sweeper};
//! use polykv::commands::CommandHandler;
//! use polykv::connection::{handle_connection, ConnectionStats};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = Arc::new(StorageEngine::new());
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&storage));
//!     let stats = Arc::new(ConnectionStats::new());
//!
//!     let listener = TcpListener::bind("127.0.0.1:9401").await.unwrap();
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await.unwrap();
//!         let handler = CommandHandler::new(Arc::clone(&storage));
//!         let stats = Arc::clone(&stats);
//!
//!         tokio::spawn(handle_connection(stream, addr, handler, stats));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: sharded, versioned store with TTL support
//! - [`commands`]: the protocol-neutral command set
//! - [`protocol`]: the four wire codecs
//! - [`connection`]: protocol sniffing and the per-connection loop
//! - [`config`]: defaults, environment and command-line flags

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod storage;

pub use commands::CommandHandler;
pub use config::{Config, ConfigError};
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{Protocol, RespValue};
pub use storage::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper, StorageEngine};

/// The default port polykv listens on
pub const DEFAULT_PORT: u16 = 9401;

/// The default host polykv binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of polykv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
