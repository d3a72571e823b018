//! Connection Handler Module
//!
//! Every client connection is handled by its own async task. All four
//! protocols share one listening port, so a task starts by sniffing the
//! first bytes and then runs the matching protocol codec.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept(), spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐     ┌───────────────────────────────────┐  │
//! │  │   sniff()   │────>│ RespCodec | MemcacheCodec |       │  │
//! │  └─────────────┘     │ HttpCodec | PostgresCodec         │  │
//! │                      └────────────────┬──────────────────┘  │
//! │                                       ▼                     │
//! │                              CommandHandler                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use polykv::connection::{handle_connection, ConnectionStats};
//! use polykv::commands::CommandHandler;
//! use polykv::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(StorageEngine::new());
//! let stats = Arc::new(ConnectionStats::new());
//! let handler = CommandHandler::new(storage);
//!
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, handler, stats));
//! ```

pub mod handler;
pub mod sniff;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
pub use sniff::{classify, Sniff};
