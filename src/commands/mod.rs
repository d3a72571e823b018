//! Command Set Module
//!
//! The protocol-neutral layer between the adapters and the storage engine:
//! the [`Command`]/[`Reply`] vocabulary, the RESP-style command table, and
//! the [`CommandHandler`] that executes commands.

pub mod command;
pub mod handler;
pub mod parse;

pub use command::{Command, CommandError, CounterOp, Expiry, Item, Reply, TimeUnit};
pub use handler::CommandHandler;
