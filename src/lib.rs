//! tasksyncd - Taskwarrior synchronization server
//!
//! A drop-in replacement for `taskd`. Clients push their local task
//! modifications over mutually-authenticated TLS; the server merges them
//! into per-user append-only transaction logs and returns the
//! modifications the client is missing, together with a fresh sync key.
//!
//! # Module Organization
//!
//! - `cli`: command-line interface using clap
//! - `config`: `key = value` configuration files
//! - `error`: error types and result aliases
//! - `message`: length-prefixed wire frames and the message model
//! - `scanner`: cursor-oriented text scanner used by the task parser
//! - `task`: task records — Format-4 and JSON parsing, canonical emission
//! - `repository`: on-disk orgs/users layout and transaction logs
//! - `sync`: the three-way merge engine
//! - `server`: request pipeline and per-user locking
//! - `transport`: TLS listener and bounded worker pool

pub mod cli;
pub mod config;
pub mod error;
pub mod message;
pub mod repository;
pub mod scanner;
pub mod server;
pub mod sync;
pub mod task;
pub mod transport;

pub use error::{Error, Result};
