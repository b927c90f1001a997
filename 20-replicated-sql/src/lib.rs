//! Raft-replicated SQL database speaking the Postgres wire protocol.
//!
//! Every node keeps a full copy of a small table store. Writes (CREATE TABLE,
//! INSERT) are proposed to raft as verbatim SQL text; once committed, every
//! node re-parses and executes them in log order, so every replica ends up
//! byte-for-byte identical. Reads (SELECT) are answered from the local copy
//! and never touch consensus.
//!
//! # Architecture
//!
//! - **Raft worker thread**: drives the tikv/raft node and applies committed
//!   entries; the only writer of the table store
//! - **Network listener thread**: accepts raft messages from peers
//! - **Tokio tasks**: one per Postgres client connection, plus the admin
//!   HTTP server
//!
//! Async code reaches the worker through a [`runtime::RaftHandle`]. The worker
//! answers over oneshot channels, so a client waiting for its write to commit
//! never blocks a runtime thread.
//!
//! # Modules
//!
//! - [`statement`]: SQL text to a small closed statement tree
//! - [`executor`]: runs statements against the [`table`] layer over a [`store`]
//! - [`state_machine`]: deterministic apply of committed SQL entries
//! - [`node`] / [`runtime`]: raft node, worker loop, peer transport
//! - [`protocol`] / [`frontend`]: Postgres wire codec and session handling
//! - [`admin`]: membership and status over HTTP

pub mod admin;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod frontend;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod state_machine;
pub mod statement;
pub mod store;
pub mod table;

pub use error::SqlError;
