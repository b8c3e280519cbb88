//! # tether-store
//!
//! Durable conversation state for the Tether bridge: conversation metadata
//! (name, working directory, resume token, tool allow-list) plus an
//! append-only per-conversation message history, backed by SQLite.
//!
//! The store is deliberately narrow — the turn runner only needs
//! create/read/append/delete by id and resume-token get/set/clear. It is
//! safe for concurrent writers across different conversation ids; within
//! one id the conversation gate already serializes turns.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod store;

pub use connection::{
    ConnectionPool, PooledConnection, new_file_pool, new_in_memory_pool, run_migrations,
};
pub use errors::{Result, StoreError};
pub use store::{ConversationRow, ConversationStore, CreateConversationOptions, HistoryEntry};
