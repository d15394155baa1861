//! Persistence backends for the ledger.
//!
//! The relational store is the source of truth across restarts: the
//! in-memory chain is rebuilt by replaying the `blocks` table in index
//! order, and every lifecycle command commits its block together with
//! its relational rows in a single transaction.
//!
//! [`sqlite::SqliteStore`] is the production backend (embedded SQLite
//! via rusqlite); tests run it against in-memory databases.

use std::fmt;

pub mod sqlite;

pub use sqlite::{EventRecord, SqliteStore};

/// Storage-level error type.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite error.
    Sqlite(rusqlite::Error),
    /// Stored data cannot be decoded back into domain types.
    Corrupted(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Corrupted(msg) => write!(f, "corrupted row: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
