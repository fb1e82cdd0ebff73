//! Durable storage for screening records.
//!
//! Records are append-only: the pipeline writes one per stimulus flush and
//! the decision engine reads a user's full history back, newest first.

pub mod sqlite;

use crate::core::{ScreeningRecord, UserId};
use std::sync::Mutex;
use thiserror::Error;

pub use sqlite::SqliteStore;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("store lock poisoned")]
    Poisoned,
}

/// Append-only record storage shared by all connections.
pub trait RecordStore: Send + Sync {
    /// Persist one record. Visible to subsequent reads once this returns.
    fn append(&self, record: &ScreeningRecord) -> Result<(), StoreError>;

    /// All records for `user_id`, newest first.
    fn list_by_user(&self, user_id: &UserId) -> Result<Vec<ScreeningRecord>, StoreError>;
}

/// Volatile store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<ScreeningRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all users.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    fn append(&self, record: &ScreeningRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(record.clone());
        Ok(())
    }

    fn list_by_user(&self, user_id: &UserId) -> Result<Vec<ScreeningRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        // Insertion order reversed, then a stable sort keeps later appends
        // first among equal timestamps.
        let mut matching: Vec<ScreeningRecord> = records
            .iter()
            .rev()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matching)
    }
}
