pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{DedupKey, PersistedStats, ValidatedAttempt};

pub use postgres::PgAttemptStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("no open transaction")]
    NoTransaction,
    #[error("unexpected row in {table}: {detail}")]
    InvalidRow { table: String, detail: String },
}

/// Storage operations the loader is built from. Chunk work happens between
/// `begin` and `commit`/`rollback`; everything else runs outside a transaction.
#[async_trait]
pub trait AttemptStore: Send {
    /// Name of the target table, for log lines.
    fn table(&self) -> &str;

    async fn table_exists(&mut self) -> Result<bool, StoreError>;

    /// Creates the table, its natural-key constraint and its secondary
    /// indexes. Safe to call when they already exist.
    async fn create_table(&mut self) -> Result<(), StoreError>;

    async fn server_version(&mut self) -> Result<String, StoreError>;

    async fn begin(&mut self) -> Result<(), StoreError>;

    /// Phase 1: which of `keys` already exist in the persistent table.
    async fn existing_keys(&mut self, keys: &[DedupKey]) -> Result<Vec<DedupKey>, StoreError>;

    /// Phase 2: inserts each row, silently skipping natural-key conflicts.
    /// Returns the number of rows actually written.
    async fn insert_ignoring_conflicts(
        &mut self,
        rows: &[&ValidatedAttempt],
    ) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    async fn persisted_stats(&mut self) -> Result<PersistedStats, StoreError>;

    async fn close(&mut self);
}
