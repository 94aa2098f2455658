use std::{collections::HashSet, num::NonZeroUsize, time::Instant};
use thiserror::Error;

use crate::models::{DedupKey, PersistedStats, ValidatedAttempt};
use crate::store::{AttemptStore, StoreError};

/// Failures the loader cannot recover from. Chunk failures are not here: they
/// are rolled back, logged and counted in `LoadReport::failed_chunks`.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("storage connection failed: {0}")]
    Connection(#[source] StoreError),
    #[error("schema bootstrap for table {table} failed: {source}")]
    Schema {
        table: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub submitted: usize,
    /// Rows actually written; conflict-guarded rows are not counted.
    pub inserted: u64,
    /// Rows the pre-filter found already persisted.
    pub skipped_existing: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkOutcome {
    skipped_existing: usize,
    inserted: u64,
}

/// Idempotent batch loader over a single attempts table.
pub struct Loader<S> {
    store: S,
    schema_ready: bool,
}

impl<S: AttemptStore> Loader<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            schema_ready: false,
        }
    }

    /// Probes the connection and returns the server version string.
    pub async fn check_connection(&mut self) -> Result<String, LoadError> {
        let version = self
            .store
            .server_version()
            .await
            .map_err(LoadError::Connection)?;
        tracing::info!(%version, "database connection ok");
        Ok(version)
    }

    /// Creates the table on first use. Checked once per loader lifetime.
    pub async fn ensure_schema(&mut self) -> Result<(), LoadError> {
        if self.schema_ready {
            return Ok(());
        }
        let table = self.store.table().to_owned();
        let exists = self
            .store
            .table_exists()
            .await
            .map_err(|source| LoadError::Schema {
                table: table.clone(),
                source,
            })?;
        if !exists {
            self.store
                .create_table()
                .await
                .map_err(|source| LoadError::Schema {
                    table: table.clone(),
                    source,
                })?;
            tracing::info!(%table, "table created");
        }
        self.schema_ready = true;
        Ok(())
    }

    /// Inserts `records` in chunks of `batch_size`, one transaction per chunk.
    /// A failed chunk is rolled back and skipped; the rest still load.
    pub async fn load(
        &mut self,
        records: &[ValidatedAttempt],
        batch_size: NonZeroUsize,
    ) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport {
            submitted: records.len(),
            ..LoadReport::default()
        };
        if records.is_empty() {
            tracing::warn!("no data given to insert");
            return Ok(report);
        }

        let started = Instant::now();
        tracing::info!(rows = records.len(), "start of inserting data");
        self.ensure_schema().await?;

        let total_chunks = records.len().div_ceil(batch_size.get());
        for (n, chunk) in records.chunks(batch_size.get()).enumerate() {
            let chunk_no = n + 1;
            report.chunks += 1;
            self.store.begin().await.map_err(LoadError::Connection)?;

            match self.load_chunk(chunk).await {
                Ok(outcome) => {
                    report.inserted += outcome.inserted;
                    report.skipped_existing += outcome.skipped_existing;
                    tracing::debug!(
                        chunk = chunk_no,
                        total_chunks,
                        inserted = outcome.inserted,
                        "chunk committed"
                    );
                }
                Err(e) => {
                    report.failed_chunks += 1;
                    if let Err(rb) = self.store.rollback().await {
                        tracing::warn!(chunk = chunk_no, error = %rb, "rollback failed");
                    }
                    tracing::error!(chunk = chunk_no, total_chunks, error = %e, "chunk insert failed");
                }
            }
        }

        tracing::info!(
            inserted = report.inserted,
            rows = report.submitted,
            skipped_existing = report.skipped_existing,
            failed_chunks = report.failed_chunks,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "end of data insertion"
        );
        Ok(report)
    }

    async fn load_chunk(&mut self, chunk: &[ValidatedAttempt]) -> Result<ChunkOutcome, StoreError> {
        // phase 1: drop keys that are already persisted
        let keys: Vec<DedupKey> = chunk.iter().map(ValidatedAttempt::dedup_key).collect();
        let existing: HashSet<DedupKey> = self.store.existing_keys(&keys).await?.into_iter().collect();
        let fresh: Vec<&ValidatedAttempt> = chunk
            .iter()
            .zip(&keys)
            .filter(|(_, key)| !existing.contains(*key))
            .map(|(row, _)| row)
            .collect();
        let skipped_existing = chunk.len() - fresh.len();
        if skipped_existing > 0 {
            tracing::warn!(duplicates = skipped_existing, "records already persisted, skipping");
        }

        // phase 2: the conflict target is what actually guarantees uniqueness
        let inserted = if fresh.is_empty() {
            0
        } else {
            self.store.insert_ignoring_conflicts(&fresh).await?
        };
        self.store.commit().await?;

        Ok(ChunkOutcome {
            skipped_existing,
            inserted,
        })
    }

    /// Table-wide totals, or `None` if they could not be read.
    pub async fn read_persisted_stats(&mut self) -> Option<PersistedStats> {
        match self.store.persisted_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::error!(table = self.store.table(), error = %e, "error reading persisted stats");
                None
            }
        }
    }

    pub async fn close(&mut self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::validate::tests::attempt;
    use serde_json::json;

    fn batch(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn attempts(count: usize) -> Vec<ValidatedAttempt> {
        (0..count)
            .map(|i| {
                attempt(
                    &format!("user-{}", i % 7),
                    if i % 3 == 0 { "run" } else { "submit" },
                    json!(i % 2),
                    &format!("2023-04-01 10:{:02}:{:02}.{:06}", (i / 60) % 60, i % 60, i),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn second_load_inserts_nothing() {
        let store = MemoryStore::new();
        let mut loader = Loader::new(store.clone());
        let records = attempts(10);

        let first = loader.load(&records, batch(100)).await.unwrap();
        assert_eq!(first.inserted, 10);

        let second = loader.load(&records, batch(100)).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_existing, 10);
        assert_eq!(store.state().rows.len(), 10);
    }

    #[tokio::test]
    async fn schema_is_created_once() {
        let store = MemoryStore::new();
        let mut loader = Loader::new(store.clone());
        loader.load(&attempts(3), batch(2)).await.unwrap();
        loader.load(&attempts(3), batch(2)).await.unwrap();
        assert_eq!(store.state().create_calls, 1);
    }

    #[tokio::test]
    async fn existing_table_is_not_recreated() {
        let store = MemoryStore::with(|s| s.table_exists = true);
        let mut loader = Loader::new(store.clone());
        loader.load(&attempts(1), batch(1)).await.unwrap();
        assert_eq!(store.state().create_calls, 0);
    }

    #[tokio::test]
    async fn duplicate_keys_survive_once_whatever_the_batching() {
        let mut records = attempts(5);
        let original = &records[1];
        // same natural key, different correctness
        let twin = attempt(
            original.user_id(),
            original.attempt_type().as_str(),
            json!(if original.is_correct() { 0 } else { 1 }),
            &original.created_at().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        );
        assert_eq!(twin.dedup_key(), original.dedup_key());
        assert_ne!(&twin, original);
        records.push(twin);

        for size in [1, 2, 6] {
            let store = MemoryStore::new();
            let mut loader = Loader::new(store.clone());
            let report = loader.load(&records, batch(size)).await.unwrap();
            assert_eq!(report.inserted, 5, "batch size {size}");
            assert_eq!(store.state().rows.len(), 5);
        }
    }

    #[tokio::test]
    async fn failed_chunk_is_rolled_back_and_skipped() {
        let store = MemoryStore::with(|s| s.fail_insert_in_transaction = Some(2));
        let mut loader = Loader::new(store.clone());

        let report = loader.load(&attempts(150), batch(100)).await.unwrap();
        assert_eq!(report.chunks, 2);
        assert_eq!(report.failed_chunks, 1);
        assert_eq!(report.inserted, 100);

        let state = store.state();
        assert_eq!(state.transactions, 2);
        assert_eq!(state.commits, 1);
        assert_eq!(state.rollbacks, 1);
        assert_eq!(state.rows.len(), 100);
    }

    #[tokio::test]
    async fn conflict_guard_catches_what_the_prefilter_missed() {
        let store = MemoryStore::new();
        let mut loader = Loader::new(store.clone());
        let records = attempts(4);
        loader.load(&records, batch(10)).await.unwrap();

        store.state().blind_prefilter = true;
        let report = loader.load(&records, batch(10)).await.unwrap();
        assert_eq!(report.skipped_existing, 0);
        assert_eq!(report.inserted, 0);
        assert_eq!(store.state().rows.len(), 4);
    }

    #[tokio::test]
    async fn overlapping_windows_only_add_new_rows() {
        let store = MemoryStore::new();
        let mut loader = Loader::new(store.clone());
        let all = attempts(30);

        loader.load(&all[..20], batch(7)).await.unwrap();
        let report = loader.load(&all[10..], batch(7)).await.unwrap();
        assert_eq!(report.inserted, 10);
        assert_eq!(report.skipped_existing, 10);
        assert_eq!(store.state().rows.len(), 30);
    }

    #[tokio::test]
    async fn empty_input_touches_nothing() {
        let store = MemoryStore::with(|s| s.fail_connect = true);
        let mut loader = Loader::new(store.clone());
        let report = loader.load(&[], batch(100)).await.unwrap();
        assert_eq!(report, LoadReport::default());
        assert_eq!(store.state().transactions, 0);
    }

    #[tokio::test]
    async fn bootstrap_failures_are_fatal() {
        let mut loader = Loader::new(MemoryStore::with(|s| s.fail_connect = true));
        assert!(matches!(
            loader.load(&attempts(1), batch(1)).await,
            Err(LoadError::Schema { .. })
        ));

        let mut loader = Loader::new(MemoryStore::with(|s| s.fail_create = true));
        assert!(matches!(
            loader.load(&attempts(1), batch(1)).await,
            Err(LoadError::Schema { .. })
        ));

        let mut loader = Loader::new(MemoryStore::with(|s| s.fail_connect = true));
        assert!(matches!(
            loader.check_connection().await,
            Err(LoadError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn persisted_stats_reflect_the_table() {
        let store = MemoryStore::new();
        let mut loader = Loader::new(store.clone());
        let records = attempts(6);
        loader.load(&records, batch(4)).await.unwrap();

        let stats = loader.read_persisted_stats().await.unwrap();
        assert_eq!(stats.total_records, 6);
        assert_eq!(stats.unique_users, 6);
        assert_eq!(stats.run_attempts, 2);
        assert_eq!(stats.submit_attempts, 4);
        assert_eq!(stats.correct_attempts, 3);
        assert_eq!(stats.incorrect_attempts, 3);
        assert_eq!(stats.earliest_attempt, Some(records[0].created_at()));

        store.state().fail_stats = true;
        assert_eq!(loader.read_persisted_stats().await, None);
    }
}
