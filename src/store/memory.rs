// In-memory AttemptStore used by loader and pipeline tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::{AttemptStore, StoreError};
use crate::models::{AttemptType, DedupKey, PersistedStats, ValidatedAttempt};

#[derive(Default)]
pub struct MemoryState {
    pub table_exists: bool,
    pub create_calls: usize,
    pub rows: Vec<ValidatedAttempt>,
    pub keys: HashSet<DedupKey>,
    pub pending: Option<Vec<ValidatedAttempt>>,
    pub transactions: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub closed: bool,
    /// 1-based transaction number whose insert fails.
    pub fail_insert_in_transaction: Option<usize>,
    pub fail_create: bool,
    pub fail_connect: bool,
    pub fail_stats: bool,
    /// Pretend the pre-filter saw nothing, as if a concurrent run won the race.
    pub blind_prefilter: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    pub state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(configure: impl FnOnce(&mut MemoryState)) -> Self {
        let store = Self::new();
        configure(&mut *store.state.lock().unwrap());
        store
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }
}

fn injected(msg: &str) -> StoreError {
    StoreError::Database(sqlx::Error::Protocol(msg.to_owned()))
}

#[async_trait]
impl AttemptStore for MemoryStore {
    fn table(&self) -> &str {
        "memory_attempts"
    }

    async fn table_exists(&mut self) -> Result<bool, StoreError> {
        let state = self.state();
        if state.fail_connect {
            return Err(injected("connection refused"));
        }
        Ok(state.table_exists)
    }

    async fn create_table(&mut self) -> Result<(), StoreError> {
        let mut state = self.state();
        state.create_calls += 1;
        if state.fail_create {
            return Err(injected("permission denied for schema public"));
        }
        state.table_exists = true;
        Ok(())
    }

    async fn server_version(&mut self) -> Result<String, StoreError> {
        if self.state().fail_connect {
            return Err(injected("connection refused"));
        }
        Ok("PostgreSQL 16.0 (memory)".into())
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        let mut state = self.state();
        state.transactions += 1;
        state.pending = Some(Vec::new());
        Ok(())
    }

    async fn existing_keys(&mut self, keys: &[DedupKey]) -> Result<Vec<DedupKey>, StoreError> {
        let state = self.state();
        if state.pending.is_none() {
            return Err(StoreError::NoTransaction);
        }
        if state.blind_prefilter {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::new();
        Ok(keys
            .iter()
            .filter(|k| state.keys.contains(*k) && seen.insert((*k).clone()))
            .cloned()
            .collect())
    }

    async fn insert_ignoring_conflicts(
        &mut self,
        rows: &[&ValidatedAttempt],
    ) -> Result<u64, StoreError> {
        let mut state = self.state();
        if state.fail_insert_in_transaction == Some(state.transactions) {
            return Err(injected("insert failed"));
        }
        let committed = state.keys.clone();
        let pending = state.pending.as_mut().ok_or(StoreError::NoTransaction)?;
        let mut inserted = 0;
        for row in rows {
            let key = row.dedup_key();
            if committed.contains(&key) || pending.iter().any(|p| p.dedup_key() == key) {
                continue;
            }
            pending.push((*row).clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut state = self.state();
        let pending = state.pending.take().ok_or(StoreError::NoTransaction)?;
        for row in pending {
            state.keys.insert(row.dedup_key());
            state.rows.push(row);
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.pending.take().is_some() {
            state.rollbacks += 1;
        }
        Ok(())
    }

    async fn persisted_stats(&mut self) -> Result<PersistedStats, StoreError> {
        let state = self.state();
        if state.fail_stats {
            return Err(injected("relation does not exist"));
        }
        let count = |pred: &dyn Fn(&ValidatedAttempt) -> bool| {
            state.rows.iter().filter(|r| pred(*r)).count() as i64
        };
        let users: HashSet<&str> = state.rows.iter().map(|r| r.user_id()).collect();
        Ok(PersistedStats {
            total_records: state.rows.len() as i64,
            unique_users: users.len() as i64,
            submit_attempts: count(&|r| r.attempt_type() == AttemptType::Submit),
            run_attempts: count(&|r| r.attempt_type() == AttemptType::Run),
            correct_attempts: count(&|r| r.is_correct()),
            incorrect_attempts: count(&|r| !r.is_correct()),
            earliest_attempt: state.rows.iter().map(|r| r.created_at()).min(),
            latest_attempt: state.rows.iter().map(|r| r.created_at()).max(),
        })
    }

    async fn close(&mut self) {
        self.state().closed = true;
    }
}
