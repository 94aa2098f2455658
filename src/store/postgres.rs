use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{Postgres, Transaction};

use super::{AttemptStore, StoreError};
use crate::config::TableName;
use crate::db::Db;
use crate::models::{AttemptType, DedupKey, PersistedStats, ValidatedAttempt};

const STAGING_TABLE: &str = "temp_attempt_keys";

pub struct PgAttemptStore {
    db: Db,
    table: TableName,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgAttemptStore {
    pub fn new(db: Db, table: TableName) -> Self {
        Self { db, table, tx: None }
    }

    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::NoTransaction)
    }

    fn schema_statements(&self) -> [String; 4] {
        let t = self.table.as_str();
        [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    id SERIAL PRIMARY KEY,
                    user_id VARCHAR(255) NOT NULL,
                    oauth_consumer_key VARCHAR(255),
                    lis_result_sourcedid TEXT NOT NULL,
                    lis_outcome_service_url TEXT NOT NULL,
                    is_correct BOOLEAN,
                    attempt_type VARCHAR(10) NOT NULL CHECK (attempt_type IN ('run', 'submit')),
                    created_at TIMESTAMP NOT NULL,
                    loaded_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                    CONSTRAINT {t}_natural_key UNIQUE (user_id, lis_result_sourcedid, attempt_type, created_at)
                )
                "#
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{t}_user_id ON {t} (user_id)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{t}_created_at ON {t} (created_at)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{t}_attempt_type ON {t} (attempt_type)"),
        ]
    }
}

#[async_trait]
impl AttemptStore for PgAttemptStore {
    fn table(&self) -> &str {
        self.table.as_str()
    }

    async fn table_exists(&mut self) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(self.table.as_str())
        .fetch_one(&self.db)
        .await?;
        Ok(exists)
    }

    async fn create_table(&mut self) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;
        for stmt in self.schema_statements() {
            sqlx::query(&stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn server_version(&mut self) -> Result<String, StoreError> {
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&self.db)
            .await?;
        Ok(version)
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        if let Some(stale) = self.tx.take() {
            stale.rollback().await?;
        }
        self.tx = Some(self.db.begin().await?);
        Ok(())
    }

    async fn existing_keys(&mut self, keys: &[DedupKey]) -> Result<Vec<DedupKey>, StoreError> {
        let table = self.table.as_str().to_owned();
        let create_staging = format!(
            r#"
            CREATE TEMP TABLE {STAGING_TABLE} (
                user_id VARCHAR(255),
                lis_result_sourcedid TEXT,
                attempt_type VARCHAR(10),
                created_at TIMESTAMP
            ) ON COMMIT DROP
            "#
        );
        let stage = format!(
            r#"
            INSERT INTO {STAGING_TABLE} (user_id, lis_result_sourcedid, attempt_type, created_at)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::timestamp[])
            "#
        );
        let join = format!(
            r#"
            SELECT DISTINCT t.user_id, t.lis_result_sourcedid, t.attempt_type, t.created_at
            FROM {STAGING_TABLE} t
            JOIN {table} a
              ON t.user_id = a.user_id
             AND t.lis_result_sourcedid = a.lis_result_sourcedid
             AND t.attempt_type = a.attempt_type
             AND t.created_at = a.created_at
            "#
        );

        let users: Vec<String> = keys.iter().map(|k| k.user_id.clone()).collect();
        let sources: Vec<String> = keys.iter().map(|k| k.lis_result_sourcedid.clone()).collect();
        let kinds: Vec<String> = keys.iter().map(|k| k.attempt_type.to_string()).collect();
        let created: Vec<NaiveDateTime> = keys.iter().map(|k| k.created_at).collect();

        let tx = self.tx()?;
        sqlx::query(&create_staging).execute(&mut **tx).await?;
        sqlx::query(&stage)
            .bind(users)
            .bind(sources)
            .bind(kinds)
            .bind(created)
            .execute(&mut **tx)
            .await?;
        let rows: Vec<(String, String, String, NaiveDateTime)> =
            sqlx::query_as(&join).fetch_all(&mut **tx).await?;

        rows.into_iter()
            .map(|(user_id, lis_result_sourcedid, kind, created_at)| {
                let attempt_type = kind.parse::<AttemptType>().map_err(|detail| {
                    StoreError::InvalidRow {
                        table: table.clone(),
                        detail,
                    }
                })?;
                Ok(DedupKey {
                    user_id,
                    lis_result_sourcedid,
                    attempt_type,
                    created_at,
                })
            })
            .collect()
    }

    async fn insert_ignoring_conflicts(
        &mut self,
        rows: &[&ValidatedAttempt],
    ) -> Result<u64, StoreError> {
        let insert = format!(
            r#"
            INSERT INTO {} (user_id, oauth_consumer_key, lis_result_sourcedid,
                            lis_outcome_service_url, is_correct, attempt_type, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (user_id, lis_result_sourcedid, attempt_type, created_at)
            DO NOTHING
            "#,
            self.table.as_str()
        );

        let tx = self.tx()?;
        let mut inserted = 0;
        for row in rows {
            inserted += sqlx::query(&insert)
                .bind(row.user_id())
                .bind(row.oauth_consumer_key())
                .bind(row.lis_result_sourcedid())
                .bind(row.lis_outcome_service_url())
                .bind(row.is_correct())
                .bind(row.attempt_type().as_str())
                .bind(row.created_at())
                .execute(&mut **tx)
                .await?
                .rows_affected();
        }
        Ok(inserted)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::NoTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }

    async fn persisted_stats(&mut self) -> Result<PersistedStats, StoreError> {
        let query = format!(
            r#"
            SELECT
                COUNT(*) AS total_records,
                COUNT(DISTINCT user_id) AS unique_users,
                COUNT(*) FILTER (WHERE attempt_type = 'submit') AS submit_attempts,
                COUNT(*) FILTER (WHERE attempt_type = 'run') AS run_attempts,
                COUNT(*) FILTER (WHERE is_correct = TRUE) AS correct_attempts,
                COUNT(*) FILTER (WHERE is_correct = FALSE) AS incorrect_attempts,
                MIN(created_at) AS earliest_attempt,
                MAX(created_at) AS latest_attempt
            FROM {}
            "#,
            self.table.as_str()
        );
        let stats = sqlx::query_as::<_, PersistedStats>(&query)
            .fetch_one(&self.db)
            .await?;
        Ok(stats)
    }

    async fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                tracing::warn!(error = %e, "rollback of abandoned transaction failed");
            }
        }
        self.db.close().await;
        tracing::debug!(table = self.table.as_str(), "postgres connection closed");
    }
}
