//! SQLite-backed job store.
//!
//! Jobs live in a single `jobs` table. Status transitions are conditional
//! `UPDATE`s (`WHERE id = ? AND status = ?`), so the claim from `pending` to
//! `processing` is atomic in the database and a losing dispatcher observes a
//! conflict instead of running the job a second time. Settling a claim also
//! matches the claimed attempt number.
//!
//! File databases are opened in WAL mode so that enqueues do not block
//! dispatchers reading the pending batch.
//!
//! ## Storage format
//!
//! | Column | Encoding |
//! |--------|----------|
//! | `id` | UUID text |
//! | `payload` | JSON text (always an object) |
//! | `status` | `pending` / `processing` / `completed` / `failed` |
//! | timestamps | RFC 3339, UTC, fixed nanosecond precision (sorts lexically) |
//!
//! `seq` is an autoincrement rowid used to break `created_at` ties so that
//! dispatch order equals insertion order.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::instrument;

use formjobs_core::JobId;

use super::store::{JobStore, JobStoreError, STALE_FINAL_ATTEMPT};
use super::types::{JobFilter, JobRecord, JobStats, JobStatus, NewJob, Payload};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        id               TEXT    NOT NULL UNIQUE,
        queue            TEXT    NOT NULL,
        payload          TEXT    NOT NULL,
        attempts         INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts     INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts > 0),
        status           TEXT    NOT NULL DEFAULT 'pending'
                         CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
        error            TEXT    NULL,
        created_at       TEXT    NOT NULL,
        processed_at     TEXT    NULL,
        next_eligible_at TEXT    NULL,
        claimed_at       TEXT    NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_created_at ON jobs (status, created_at, seq)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs (queue, status)",
];

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "id, queue, payload, attempts, max_attempts, status, error, \
                       created_at, processed_at, next_eligible_at, claimed_at";

/// SQLite-backed job store.
///
/// Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://formjobs.db`.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("parse_url", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool))
    }

    /// A private in-memory database with the schema applied.
    ///
    /// Limited to one connection: every `:memory:` connection is its own
    /// database.
    pub async fn in_memory() -> Result<Self, JobStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `jobs` table and its indexes. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    /// Turn a zero-row conditional update into the right error.
    async fn explain_miss(&self, id: JobId, expected: &(dyn Display + Sync)) -> JobStoreError {
        let row = sqlx::query("SELECT status, attempts FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await;

        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return JobStoreError::NotFound(id),
            Err(e) => return map_sqlx_error("explain_miss", e),
        };

        let status: Result<String, _> = row.try_get("status").map_err(corrupt("status"));
        let attempts: Result<i64, _> = row.try_get("attempts").map_err(corrupt("attempts"));

        match (status, attempts) {
            (Ok(status), Ok(attempts)) => JobStoreError::conflict(
                id,
                format!("expected {expected}, found {status} with {attempts} attempts"),
            ),
            (Err(e), _) | (_, Err(e)) => e,
        }
    }

    async fn update_from<'q>(
        &self,
        operation: &str,
        id: JobId,
        expected: &(dyn Display + Sync),
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<(), JobStoreError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(id, expected).await);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(queue = %job.queue), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        let id = JobId::new();
        let record = job.into_record(id, Utc::now());
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| JobStoreError::Storage(format!("payload serialization failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, attempts, max_attempts, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(id.to_string())
        .bind(&record.queue)
        .bind(payload)
        .bind(i64::from(record.attempts))
        .bind(i64::from(record.max_attempts))
        .bind(record.status.as_str())
        .bind(encode_time(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(record)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self), err)]
    async fn fetch_pending_batch(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM jobs
            WHERE status = 'pending'
              AND attempts < max_attempts
              AND (next_eligible_at IS NULL OR next_eligible_at <= ?1)
            ORDER BY created_at ASC, seq ASC
            LIMIT ?2
            "#
        ))
        .bind(encode_time(Utc::now()))
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending_batch", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_processing(&self, id: JobId, attempts: u32) -> Result<(), JobStoreError> {
        if attempts == 0 {
            return Err(JobStoreError::conflict(id, "claimed attempt must be at least 1"));
        }

        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing',
                attempts = ?2,
                claimed_at = ?3
            WHERE id = ?1
              AND status = 'pending'
              AND attempts = ?2 - 1
              AND ?2 <= max_attempts
            "#,
        )
        .bind(id.to_string())
        .bind(i64::from(attempts))
        .bind(encode_time(Utc::now()));

        self.update_from("mark_processing", id, &JobStatus::Pending, query)
            .await
    }

    #[instrument(skip(self), err)]
    async fn mark_completed(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                processed_at = ?2,
                claimed_at = NULL,
                error = NULL
            WHERE id = ?1 AND status = 'processing' AND attempts = ?3
            "#,
        )
        .bind(id.to_string())
        .bind(encode_time(processed_at))
        .bind(i64::from(attempt));

        self.update_from("mark_completed", id, &claim(attempt), query)
            .await
    }

    #[instrument(skip(self), err)]
    async fn mark_failed_retryable(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                processed_at = ?2,
                next_eligible_at = ?3,
                claimed_at = NULL,
                error = NULL
            WHERE id = ?1 AND status = 'processing' AND attempts = ?4
            "#,
        )
        .bind(id.to_string())
        .bind(encode_time(processed_at))
        .bind(next_eligible_at.map(encode_time))
        .bind(i64::from(attempt));

        self.update_from("mark_failed_retryable", id, &claim(attempt), query)
            .await
    }

    #[instrument(skip(self, error), err)]
    async fn mark_failed_terminal(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                processed_at = ?2,
                claimed_at = NULL,
                error = ?3
            WHERE id = ?1 AND status = 'processing' AND attempts = ?4
            "#,
        )
        .bind(id.to_string())
        .bind(encode_time(processed_at))
        .bind(error.to_string())
        .bind(i64::from(attempt));

        self.update_from("mark_failed_terminal", id, &claim(attempt), query)
            .await
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR queue = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at ASC, seq ASC
            LIMIT ?3
            "#
        ))
        .bind(filter.queue.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(to_limit(filter.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM jobs
            WHERE (?1 IS NULL OR queue = ?1)
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(corrupt("status"))?;
            let total: i64 = row.try_get("total").map_err(corrupt("total"))?;
            let status = JobStatus::from_str(&status).map_err(JobStoreError::Corrupt)?;
            stats.record(status, total.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn requeue(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = 0,
                error = NULL,
                next_eligible_at = NULL,
                claimed_at = NULL
            WHERE id = ?1 AND status = 'failed'
            "#,
        )
        .bind(id.to_string());

        self.update_from("requeue", id, &JobStatus::Failed, query)
            .await?;
        self.get(id).await?.ok_or(JobStoreError::NotFound(id))
    }

    #[instrument(skip(self), err)]
    async fn recover_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let cutoff = encode_time(claimed_before);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("recover_stale", e))?;

        let exhausted = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                processed_at = ?2,
                claimed_at = NULL,
                error = ?3
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at < ?1)
              AND attempts >= max_attempts
            "#,
        )
        .bind(&cutoff)
        .bind(encode_time(Utc::now()))
        .bind(STALE_FINAL_ATTEMPT)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        let released = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                claimed_at = NULL,
                next_eligible_at = NULL
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at < ?1)
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("recover_stale", e))?;

        Ok(exhausted.rows_affected() + released.rows_affected())
    }
}

fn claim(attempt: u32) -> String {
    format!("{} at attempt {attempt}", JobStatus::Processing)
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(column: &str, raw: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobStoreError::Corrupt(format!("invalid {column} '{raw}': {e}")))
}

fn decode_optional_time(
    row: &SqliteRow,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, JobStoreError> {
    let raw: Option<String> = row.try_get(column).map_err(corrupt(column))?;
    raw.map(|s| decode_time(column, &s)).transpose()
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn corrupt(column: &'static str) -> impl Fn(sqlx::Error) -> JobStoreError {
    move |e| JobStoreError::Corrupt(format!("failed to read {column}: {e}"))
}

fn to_u32(column: &'static str, value: i64) -> Result<u32, JobStoreError> {
    u32::try_from(value)
        .map_err(|_| JobStoreError::Corrupt(format!("{column} out of range: {value}")))
}

/// Map a database row into a `JobRecord`.
fn row_to_job(row: &SqliteRow) -> Result<JobRecord, JobStoreError> {
    let id: String = row.try_get("id").map_err(corrupt("id"))?;
    let id = JobId::from_str(&id).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;

    let payload: String = row.try_get("payload").map_err(corrupt("payload"))?;
    let payload: Payload = serde_json::from_str(&payload)
        .map_err(|e| JobStoreError::Corrupt(format!("invalid JSON payload for job {id}: {e}")))?;

    let status: String = row.try_get("status").map_err(corrupt("status"))?;
    let status = JobStatus::from_str(&status).map_err(JobStoreError::Corrupt)?;

    let created_at: String = row.try_get("created_at").map_err(corrupt("created_at"))?;

    Ok(JobRecord {
        id,
        queue: row.try_get("queue").map_err(corrupt("queue"))?,
        payload,
        attempts: to_u32("attempts", row.try_get("attempts").map_err(corrupt("attempts"))?)?,
        max_attempts: to_u32(
            "max_attempts",
            row.try_get("max_attempts").map_err(corrupt("max_attempts"))?,
        )?,
        status,
        error: row.try_get("error").map_err(corrupt("error"))?,
        created_at: decode_time("created_at", &created_at)?,
        processed_at: decode_optional_time(row, "processed_at")?,
        next_eligible_at: decode_optional_time(row, "next_eligible_at")?,
        claimed_at: decode_optional_time(row, "claimed_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation()
                || db_err.is_check_violation()
                || db_err.is_foreign_key_violation()
            {
                JobStoreError::Storage(format!(
                    "constraint violation in {operation}: {}",
                    db_err.message()
                ))
            } else {
                JobStoreError::Storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                ))
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
