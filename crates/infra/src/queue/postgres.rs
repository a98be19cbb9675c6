//! Postgres-backed lease queue.
//!
//! One row per lease record. Leasing runs in a transaction:
//!
//! 1. `SELECT ... WHERE retry_available AND lock_until < $now
//!    ORDER BY lock_until, created LIMIT 1 FOR UPDATE SKIP LOCKED`
//! 2. apply [`LeaseRecord::lease`] in Rust
//! 3. `UPDATE` the row and commit
//!
//! `SKIP LOCKED` makes concurrent workers pass over a row another transaction is
//! leasing instead of blocking on it, so each row has a single owner.
//!
//! ## Error Mapping
//!
//! | SQLx error / SQLSTATE | Class |
//! |---|---|
//! | `PoolTimedOut`, `Io`, class `08` (connection), `40001`, `40P01`, `55P03` | Transient |
//! | `53300` too many connections, `53400` configuration limit, `53200` out of memory | QuotaExceeded |
//! | class `28` (auth), `3D000` unknown database, `42P01` unknown table, anything else | Fatal |

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use auditflow_core::{Clock, ExternalRef, Job, RecordId, SystemClock};

use super::provider::{ErrorClass, QueueError, QueueProvider};
use super::record::{LeasePolicy, LeaseRecord, LeasedJob};

const BACKEND: &str = "postgres";

/// Default table name.
pub const DEFAULT_TABLE: &str = "audit_queue";

/// SQL text for one table, rendered once.
#[derive(Debug, Clone)]
struct Statements {
    create_table: String,
    create_index: String,
    insert: String,
    select_next: String,
    update_lease: String,
    delete: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create_table: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    created TIMESTAMPTZ NOT NULL,
                    lock_until TIMESTAMPTZ NOT NULL,
                    retries_remaining INTEGER NOT NULL,
                    retry_available BOOLEAN NOT NULL,
                    status TEXT NOT NULL,
                    message JSONB NOT NULL
                )
                "#
            ),
            create_index: format!(
                r#"
                CREATE INDEX IF NOT EXISTS {table}_lease_idx
                ON {table} (lock_until, created)
                WHERE retry_available
                "#
            ),
            insert: format!(
                r#"
                INSERT INTO {table} (
                    id, created, lock_until, retries_remaining, retry_available, status, message
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#
            ),
            select_next: format!(
                r#"
                SELECT id, created, lock_until, retries_remaining, retry_available, status, message
                FROM {table}
                WHERE retry_available AND lock_until < $1
                ORDER BY lock_until ASC, created ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#
            ),
            update_lease: format!(
                r#"
                UPDATE {table}
                SET retries_remaining = $2, retry_available = $3, lock_until = $4
                WHERE id = $1
                "#
            ),
            delete: format!("DELETE FROM {table} WHERE id = $1"),
        }
    }
}

/// Lease queue stored in one Postgres table.
///
/// The [`QueueProvider`] methods block on the stored runtime handle, so call them
/// from plain threads (the queue worker's own thread), not from async tasks.
#[derive(Debug, Clone)]
pub struct PostgresQueue {
    pool: Arc<PgPool>,
    runtime: Handle,
    table: String,
    sql: Arc<Statements>,
    policy: LeasePolicy,
    clock: Arc<dyn Clock>,
}

impl PostgresQueue {
    /// Wrap an existing pool using the default table.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            table: DEFAULT_TABLE.to_string(),
            sql: Arc::new(Statements::for_table(DEFAULT_TABLE)),
            policy: LeasePolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Open a small pool against `database_url`.
    pub fn connect(database_url: &str, runtime: Handle) -> Result<Self, QueueError> {
        let pool = runtime
            .block_on(PgPoolOptions::new().max_connections(5).connect(database_url))
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, runtime))
    }

    /// Use another table. Only `[A-Za-z0-9_]` names are accepted.
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self, QueueError> {
        let table = table.into();
        validate_identifier(&table)?;
        self.sql = Arc::new(Statements::for_table(&table));
        self.table = table;
        Ok(self)
    }

    pub fn with_policy(mut self, policy: LeasePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Clock time at the column precision (microseconds).
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    /// Create the table and its lease index if missing.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::query(&self.sql.create_table)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;
        sqlx::query(&self.sql.create_index)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(table = %self.table, title = %job.title), err)]
    pub async fn enqueue_async(&self, job: &Job) -> Result<ExternalRef, QueueError> {
        let record = LeaseRecord::new(job.clone(), &self.policy, self.now());

        sqlx::query(&self.sql.insert)
            .bind(record.id.as_uuid())
            .bind(record.created)
            .bind(record.lock_until)
            .bind(to_db_count(record.retries_remaining))
            .bind(record.retry_available)
            .bind(&record.status)
            .bind(Json(&record.message))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(record.external_ref())
    }

    #[instrument(skip(self), fields(table = %self.table, leased = tracing::field::Empty), err)]
    pub async fn lease_next_async(&self) -> Result<Option<LeasedJob>, QueueError> {
        let now = self.now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&self.sql.select_next)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_next", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            Span::current().record("leased", false);
            return Ok(None);
        };

        let mut record: LeaseRecord = LeaseRow::from_row(&row)
            .map_err(|e| QueueError::fatal(BACKEND, format!("failed to decode lease row: {e}")))?
            .into();
        record.lease(now, &self.policy);

        sqlx::query(&self.sql.update_lease)
            .bind(record.id.as_uuid())
            .bind(to_db_count(record.retries_remaining))
            .bind(record.retry_available)
            .bind(record.lock_until)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_lease", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("leased", true);
        debug!(record = %record.id, retries_remaining = record.retries_remaining, "record leased");
        Ok(Some(record.to_leased()))
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn delete_async(&self, external_ref: &ExternalRef) -> Result<(), QueueError> {
        let id = parse_ref(external_ref)?;
        sqlx::query(&self.sql.delete)
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    /// Drop the table. Used by tests that create one table per run.
    #[cfg(any(test, feature = "testing"))]
    pub async fn drop_table(&self) -> Result<(), QueueError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("drop_table", e))?;
        Ok(())
    }
}

impl QueueProvider for PostgresQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn enqueue(&self, job: &Job) -> Result<ExternalRef, QueueError> {
        self.runtime.block_on(self.enqueue_async(job))
    }

    fn lease_next(&self) -> Result<Option<LeasedJob>, QueueError> {
        self.runtime.block_on(self.lease_next_async())
    }

    fn delete(&self, external_ref: &ExternalRef) -> Result<(), QueueError> {
        self.runtime.block_on(self.delete_async(external_ref))
    }

    fn close(&self) -> Result<(), QueueError> {
        self.runtime.block_on(self.pool.close());
        Ok(())
    }
}

fn parse_ref(external_ref: &ExternalRef) -> Result<RecordId, QueueError> {
    external_ref
        .as_str()
        .parse::<RecordId>()
        .map_err(|e| QueueError::fatal(BACKEND, e.to_string()))
}

fn validate_identifier(name: &str) -> Result<(), QueueError> {
    let valid = !name.is_empty()
        && name.len() <= 48
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(QueueError::fatal(BACKEND, format!("invalid table name '{name}'")));
    }
    Ok(())
}

fn to_db_count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Classify a SQLSTATE code.
pub fn classify_sqlstate(code: &str) -> ErrorClass {
    match code {
        "40001" | "40P01" | "55P03" => ErrorClass::Transient,
        c if c.starts_with("08") => ErrorClass::Transient,
        "53300" | "53400" | "53200" => ErrorClass::QuotaExceeded,
        _ => ErrorClass::Fatal,
    }
}

/// Map SQLx errors to QueueError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            let class = db_err
                .code()
                .map(|code| classify_sqlstate(code.as_ref()))
                .unwrap_or(ErrorClass::Fatal);
            QueueError::classified(class, BACKEND, msg)
        }
        sqlx::Error::PoolTimedOut => {
            QueueError::transient(BACKEND, format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => QueueError::transient(BACKEND, format!("io error in {operation}: {e}")),
        sqlx::Error::PoolClosed => {
            QueueError::fatal(BACKEND, format!("connection pool closed in {operation}"))
        }
        other => QueueError::fatal(BACKEND, format!("sqlx error in {operation}: {other}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct LeaseRow {
    id: Uuid,
    created: DateTime<Utc>,
    lock_until: DateTime<Utc>,
    retries_remaining: i32,
    retry_available: bool,
    status: String,
    message: Json<Job>,
}

impl<'r> FromRow<'r, PgRow> for LeaseRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LeaseRow {
            id: row.try_get("id")?,
            created: row.try_get("created")?,
            lock_until: row.try_get("lock_until")?,
            retries_remaining: row.try_get("retries_remaining")?,
            retry_available: row.try_get("retry_available")?,
            status: row.try_get("status")?,
            message: row.try_get("message")?,
        })
    }
}

impl From<LeaseRow> for LeaseRecord {
    fn from(row: LeaseRow) -> Self {
        LeaseRecord {
            id: RecordId::from_uuid(row.id),
            created: row.created,
            lock_until: row.lock_until,
            retries_remaining: u32::try_from(row.retries_remaining).unwrap_or(0),
            retry_available: row.retry_available,
            status: row.status,
            message: row.message.0,
        }
    }
}
