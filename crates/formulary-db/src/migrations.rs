//! PostgreSQL executor for the migration runner.
//!
//! Guards are answered from `information_schema` and the system catalogs,
//! scoped to `current_schema()` so isolated test schemas see only their own
//! objects. Each forward action runs in its own transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use formulary_core::defaults::{MIGRATION_LEDGER_TABLE, MIGRATION_LOCK_KEY};
use formulary_core::{Error, Guard, MigrationExecutor, MigrationStep, Result, StepState};

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub name: String,
    pub state: StepState,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Migration executor backed by a PostgreSQL pool.
pub struct PgMigrationExecutor {
    pool: PgPool,
    lock_key: i64,
    /// Connection holding the session advisory lock while a run is active.
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgMigrationExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_key: MIGRATION_LOCK_KEY,
            lock_conn: Mutex::new(None),
        }
    }

    /// Use a different advisory lock key.
    pub fn with_lock_key(mut self, key: i64) -> Self {
        self.lock_key = key;
        self
    }

    /// Administrative reset of a failed step back to pending.
    ///
    /// Returns false if the step is not currently failed.
    pub async fn reset_failed(&self, name: &str) -> Result<bool> {
        self.ensure_ledger().await?;
        let result = sqlx::query(&format!(
            "UPDATE {} SET state = $2, error = NULL, updated_at = now() \
             WHERE name = $1 AND state = $3",
            MIGRATION_LEDGER_TABLE
        ))
        .bind(name)
        .bind(StepState::Pending.as_str())
        .bind(StepState::Failed.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let reset = result.rows_affected() > 0;
        if reset {
            info!(
                subsystem = "migration",
                component = "executor",
                op = "reset_failed",
                step = name,
                "Failed step reset to pending"
            );
        }
        Ok(reset)
    }

    /// Every recorded step, oldest change first.
    pub async fn ledger(&self) -> Result<Vec<LedgerEntry>> {
        self.ensure_ledger().await?;
        let rows = sqlx::query(&format!(
            "SELECT name, state, error, updated_at FROM {} ORDER BY updated_at, name",
            MIGRATION_LEDGER_TABLE
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|r| {
                let state: String = r.get("state");
                Ok(LedgerEntry {
                    name: r.get("name"),
                    state: state.parse()?,
                    error: r.get("error"),
                    updated_at: r.get("updated_at"),
                })
            })
            .collect()
    }

    async fn exists(&self, sql: &str, binds: &[&str]) -> Result<bool> {
        let mut query = sqlx::query_scalar::<_, bool>(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        query.fetch_one(&self.pool).await.map_err(Error::Database)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
            &[table],
        )
        .await
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2)",
            &[table, column],
        )
        .await
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM pg_indexes \
             WHERE schemaname = current_schema() AND indexname = $1)",
            &[index],
        )
        .await
    }

    /// `Some(validated)` when the constraint exists.
    async fn constraint_state(&self, table: &str, constraint: &str) -> Result<Option<bool>> {
        sqlx::query_scalar::<_, bool>(
            "SELECT c.convalidated FROM pg_constraint c \
             JOIN pg_class t ON t.oid = c.conrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             WHERE n.nspname = current_schema() AND t.relname = $1 AND c.conname = $2",
        )
        .bind(table)
        .bind(constraint)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)
    }
}

#[async_trait]
impl MigrationExecutor for PgMigrationExecutor {
    async fn ensure_ledger(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                name TEXT PRIMARY KEY, \
                state TEXT NOT NULL, \
                error TEXT, \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now())",
            MIGRATION_LEDGER_TABLE
        ))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn step_state(&self, name: &str) -> Result<Option<StepState>> {
        let state: Option<String> = sqlx::query_scalar(&format!(
            "SELECT state FROM {} WHERE name = $1",
            MIGRATION_LEDGER_TABLE
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        state.map(|s| s.parse()).transpose()
    }

    async fn record_state(&self, name: &str, state: StepState, error: Option<&str>) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (name, state, error, updated_at) VALUES ($1, $2, $3, now()) \
             ON CONFLICT (name) DO UPDATE \
             SET state = EXCLUDED.state, error = EXCLUDED.error, updated_at = now()",
            MIGRATION_LEDGER_TABLE
        ))
        .bind(name)
        .bind(state.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn guard_allows(&self, guard: &Guard) -> Result<bool> {
        let allows = match *guard {
            Guard::Always => true,
            Guard::TableAbsent { table } => !self.table_exists(table).await?,
            Guard::TablePresent { table } => self.table_exists(table).await?,
            Guard::ColumnAbsent { table, column } => !self.column_exists(table, column).await?,
            Guard::ColumnPresent { table, column } => self.column_exists(table, column).await?,
            Guard::IndexAbsent { index } => !self.index_exists(index).await?,
            Guard::ConstraintAbsent { table, constraint } => {
                self.constraint_state(table, constraint).await?.is_none()
            }
            Guard::ConstraintNotValidated { table, constraint } => {
                self.constraint_state(table, constraint).await? == Some(false)
            }
            Guard::TableRenamable { from, to } => {
                self.table_exists(from).await? && !self.table_exists(to).await?
            }
            Guard::ColumnRenamable { table, from, to } => {
                self.column_exists(table, from).await? && !self.column_exists(table, to).await?
            }
        };
        debug!(
            subsystem = "migration",
            component = "executor",
            guard = ?guard,
            allows,
            "Guard evaluated"
        );
        Ok(allows)
    }

    async fn apply(&self, step: &MigrationStep) -> Result<()> {
        let sql = step.change.to_sql();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn acquire_lock(&self) -> Result<()> {
        let mut slot = self.lock_conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        debug!(
            subsystem = "migration",
            component = "executor",
            lock_key = self.lock_key,
            "Waiting for migration advisory lock"
        );
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(self.lock_key)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        *slot = Some(conn);
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        let conn = self.lock_conn.lock().await.take();
        if let Some(mut conn) = conn {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_key)
                .execute(&mut *conn)
                .await
                .map_err(Error::Database)?;
        }
        Ok(())
    }
}
