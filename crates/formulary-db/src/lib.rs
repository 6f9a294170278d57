//! # formulary-db
//!
//! PostgreSQL storage layer for the formulary catalog.
//!
//! This crate provides:
//! - Connection pool management
//! - `PgCatalog`, implementing every storage trait of `formulary-core`
//! - A migration executor with an advisory lock and a step ledger
//! - The catalog's additive and tightening migration plans
//! - The `formulary-sync` operator binary
//!
//! ## Example
//!
//! ```rust,ignore
//! use formulary_db::{Database, EntityKind, Handle, TopicMap};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/formulary").await?;
//!     db.bootstrap(&TopicMap::builtin(), true).await?;
//!
//!     let key = db
//!         .resolve(EntityKind::Formula, &Handle::parse("newtons_second_law")?)
//!         .await?;
//!     println!("Resolved to: {:?}", key);
//!     Ok(())
//! }
//! ```
pub mod backfill;
pub mod catalog;
pub mod categories;
pub mod enrollment;
pub mod export;
pub mod handles;
pub mod hierarchy;
pub mod import;
pub mod migrations;
pub mod pool;
pub mod steps;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use formulary_core::*;

pub use catalog::PgCatalog;
pub use migrations::{LedgerEntry, PgMigrationExecutor};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use steps::{additive_plan, all_plans, tightening_plan, ADDITIVE_PLAN, TIGHTENING_PLAN};

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::info;

/// Which migration plans a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationPhase {
    /// Tables, columns, handle indexes and renames. Safe on live data.
    Additive,
    /// Constraints that need backfilled data.
    Tightening,
    #[default]
    All,
}

impl MigrationPhase {
    /// Plans assumed to have run before this phase.
    pub fn earlier(&self) -> Vec<MigrationPlan> {
        match self {
            Self::Tightening => vec![additive_plan()],
            Self::Additive | Self::All => Vec::new(),
        }
    }

    pub fn plans(&self) -> Vec<MigrationPlan> {
        match self {
            Self::Additive => vec![additive_plan()],
            Self::Tightening => vec![tightening_plan()],
            Self::All => all_plans(),
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Additive => ADDITIVE_PLAN,
            Self::Tightening => TIGHTENING_PLAN,
            Self::All => "all",
        })
    }
}

impl FromStr for MigrationPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            ADDITIVE_PLAN => Ok(Self::Additive),
            TIGHTENING_PLAN => Ok(Self::Tightening),
            "all" => Ok(Self::All),
            other => Err(Error::InvalidInput(format!(
                "migration phase must be additive, tightening or all, got '{}'",
                other
            ))),
        }
    }
}

/// What a full bootstrap did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootstrapSummary {
    pub additive: RunSummary,
    /// Subjects whose extra primaries were demoted, per kind.
    pub repaired: std::collections::BTreeMap<EntityKind, u64>,
    pub backfill: BackfillSummary,
    pub tightening: RunSummary,
}

/// Combined database context.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Catalog store implementing the core storage traits.
    pub catalog: PgCatalog,
    /// Migration executor for the catalog plans.
    pub migrations: PgMigrationExecutor,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            catalog: PgCatalog::new(pool.clone()),
            migrations: PgMigrationExecutor::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Connect using a loaded catalog configuration.
    pub async fn from_config(config: &CatalogConfig) -> Result<Self> {
        Self::connect_with_config(&config.database_url, PoolConfig::from_catalog(config)).await
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Run the plans of one phase.
    pub async fn migrate(&self, phase: MigrationPhase, lock: bool) -> Result<RunSummary> {
        MigrationRunner::new(&self.migrations)
            .with_lock(lock)
            .run_after(&phase.earlier(), &phase.plans())
            .await
    }

    /// Populate missing topics and handles.
    pub async fn backfill(&self, topics: &TopicMap) -> Result<BackfillSummary> {
        BackfillResolver::new(&self.catalog, topics)
            .backfill_all()
            .await
    }

    /// Bring a legacy database to the handle-keyed schema.
    ///
    /// Additive migrations, primary repair, topic and handle backfill, then
    /// tightening. Every stage is idempotent so a failed bootstrap can be
    /// re-run as is.
    pub async fn bootstrap(&self, topics: &TopicMap, lock: bool) -> Result<BootstrapSummary> {
        let mut summary = BootstrapSummary {
            additive: self.migrate(MigrationPhase::Additive, lock).await?,
            ..Default::default()
        };

        for kind in EntityKind::ALL.into_iter().filter(|k| k.is_categorized()) {
            let repaired = self.catalog.repair_primaries(kind).await?;
            summary.repaired.insert(kind, repaired);
        }

        summary.backfill = self.backfill(topics).await?;
        summary.tightening = self.migrate(MigrationPhase::Tightening, lock).await?;

        info!(
            subsystem = "catalog",
            component = "database",
            op = "bootstrap",
            result_count = summary.backfill.total(),
            "Bootstrap complete"
        );
        Ok(summary)
    }

    /// Reconcile a payload into this database.
    pub async fn import(&self, payload: &ImportPayload, topics: &TopicMap) -> ImportReport {
        ImportReconciler::new(&self.catalog, topics)
            .import_payload(payload)
            .await
    }

    /// Export rows of the given kinds (all kinds when empty).
    pub async fn export(&self, kinds: &[EntityKind]) -> Result<ExportResult> {
        export_payload(&self.catalog, kinds).await
    }

    /// Resolve a handle to the local surrogate key.
    pub async fn resolve(&self, kind: EntityKind, handle: &Handle) -> Result<Option<SurrogateKey>> {
        self.catalog.resolve(kind, handle).await
    }

    /// Administrative reset of a failed migration step.
    pub async fn reset_step(&self, name: &str) -> Result<bool> {
        self.migrations.reset_failed(name).await
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_phase_parses() {
        assert_eq!("additive".parse::<MigrationPhase>().unwrap(), MigrationPhase::Additive);
        assert_eq!(" Tightening ".parse::<MigrationPhase>().unwrap(), MigrationPhase::Tightening);
        assert_eq!("all".parse::<MigrationPhase>().unwrap(), MigrationPhase::All);
        assert!("everything".parse::<MigrationPhase>().is_err());
    }

    #[test]
    fn test_migration_phase_plans() {
        let names: Vec<_> = MigrationPhase::All.plans().iter().map(|p| p.name).collect();
        assert_eq!(names, vec![ADDITIVE_PLAN, TIGHTENING_PLAN]);
        assert_eq!(MigrationPhase::Tightening.plans()[0].name, TIGHTENING_PLAN);
        assert_eq!(MigrationPhase::Tightening.earlier()[0].name, ADDITIVE_PLAN);
        assert!(MigrationPhase::All.earlier().is_empty());
        assert_eq!(MigrationPhase::default().to_string(), "all");
    }
}
