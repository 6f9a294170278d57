//! Centralized default constants for the formulary catalog.
//!
//! **This module is the single source of truth** for shared default values.
//! The config loader, the pool builder and the CLI reference these constants
//! instead of defining their own magic numbers.

// =============================================================================
// DATABASE
// =============================================================================

/// Connection string used when `DATABASE_URL` is unset.
pub const DATABASE_URL: &str = "postgres://localhost/formulary";

/// Maximum pooled connections.
pub const POOL_MAX_CONNECTIONS: u32 = 10;

/// Minimum idle connections kept open.
pub const POOL_MIN_CONNECTIONS: u32 = 1;

/// Seconds to wait for a pooled connection.
pub const POOL_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Seconds before an idle connection is closed.
pub const POOL_IDLE_TIMEOUT_SECS: u64 = 600;

/// Seconds before a connection is recycled.
pub const POOL_MAX_LIFETIME_SECS: u64 = 1800;

// =============================================================================
// MIGRATIONS
// =============================================================================

/// Ledger table recording migration step states.
pub const MIGRATION_LEDGER_TABLE: &str = "formulary_migration_step";

/// Key of the session advisory lock held around a migration run.
/// ASCII "FORMULAR" as a big-endian i64.
pub const MIGRATION_LOCK_KEY: i64 = 0x464F_524D_554C_4152;

/// Whether migration runs take the advisory lock.
pub const MIGRATION_LOCK_ENABLED: bool = true;

// =============================================================================
// HIERARCHY
// =============================================================================

/// Key namespace of the transaction advisory lock serialising parent changes.
pub const HIERARCHY_LOCK_KEY: i64 = 0x464F_524D_4849_4552;
