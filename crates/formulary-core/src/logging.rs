//! Structured logging schema and field name constants for the catalog.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query identity-resolution events by the same
//! names across the migration runner, backfills and imports.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Migration halted, requires operator attention |
//! | WARN  | Recoverable issue, fallback applied (unmapped discipline, suffixed handle) |
//! | INFO  | Lifecycle events and operation summaries (step applied, import complete) |
//! | DEBUG | Decision points (guard satisfied, entry unchanged) |
//! | TRACE | Per-row iteration during backfills and exports |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "catalog", "migration", "backfill", "import", "database"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "runner", "handle_registry", "reconciler", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "assign_handle", "set_primary", "import_payload"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Entity kind being operated on ("formula", "term", ...).
pub const ENTITY_KIND: &str = "entity_kind";

/// Environment-independent handle.
pub const HANDLE: &str = "handle";

/// Environment-local surrogate key.
pub const SURROGATE_KEY: &str = "surrogate_key";

/// Migration step name.
pub const STEP: &str = "step";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of rows touched or returned.
pub const RESULT_COUNT: &str = "result_count";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

/// Table touched by a SQL-level step or backfill.
pub const DB_TABLE: &str = "table";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Row a category, topic or relation call acted on ("formula 12").
pub const SUBJECT: &str = "subject";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_are_distinct_snake_case() {
        let fields = [
            SUBSYSTEM,
            COMPONENT,
            OPERATION,
            ENTITY_KIND,
            HANDLE,
            SURROGATE_KEY,
            STEP,
            DURATION_MS,
            RESULT_COUNT,
            POOL_SIZE,
            POOL_IDLE,
            DB_TABLE,
            SUBJECT,
            ERROR_MSG,
        ];
        let unique: std::collections::HashSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
        assert!(fields
            .iter()
            .all(|f| f.chars().all(|c| c.is_ascii_lowercase() || c == '_')));
    }
}
