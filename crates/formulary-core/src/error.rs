//! Error types for the formulary catalog.

use thiserror::Error;

use crate::entity::EntityKind;
use crate::models::SurrogateKey;

/// Result type alias using the catalog's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE for unique constraint violations.
const PG_UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for foreign key violations.
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLSTATE for serialization failures under SERIALIZABLE/REPEATABLE READ.
const PG_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for detected deadlocks.
const PG_DEADLOCK_DETECTED: &str = "40P01";

/// Core error type for catalog operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Handle already maps to a different surrogate key within the same kind
    #[error("Handle conflict: {kind} handle '{handle}' already belongs to key {existing}")]
    HandleConflict {
        kind: EntityKind,
        handle: String,
        existing: SurrogateKey,
    },

    /// Handle already assigned; renames go through `rename_handle`
    #[error("Handle is immutable: {kind} {key} already has handle '{current}'")]
    HandleImmutable {
        kind: EntityKind,
        key: SurrogateKey,
        current: String,
    },

    /// Concurrent primary-category writers collided on the same subject
    #[error("Primary category conflict on {kind} {subject}")]
    PrimaryConflict {
        kind: EntityKind,
        subject: SurrogateKey,
    },

    /// Enrollment-scoped link without an enrollment row
    #[error("User {user_id} is not enrolled in course {course_id}")]
    NotEnrolled {
        user_id: SurrogateKey,
        course_id: SurrogateKey,
    },

    /// A migration step's forward action raised an error
    #[error("Migration step '{step}' failed: {source}")]
    MigrationStepFailed {
        step: String,
        #[source]
        source: Box<Error>,
    },

    /// Reference to a handle that is neither in the payload nor the registry
    #[error("Unresolved reference: no {kind} with handle '{handle}'")]
    UnresolvedReference { kind: EntityKind, handle: String },

    /// Discipline parent chain would loop back to the discipline itself
    #[error("Cycle detected: discipline {discipline} cannot have parent {parent}")]
    CycleDetected {
        discipline: SurrogateKey,
        parent: SurrogateKey,
    },

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable name of the error kind, used in import reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::HandleConflict { .. } => "handle_conflict",
            Error::HandleImmutable { .. } => "handle_immutable",
            Error::PrimaryConflict { .. } => "primary_conflict",
            Error::NotEnrolled { .. } => "not_enrolled",
            Error::MigrationStepFailed { .. } => "migration_step_failed",
            Error::UnresolvedReference { .. } => "unresolved_reference",
            Error::CycleDetected { .. } => "cycle_detected",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
        }
    }

    /// SQLSTATE code of the underlying database error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            Error::Database(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }

    /// Name of the violated constraint or index, if the database reported one.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Error::Database(sqlx::Error::Database(db)) => db.constraint(),
            _ => None,
        }
    }

    /// True for unique constraint violations (SQLSTATE 23505).
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate().as_deref() == Some(PG_UNIQUE_VIOLATION)
    }

    /// True for foreign key violations (SQLSTATE 23503).
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate().as_deref() == Some(PG_FOREIGN_KEY_VIOLATION)
    }

    /// True when the caller may retry the same idempotent call.
    ///
    /// Covers serialization failures, deadlocks, lost connections and
    /// primary-category races.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::PrimaryConflict { .. } => true,
            Error::Database(sqlx::Error::Io(_))
            | Error::Database(sqlx::Error::PoolTimedOut)
            | Error::Database(sqlx::Error::PoolClosed) => true,
            Error::Database(_) => matches!(
                self.sqlstate().as_deref(),
                Some(PG_SERIALIZATION_FAILURE) | Some(PG_DEADLOCK_DETECTED)
            ),
            _ => false,
        }
    }

    /// True for errors that are reported per entry without aborting siblings.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::HandleConflict { .. }
                | Error::HandleImmutable { .. }
                | Error::NotEnrolled { .. }
                | Error::UnresolvedReference { .. }
                | Error::CycleDetected { .. }
                | Error::InvalidInput(_)
                | Error::NotFound(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
