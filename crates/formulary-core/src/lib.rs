//! # formulary-core
//!
//! Core types, traits, and identity-resolution logic for the formulary
//! catalog.
//!
//! Every catalog row carries two keys: an integer surrogate key used for
//! joins inside one database, and a human-readable [`Handle`] that is stable
//! across environments. This crate holds the store-agnostic half of that
//! model: handle normalisation and allocation, topic derivation, the
//! migration runner, the backfill resolver and the import reconciler. The
//! Postgres implementation of the store traits lives in `formulary-db`.

pub mod backfill;
pub mod config;
pub mod defaults;
pub mod entity;
pub mod error;
pub mod export;
pub mod handle;
pub mod hierarchy;
pub mod logging;
// In-memory store for testing
#[cfg(any(test, feature = "mock"))]
pub mod memory;
pub mod migration;
pub mod models;
pub mod payload;
pub mod reconcile;
pub mod report;
pub mod topic;
pub mod traits;

// Re-export commonly used types at crate root
pub use backfill::{BackfillResolver, BackfillSummary};
pub use config::CatalogConfig;
pub use entity::{EntityKind, FieldSpec, FieldType};
pub use error::{Error, Result};
pub use export::{export_payload, ExportResult};
pub use handle::{base_handle, slugify, Handle, HandleAllocator};
pub use hierarchy::{ancestor_chain, check_parent_assignment, topic_chain};
#[cfg(any(test, feature = "mock"))]
pub use memory::MemoryCatalog;
pub use migration::{
    Guard, MigrationExecutor, MigrationPlan, MigrationRunner, MigrationStep, RunSummary,
    SchemaChange, StepState,
};
pub use models::*;
pub use payload::{
    validate_entry, CategoryLinkSpec, ImportEntry, ImportPayload, RelationSpec, RelationType,
    ValidatedEntry,
};
pub use reconcile::ImportReconciler;
pub use report::{
    EntryOutcome, EntryReport, ImportReport, ImportSummary, LinkOutcome, LinkReport, SkipReason,
};
pub use topic::{TopicAssignment, TopicFallback, TopicMap, TopicSource, UNCATEGORIZED_TOPIC};
pub use traits::*;
