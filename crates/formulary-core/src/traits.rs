//! Core traits for catalog storage.
//!
//! These traits define the interfaces the PostgreSQL backend and the
//! in-memory store must satisfy. Every method is one atomic operation
//! against the store; callers retry retryable errors with the same inputs.

use async_trait::async_trait;

use crate::entity::EntityKind;
use crate::error::Result;
use crate::handle::Handle;
use crate::models::*;
use crate::payload::{RelationSpec, RelationType};
use crate::topic::TopicMap;

// =============================================================================
// HANDLE REGISTRY
// =============================================================================

/// Per-kind mapping between handles and surrogate keys.
#[async_trait]
pub trait HandleRegistry: Send + Sync {
    /// Assign `proposed` to the row `key`.
    ///
    /// Idempotent when the row already carries the same handle. Fails with
    /// `HandleConflict` when the handle belongs to another row and with
    /// `HandleImmutable` when the row already has a different handle.
    async fn assign_handle(
        &self,
        kind: EntityKind,
        key: SurrogateKey,
        proposed: &Handle,
    ) -> Result<Handle>;

    /// Resolve a handle to the local surrogate key.
    async fn resolve(&self, kind: EntityKind, handle: &Handle) -> Result<Option<SurrogateKey>>;

    /// Handle currently assigned to a row, if any.
    async fn handle_of(&self, kind: EntityKind, key: SurrogateKey) -> Result<Option<Handle>>;

    /// Administrative rename. The only path that changes an assigned handle.
    async fn rename_handle(
        &self,
        kind: EntityKind,
        old: &Handle,
        new: &Handle,
    ) -> Result<SurrogateKey>;
}

// =============================================================================
// INVARIANT ENFORCEMENT
// =============================================================================

/// Category links and the one-primary-per-subject rule.
#[async_trait]
pub trait CategoryRepository: Send + Sync {
    /// Make `discipline` the subject's only primary category, creating the
    /// link if absent. Isolated from concurrent calls on the same subject.
    async fn set_primary(&self, subject: Subject, discipline: SurrogateKey) -> Result<()>;

    /// Demote any primary link. Returns true if one existed.
    async fn clear_primary(&self, subject: Subject) -> Result<bool>;

    /// The subject's primary link, if any.
    async fn derive_primary_category(&self, subject: Subject) -> Result<Option<CategoryLink>>;

    /// All links of a subject, primary first then by rank.
    async fn category_links(&self, subject: Subject) -> Result<Vec<CategoryLink>>;

    /// Demote extra primaries left by legacy data. Returns subjects repaired.
    async fn repair_primaries(&self, kind: EntityKind) -> Result<u64>;
}

/// Enrollment-scoped course links.
#[async_trait]
pub trait EnrollmentRepository: Send + Sync {
    /// Enroll a user in a course. Returns false if already enrolled.
    async fn enroll(&self, user_id: SurrogateKey, course_id: SurrogateKey) -> Result<bool>;

    /// Fail with `NotEnrolled` unless the (user, course) enrollment exists.
    async fn validate_enrollment_link(
        &self,
        user_id: SurrogateKey,
        course_id: SurrogateKey,
        item: Subject,
    ) -> Result<()>;

    /// Create or update a course link under an existing enrollment.
    async fn link_course_item(&self, link: &EnrollmentLink) -> Result<()>;

    /// Remove one course link. Returns true if it existed.
    async fn unlink_course_item(
        &self,
        user_id: SurrogateKey,
        course_id: SurrogateKey,
        item: Subject,
    ) -> Result<bool>;

    /// Drop the enrollment and its links; drops the course once nobody is enrolled.
    async fn unenroll(&self, user_id: SurrogateKey, course_id: SurrogateKey) -> Result<bool>;
}

/// Discipline parent/child tree.
#[async_trait]
pub trait HierarchyRepository: Send + Sync {
    /// Set or clear a discipline's parent, rejecting cycles before any write.
    async fn set_parent(&self, discipline: SurrogateKey, parent: Option<SurrogateKey>)
        -> Result<bool>;

    /// Handles of the discipline and its ancestors, nearest first.
    async fn ancestor_handles(&self, discipline: SurrogateKey) -> Result<Vec<Handle>>;
}

// =============================================================================
// BACKFILL
// =============================================================================

/// Row access for the backfill resolver.
#[async_trait]
pub trait BackfillStore: Send + Sync {
    /// Rows whose handle is null or empty, by key.
    async fn rows_missing_handle(&self, kind: EntityKind) -> Result<Vec<HandleSeed>>;

    /// Every non-null handle of a kind.
    async fn existing_handles(&self, kind: EntityKind) -> Result<Vec<String>>;

    /// Write a handle only where the row still has none.
    ///
    /// Returns false if the row got a handle in the meantime; fails with
    /// `HandleConflict` if another row took the handle first.
    async fn write_handle(&self, kind: EntityKind, key: SurrogateKey, handle: &Handle)
        -> Result<bool>;

    /// Subjects of a categorized kind whose topic is still null.
    async fn rows_missing_topic(&self, kind: EntityKind) -> Result<Vec<SurrogateKey>>;

    /// Primary discipline handle followed by its ancestors' handles; empty
    /// without a primary or when the primary has no handle.
    async fn primary_discipline_chain(&self, subject: Subject) -> Result<Vec<Handle>>;

    /// Write a topic only where the subject's topic is still null.
    async fn write_topic(&self, subject: Subject, topic: &Handle) -> Result<bool>;
}

// =============================================================================
// IMPORT / EXPORT
// =============================================================================

/// Writes issued by the import reconciler.
#[async_trait]
pub trait ImportStore:
    HandleRegistry + CategoryRepository + HierarchyRepository + BackfillStore
{
    /// Create a row with its handle. Fails with `HandleConflict` if a
    /// concurrent writer registered the handle first.
    async fn create_entity(
        &self,
        kind: EntityKind,
        handle: &Handle,
        fields: &ContentFields,
    ) -> Result<SurrogateKey>;

    /// Overwrite the given content fields. Returns true if anything changed.
    async fn update_entity(
        &self,
        kind: EntityKind,
        key: SurrogateKey,
        fields: &ContentFields,
    ) -> Result<bool>;

    /// Make the subject's links and primary exactly `set`, then recompute
    /// its topic from the resulting primary chain through `topics`.
    ///
    /// Runs as one transaction with the subject row locked throughout; a
    /// concurrent writer cannot land between the link write and the topic
    /// write. With `set` as `None` only the topic is recomputed.
    async fn write_category_set(
        &self,
        subject: Subject,
        set: Option<&CategorySet>,
        topics: &TopicMap,
    ) -> Result<CategoryWrite>;

    /// Record a relation. Returns true if it was not already present.
    async fn link_relation(
        &self,
        subject: Subject,
        relation: RelationType,
        target: SurrogateKey,
    ) -> Result<bool>;
}

/// Reads issued by the exporter.
#[async_trait]
pub trait ExportStore: CategoryRepository {
    /// All rows of a kind ordered by key.
    async fn export_rows(&self, kind: EntityKind) -> Result<Vec<CatalogRow>>;

    /// Relations of a subject by target handle. Targets without a handle are omitted.
    async fn relations(&self, subject: Subject) -> Result<Vec<RelationSpec>>;
}
