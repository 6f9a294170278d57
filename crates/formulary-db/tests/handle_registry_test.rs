//! Integration tests for the handle registry.
//!
//! This test suite validates:
//! - Assign then resolve round trip
//! - Re-assigning the same handle is idempotent
//! - A handle already owned by another row is a conflict naming the owner
//! - An assigned handle cannot be replaced, only renamed
//! - Handles are unique per kind, not across kinds
//! - Legacy handles stored with stray case or whitespace still resolve
//!
//! **IMPORTANT**: These tests require PostgreSQL at `DATABASE_URL`.
//! Each test runs in its own schema.

use formulary_db::test_fixtures::TestDatabase;
use formulary_db::{
    EntityKind, EntryOutcome, Error, Handle, HandleRegistry, ImportEntry, ImportPayload, TopicMap,
};

fn h(s: &str) -> Handle {
    Handle::parse(s).unwrap()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_assign_and_resolve() {
    let test_db = TestDatabase::new().await;
    let catalog = &test_db.db.catalog;
    let key = test_db.insert_legacy(EntityKind::Discipline, "Physics").await;

    let assigned = catalog
        .assign_handle(EntityKind::Discipline, key, &h("Physics"))
        .await
        .expect("assign");
    assert_eq!(assigned.as_str(), "physics");

    assert_eq!(
        catalog.resolve(EntityKind::Discipline, &h("physics")).await.unwrap(),
        Some(key)
    );
    assert_eq!(
        catalog.handle_of(EntityKind::Discipline, key).await.unwrap(),
        Some(h("physics"))
    );
    assert_eq!(
        catalog.resolve(EntityKind::Discipline, &h("chemistry")).await.unwrap(),
        None
    );

    // Same handle again is a no-op.
    catalog
        .assign_handle(EntityKind::Discipline, key, &h("physics"))
        .await
        .expect("idempotent assign");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_conflict_names_existing_owner() {
    let test_db = TestDatabase::new().await;
    let catalog = &test_db.db.catalog;
    let first = test_db.insert_legacy(EntityKind::Course, "Physics 101").await;
    let second = test_db.insert_legacy(EntityKind::Course, "Physics 101 (copy)").await;

    catalog
        .assign_handle(EntityKind::Course, first, &h("phys_101"))
        .await
        .unwrap();
    let err = catalog
        .assign_handle(EntityKind::Course, second, &h("phys_101"))
        .await
        .unwrap_err();

    match err {
        Error::HandleConflict {
            kind,
            handle,
            existing,
        } => {
            assert_eq!(kind, EntityKind::Course);
            assert_eq!(handle, "phys_101");
            assert_eq!(existing, first);
        }
        other => panic!("expected HandleConflict, got {:?}", other),
    }
    assert_eq!(
        catalog.handle_of(EntityKind::Course, second).await.unwrap(),
        None
    );

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_assigned_handle_is_immutable_until_renamed() {
    let test_db = TestDatabase::new().await;
    let catalog = &test_db.db.catalog;
    let key = test_db.insert_legacy(EntityKind::Unit, "Newton").await;

    catalog
        .assign_handle(EntityKind::Unit, key, &h("newton"))
        .await
        .unwrap();
    let err = catalog
        .assign_handle(EntityKind::Unit, key, &h("newton_unit"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HandleImmutable { .. }), "{:?}", err);

    let renamed = catalog
        .rename_handle(EntityKind::Unit, &h("newton"), &h("newton_unit"))
        .await
        .unwrap();
    assert_eq!(renamed, key);
    assert_eq!(
        catalog.resolve(EntityKind::Unit, &h("newton")).await.unwrap(),
        None
    );
    assert_eq!(
        catalog.resolve(EntityKind::Unit, &h("newton_unit")).await.unwrap(),
        Some(key)
    );

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_handles_are_scoped_per_kind() {
    let test_db = TestDatabase::new().await;
    let catalog = &test_db.db.catalog;
    let discipline = test_db
        .insert_legacy(EntityKind::Discipline, "Probability")
        .await;
    let topic = test_db.insert_legacy(EntityKind::Topic, "Probability").await;

    catalog
        .assign_handle(EntityKind::Discipline, discipline, &h("probability"))
        .await
        .unwrap();
    catalog
        .assign_handle(EntityKind::Topic, topic, &h("probability"))
        .await
        .expect("same handle in another kind");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_unnormalised_legacy_handle_resolves_and_imports_in_place() {
    let test_db = TestDatabase::new().await;
    let catalog = &test_db.db.catalog;
    let key = test_db.insert_legacy(EntityKind::Formula, "Force").await;
    test_db
        .execute(&format!(
            "UPDATE tbl_formula SET formula_handle = ' Force', topic_handle = 'uncategorized' \
             WHERE formula_id = {}",
            key
        ))
        .await;

    assert_eq!(
        catalog.resolve(EntityKind::Formula, &h("force")).await.unwrap(),
        Some(key)
    );
    assert_eq!(
        catalog.handle_of(EntityKind::Formula, key).await.unwrap(),
        Some(h("force"))
    );
    catalog
        .assign_handle(EntityKind::Formula, key, &h("force"))
        .await
        .expect("same handle once normalised");

    let payload = ImportPayload::new(vec![ImportEntry::new(EntityKind::Formula, "force")
        .field("formula_name", "Force")
        .field("latex", "F = ma")]);
    let report = test_db.db.import(&payload, &TopicMap::builtin()).await;
    assert_eq!(report.entries[0].outcome, EntryOutcome::Updated { key });
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tbl_formula")
        .fetch_one(&test_db.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    test_db.cleanup().await;
}
