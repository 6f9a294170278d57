//! Integration tests for the catalog invariants.
//!
//! This test suite validates:
//! - Concurrent set_primary calls leave exactly one primary link
//! - Legacy duplicate primaries are repaired to the lowest-ranked one
//! - Course links require an enrollment and leave no row behind when rejected
//! - Unenrolling drops the links, then the course once nobody is enrolled
//! - Discipline parent assignments that would form a cycle are rejected
//!
//! **IMPORTANT**: These tests require PostgreSQL at `DATABASE_URL`.

use formulary_db::test_fixtures::TestDatabase;
use formulary_db::{
    CategoryRepository, CourseSegment, EnrollmentLink, EnrollmentRepository, EntityKind, Error,
    Handle, HandleRegistry, HierarchyRepository, SegmentType, Subject, SurrogateKey,
};

async fn discipline(test_db: &TestDatabase, handle: &str) -> SurrogateKey {
    let key = test_db
        .insert_legacy(EntityKind::Discipline, &handle.replace('_', " "))
        .await;
    test_db
        .db
        .catalog
        .assign_handle(EntityKind::Discipline, key, &Handle::parse(handle).unwrap())
        .await
        .unwrap();
    key
}

async fn count(test_db: &TestDatabase, sql: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sql)
        .fetch_one(&test_db.pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_concurrent_set_primary_leaves_one_primary() {
    let test_db = TestDatabase::new().await;
    let formula = test_db.insert_legacy(EntityKind::Formula, "Force").await;
    let subject = Subject::new(EntityKind::Formula, formula);

    let mut disciplines = Vec::new();
    for name in ["physics", "classical_mechanics", "engineering", "astronomy"] {
        disciplines.push(discipline(&test_db, name).await);
    }

    let tasks: Vec<_> = disciplines
        .iter()
        .cycle()
        .take(16)
        .map(|&d| {
            let catalog = test_db.db.catalog.clone();
            tokio::spawn(async move { catalog.set_primary(subject, d).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().expect("set_primary");
    }

    let primaries = count(
        &test_db,
        &format!(
            "SELECT COUNT(*) FROM tbl_formula_discipline WHERE formula_id = {} AND is_primary",
            formula
        ),
    )
    .await;
    assert_eq!(primaries, 1);

    let links = test_db.db.catalog.category_links(subject).await.unwrap();
    assert_eq!(links.len(), 4);
    assert!(links[0].is_primary);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_repair_keeps_lowest_ranked_primary() {
    let test_db = TestDatabase::new().await;
    let physics = discipline(&test_db, "physics").await;
    let mechanics = discipline(&test_db, "classical_mechanics").await;
    let formula = test_db.insert_legacy(EntityKind::Formula, "Force").await;
    let work = test_db.insert_legacy(EntityKind::Formula, "Work").await;

    test_db
        .insert_legacy_link(EntityKind::Formula, formula, physics, true, Some(2))
        .await;
    test_db
        .insert_legacy_link(EntityKind::Formula, formula, mechanics, true, Some(1))
        .await;
    test_db
        .insert_legacy_link(EntityKind::Formula, work, physics, false, None)
        .await;

    let catalog = &test_db.db.catalog;
    assert_eq!(catalog.repair_primaries(EntityKind::Formula).await.unwrap(), 1);
    assert_eq!(catalog.repair_primaries(EntityKind::Formula).await.unwrap(), 0);

    let primary = catalog
        .derive_primary_category(Subject::new(EntityKind::Formula, formula))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(primary.discipline_id, mechanics);

    // Links without any primary stay that way.
    assert!(catalog
        .derive_primary_category(Subject::new(EntityKind::Formula, work))
        .await
        .unwrap()
        .is_none());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_course_link_requires_enrollment() {
    let test_db = TestDatabase::new().await;
    let catalog = &test_db.db.catalog;
    let course = test_db.insert_legacy(EntityKind::Course, "Physics 101").await;
    let formula = test_db.insert_legacy(EntityKind::Formula, "Force").await;
    let item = Subject::new(EntityKind::Formula, formula);

    let link = EnrollmentLink {
        user_id: 42,
        course_id: course,
        item,
        segment: CourseSegment::new(Some(SegmentType::Chapter), Some("  Chapter 1 ")),
    };
    let err = catalog.link_course_item(&link).await.unwrap_err();
    assert!(
        matches!(err, Error::NotEnrolled { user_id: 42, course_id } if course_id == course),
        "{:?}",
        err
    );
    assert_eq!(
        count(&test_db, "SELECT COUNT(*) FROM tbl_user_course_formula").await,
        0
    );

    assert!(catalog.enroll(42, course).await.unwrap());
    assert!(!catalog.enroll(42, course).await.unwrap());
    catalog.validate_enrollment_link(42, course, item).await.unwrap();
    catalog.link_course_item(&link).await.unwrap();

    let label: Option<String> = sqlx::query_scalar(
        "SELECT segment_label FROM tbl_user_course_formula WHERE user_id = 42",
    )
    .fetch_one(&test_db.pool)
    .await
    .unwrap();
    assert_eq!(label.as_deref(), Some("Chapter 1"));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_unenroll_drops_course_with_last_enrollment() {
    let test_db = TestDatabase::new().await;
    let catalog = &test_db.db.catalog;
    let course = test_db.insert_legacy(EntityKind::Course, "Physics 101").await;
    let formula = test_db.insert_legacy(EntityKind::Formula, "Force").await;
    let item = Subject::new(EntityKind::Formula, formula);

    for user in [1, 2] {
        catalog.enroll(user, course).await.unwrap();
        catalog
            .link_course_item(&EnrollmentLink {
                user_id: user,
                course_id: course,
                item,
                segment: CourseSegment::default(),
            })
            .await
            .unwrap();
    }

    assert!(catalog.unenroll(1, course).await.unwrap());
    assert_eq!(
        count(&test_db, "SELECT COUNT(*) FROM tbl_user_course_formula").await,
        1
    );
    assert_eq!(count(&test_db, "SELECT COUNT(*) FROM tbl_course").await, 1);

    assert!(catalog.unenroll(2, course).await.unwrap());
    assert_eq!(count(&test_db, "SELECT COUNT(*) FROM tbl_course").await, 0);
    assert!(!catalog.unenroll(2, course).await.unwrap());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with a reachable PostgreSQL"]
async fn test_parent_cycles_are_rejected() {
    let test_db = TestDatabase::new().await;
    let catalog = &test_db.db.catalog;
    let science = discipline(&test_db, "science").await;
    let physics = discipline(&test_db, "physics").await;
    let mechanics = discipline(&test_db, "classical_mechanics").await;

    assert!(catalog.set_parent(physics, Some(science)).await.unwrap());
    assert!(catalog.set_parent(mechanics, Some(physics)).await.unwrap());
    assert!(!catalog.set_parent(mechanics, Some(physics)).await.unwrap());

    let err = catalog.set_parent(science, Some(mechanics)).await.unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }), "{:?}", err);
    let err = catalog.set_parent(physics, Some(physics)).await.unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }), "{:?}", err);

    let chain: Vec<String> = catalog
        .ancestor_handles(mechanics)
        .await
        .unwrap()
        .into_iter()
        .map(Handle::into_inner)
        .collect();
    assert_eq!(chain, vec!["classical_mechanics", "physics", "science"]);

    // Deleting a parent orphans its children instead of deleting them.
    test_db
        .execute(&format!(
            "DELETE FROM tbl_discipline WHERE discipline_id = {}",
            physics
        ))
        .await;
    assert_eq!(catalog.ancestor_handles(mechanics).await.unwrap().len(), 1);

    test_db.cleanup().await;
}
