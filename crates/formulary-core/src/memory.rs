//! In-memory catalog store for deterministic testing.
//!
//! Implements every storage trait over a single mutex-guarded state so the
//! migration-free orchestration (backfills, imports, exports) can be tested
//! without a database. Each trait call runs under one lock acquisition,
//! which gives it the same all-or-nothing behaviour as a transaction.
//!
//! Compiled for this crate's tests and behind the `mock` feature.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use formulary_core::memory::MemoryCatalog;
//! use formulary_core::{EntityKind, Handle, HandleRegistry};
//!
//! # async fn example() -> formulary_core::Result<()> {
//! let store = MemoryCatalog::new();
//! let key = store.insert_legacy(EntityKind::Formula, "Momentum");
//! store
//!     .assign_handle(EntityKind::Formula, key, &Handle::parse("momentum")?)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::hierarchy::{ancestor_chain, check_parent_assignment, topic_chain};
use crate::models::*;
use crate::payload::{RelationSpec, RelationType};
use crate::topic::{TopicMap, UNCATEGORIZED_TOPIC};
use crate::traits::*;

#[derive(Debug, Clone, Default, PartialEq)]
struct Row {
    handle: Option<Handle>,
    fields: ContentFields,
    topic: Option<Handle>,
    parent: Option<SurrogateKey>,
}

#[derive(Debug, Clone, PartialEq)]
struct Link {
    is_primary: bool,
    rank: Option<i32>,
    notes: Option<String>,
}

/// Complete store contents; comparable for idempotence checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogState {
    rows: BTreeMap<EntityKind, BTreeMap<SurrogateKey, Row>>,
    category_links: BTreeMap<Subject, BTreeMap<SurrogateKey, Link>>,
    relations: BTreeSet<(Subject, RelationType, SurrogateKey)>,
    enrollments: BTreeSet<(SurrogateKey, SurrogateKey)>,
    course_links: BTreeMap<(SurrogateKey, SurrogateKey, Subject), CourseSegment>,
    next_key: SurrogateKey,
}

impl CatalogState {
    fn rows(&self, kind: EntityKind) -> impl Iterator<Item = (&SurrogateKey, &Row)> {
        self.rows.get(&kind).into_iter().flatten()
    }

    fn row(&self, kind: EntityKind, key: SurrogateKey) -> Option<&Row> {
        self.rows.get(&kind).and_then(|rows| rows.get(&key))
    }

    fn row_mut(&mut self, kind: EntityKind, key: SurrogateKey) -> Result<&mut Row> {
        self.rows
            .get_mut(&kind)
            .and_then(|rows| rows.get_mut(&key))
            .ok_or_else(|| Error::NotFound(format!("{} {}", kind, key)))
    }

    fn require(&self, kind: EntityKind, key: SurrogateKey) -> Result<&Row> {
        self.row(kind, key)
            .ok_or_else(|| Error::NotFound(format!("{} {}", kind, key)))
    }

    fn insert(&mut self, kind: EntityKind, row: Row) -> SurrogateKey {
        self.next_key += 1;
        let key = self.next_key;
        self.rows.entry(kind).or_default().insert(key, row);
        key
    }

    fn find_handle(&self, kind: EntityKind, handle: &Handle) -> Option<SurrogateKey> {
        self.rows(kind)
            .find(|(_, row)| row.handle.as_ref() == Some(handle))
            .map(|(key, _)| *key)
    }

    fn ensure_topic(&mut self, topic: &Handle) {
        if self.find_handle(EntityKind::Topic, topic).is_none() {
            let mut fields = ContentFields::new();
            fields.insert(
                "topic_name".to_string(),
                FieldValue::Text(topic.as_str().replace('_', " ")),
            );
            self.insert(
                EntityKind::Topic,
                Row {
                    handle: Some(topic.clone()),
                    fields,
                    ..Default::default()
                },
            );
        }
    }

    fn parent_of(&self, discipline: SurrogateKey) -> Option<SurrogateKey> {
        self.row(EntityKind::Discipline, discipline)
            .and_then(|row| row.parent)
    }

    fn set_parent(&mut self, discipline: SurrogateKey, parent: Option<SurrogateKey>) -> Result<bool> {
        self.require(EntityKind::Discipline, discipline)?;
        if let Some(parent) = parent {
            self.require(EntityKind::Discipline, parent)?;
            check_parent_assignment(discipline, parent, |n| self.parent_of(n))?;
        }
        let row = self.row_mut(EntityKind::Discipline, discipline)?;
        let changed = row.parent != parent;
        row.parent = parent;
        Ok(changed)
    }

    fn ancestor_handles(&self, discipline: SurrogateKey) -> Vec<Handle> {
        ancestor_chain(discipline, |n| self.parent_of(n))
            .into_iter()
            .filter_map(|key| {
                self.row(EntityKind::Discipline, key)
                    .and_then(|row| row.handle.clone())
            })
            .collect()
    }

    fn primary_of(&self, subject: Subject) -> Option<SurrogateKey> {
        self.category_links
            .get(&subject)?
            .iter()
            .find(|(_, link)| link.is_primary)
            .map(|(discipline, _)| *discipline)
    }

    fn primary_chain(&self, subject: Subject) -> Vec<Handle> {
        let Some(primary) = self.primary_of(subject) else {
            return Vec::new();
        };
        topic_chain(
            ancestor_chain(primary, |n| self.parent_of(n))
                .into_iter()
                .map(|key| {
                    self.row(EntityKind::Discipline, key)
                        .and_then(|row| row.handle.clone())
                }),
        )
    }

    fn to_category_link(&self, discipline: SurrogateKey, link: &Link) -> CategoryLink {
        CategoryLink {
            discipline_id: discipline,
            discipline_handle: self
                .row(EntityKind::Discipline, discipline)
                .and_then(|row| row.handle.clone()),
            is_primary: link.is_primary,
            rank: link.rank,
            notes: link.notes.clone(),
        }
    }
}

/// Thread-safe in-memory implementation of every catalog storage trait.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
    claims: Mutex<Vec<(EntityKind, String)>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a concurrent writer: the next write of `handle` finds it taken.
    pub fn claim_handle_on_next_write(&self, kind: EntityKind, handle: &str) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, handle.to_string()));
    }

    fn take_claim(&self, state: &mut CatalogState, kind: EntityKind, handle: &Handle) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = claims
            .iter()
            .position(|(k, h)| *k == kind && h == handle.as_str())
        {
            claims.remove(pos);
            let mut row = Row {
                handle: Some(handle.clone()),
                ..Default::default()
            };
            if kind.is_categorized() {
                row.topic = Handle::parse(UNCATEGORIZED_TOPIC).ok();
            }
            state.insert(kind, row);
        }
    }

    /// Insert a row without a handle, as legacy data would have it.
    pub fn insert_legacy(&self, kind: EntityKind, name: &str) -> SurrogateKey {
        let mut fields = ContentFields::new();
        fields.insert(
            kind.seed_column().to_string(),
            FieldValue::Text(name.to_string()),
        );
        self.state().insert(
            kind,
            Row {
                fields,
                ..Default::default()
            },
        )
    }

    /// Insert a legacy question row.
    pub fn insert_question(
        &self,
        question_type: &str,
        stem: &str,
        part_label: Option<&str>,
    ) -> SurrogateKey {
        let mut fields = ContentFields::new();
        fields.insert(
            "question_type".to_string(),
            FieldValue::Text(question_type.to_string()),
        );
        fields.insert("stem".to_string(), FieldValue::Text(stem.to_string()));
        if let Some(label) = part_label {
            fields.insert(
                "part_label".to_string(),
                FieldValue::Text(label.to_string()),
            );
        }
        self.state().insert(
            EntityKind::Question,
            Row {
                fields,
                ..Default::default()
            },
        )
    }

    /// Insert a discipline with a handle and optional parent.
    pub fn insert_discipline(&self, handle: &str, parent: Option<SurrogateKey>) -> SurrogateKey {
        let mut fields = ContentFields::new();
        fields.insert(
            "discipline_name".to_string(),
            FieldValue::Text(handle.replace('_', " ")),
        );
        self.state().insert(
            EntityKind::Discipline,
            Row {
                handle: Handle::parse(handle).ok(),
                fields,
                parent,
                ..Default::default()
            },
        )
    }

    /// Insert a course row with a handle.
    pub fn insert_course(&self, handle: &str) -> SurrogateKey {
        let mut fields = ContentFields::new();
        fields.insert(
            "course_name".to_string(),
            FieldValue::Text(handle.to_string()),
        );
        self.state().insert(
            EntityKind::Course,
            Row {
                handle: Handle::parse(handle).ok(),
                fields,
                ..Default::default()
            },
        )
    }

    /// Add a category link bypassing the one-primary rule, as legacy data may.
    pub fn add_raw_link(
        &self,
        subject: Subject,
        discipline: SurrogateKey,
        is_primary: bool,
        rank: Option<i32>,
    ) {
        self.state()
            .category_links
            .entry(subject)
            .or_default()
            .insert(
                discipline,
                Link {
                    is_primary,
                    rank,
                    notes: None,
                },
            );
    }

    pub fn topic_of(&self, subject: Subject) -> Option<Handle> {
        self.state()
            .row(subject.kind, subject.key)
            .and_then(|row| row.topic.clone())
    }

    pub fn field_of(&self, subject: Subject, name: &str) -> Option<FieldValue> {
        self.state()
            .row(subject.kind, subject.key)
            .and_then(|row| row.fields.get(name).cloned())
    }

    pub fn primary_count(&self, subject: Subject) -> usize {
        self.state()
            .category_links
            .get(&subject)
            .map_or(0, |links| links.values().filter(|l| l.is_primary).count())
    }

    pub fn row_count(&self, kind: EntityKind) -> usize {
        self.state().rows(kind).count()
    }

    pub fn parent_of(&self, discipline: SurrogateKey) -> Option<SurrogateKey> {
        self.state().parent_of(discipline)
    }

    pub fn has_relation(&self, subject: Subject, relation: RelationType, target: SurrogateKey) -> bool {
        self.state()
            .relations
            .contains(&(subject, relation, target))
    }

    pub fn is_enrolled(&self, user_id: SurrogateKey, course_id: SurrogateKey) -> bool {
        self.state().enrollments.contains(&(user_id, course_id))
    }

    pub fn course_link_count(&self) -> usize {
        self.state().course_links.len()
    }

    /// Copy of the whole state.
    pub fn snapshot(&self) -> CatalogState {
        self.state().clone()
    }
}

#[async_trait]
impl HandleRegistry for MemoryCatalog {
    async fn assign_handle(
        &self,
        kind: EntityKind,
        key: SurrogateKey,
        proposed: &Handle,
    ) -> Result<Handle> {
        let mut state = self.state();
        let row = state.require(kind, key)?;
        match &row.handle {
            Some(current) if current == proposed => return Ok(current.clone()),
            Some(current) => {
                return Err(Error::HandleImmutable {
                    kind,
                    key,
                    current: current.to_string(),
                })
            }
            None => {}
        }
        if let Some(existing) = state.find_handle(kind, proposed) {
            return Err(Error::HandleConflict {
                kind,
                handle: proposed.to_string(),
                existing,
            });
        }
        state.row_mut(kind, key)?.handle = Some(proposed.clone());
        Ok(proposed.clone())
    }

    async fn resolve(&self, kind: EntityKind, handle: &Handle) -> Result<Option<SurrogateKey>> {
        Ok(self.state().find_handle(kind, handle))
    }

    async fn handle_of(&self, kind: EntityKind, key: SurrogateKey) -> Result<Option<Handle>> {
        Ok(self.state().row(kind, key).and_then(|row| row.handle.clone()))
    }

    async fn rename_handle(
        &self,
        kind: EntityKind,
        old: &Handle,
        new: &Handle,
    ) -> Result<SurrogateKey> {
        let mut state = self.state();
        let key = state
            .find_handle(kind, old)
            .ok_or_else(|| Error::NotFound(format!("{} handle '{}'", kind, old)))?;
        if old == new {
            return Ok(key);
        }
        if let Some(existing) = state.find_handle(kind, new) {
            return Err(Error::HandleConflict {
                kind,
                handle: new.to_string(),
                existing,
            });
        }
        state.row_mut(kind, key)?.handle = Some(new.clone());
        Ok(key)
    }
}

#[async_trait]
impl CategoryRepository for MemoryCatalog {
    async fn set_primary(&self, subject: Subject, discipline: SurrogateKey) -> Result<()> {
        subject.kind.require_categorized()?;
        let mut state = self.state();
        state.require(subject.kind, subject.key)?;
        state.require(EntityKind::Discipline, discipline)?;
        let links = state.category_links.entry(subject).or_default();
        for link in links.values_mut() {
            link.is_primary = false;
        }
        links
            .entry(discipline)
            .or_insert(Link {
                is_primary: false,
                rank: None,
                notes: None,
            })
            .is_primary = true;
        Ok(())
    }

    async fn clear_primary(&self, subject: Subject) -> Result<bool> {
        let mut state = self.state();
        let mut cleared = false;
        if let Some(links) = state.category_links.get_mut(&subject) {
            for link in links.values_mut().filter(|l| l.is_primary) {
                link.is_primary = false;
                cleared = true;
            }
        }
        Ok(cleared)
    }

    async fn derive_primary_category(&self, subject: Subject) -> Result<Option<CategoryLink>> {
        let state = self.state();
        Ok(state.category_links.get(&subject).and_then(|links| {
            links
                .iter()
                .find(|(_, l)| l.is_primary)
                .map(|(d, l)| state.to_category_link(*d, l))
        }))
    }

    async fn category_links(&self, subject: Subject) -> Result<Vec<CategoryLink>> {
        let state = self.state();
        let mut links: Vec<CategoryLink> = state
            .category_links
            .get(&subject)
            .into_iter()
            .flatten()
            .map(|(d, l)| state.to_category_link(*d, l))
            .collect();
        links.sort_by_key(|l| (!l.is_primary, l.rank.is_none(), l.rank, l.discipline_id));
        Ok(links)
    }

    async fn repair_primaries(&self, kind: EntityKind) -> Result<u64> {
        kind.require_categorized()?;
        let mut state = self.state();
        let mut repaired = 0;
        for (subject, links) in state.category_links.iter_mut() {
            if subject.kind != kind {
                continue;
            }
            let keep = links
                .iter()
                .filter(|(_, l)| l.is_primary)
                .map(|(d, l)| (l.rank.is_none(), l.rank, *d))
                .min();
            let primaries = links.values().filter(|l| l.is_primary).count();
            if let (Some((_, _, keep)), true) = (keep, primaries > 1) {
                for (d, link) in links.iter_mut() {
                    link.is_primary = *d == keep;
                }
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

#[async_trait]
impl EnrollmentRepository for MemoryCatalog {
    async fn enroll(&self, user_id: SurrogateKey, course_id: SurrogateKey) -> Result<bool> {
        let mut state = self.state();
        state.require(EntityKind::Course, course_id)?;
        Ok(state.enrollments.insert((user_id, course_id)))
    }

    async fn validate_enrollment_link(
        &self,
        user_id: SurrogateKey,
        course_id: SurrogateKey,
        item: Subject,
    ) -> Result<()> {
        if item.kind.course_link_table().is_none() {
            return Err(Error::InvalidInput(format!(
                "{} rows cannot be linked to courses",
                item.kind
            )));
        }
        let state = self.state();
        state.require(item.kind, item.key)?;
        if !state.enrollments.contains(&(user_id, course_id)) {
            return Err(Error::NotEnrolled { user_id, course_id });
        }
        Ok(())
    }

    async fn link_course_item(&self, link: &EnrollmentLink) -> Result<()> {
        self.validate_enrollment_link(link.user_id, link.course_id, link.item)
            .await?;
        let mut state = self.state();
        // Re-check under the same lock the insert runs under.
        if !state.enrollments.contains(&(link.user_id, link.course_id)) {
            return Err(Error::NotEnrolled {
                user_id: link.user_id,
                course_id: link.course_id,
            });
        }
        state.course_links.insert(
            (link.user_id, link.course_id, link.item),
            link.segment.clone(),
        );
        Ok(())
    }

    async fn unlink_course_item(
        &self,
        user_id: SurrogateKey,
        course_id: SurrogateKey,
        item: Subject,
    ) -> Result<bool> {
        Ok(self
            .state()
            .course_links
            .remove(&(user_id, course_id, item))
            .is_some())
    }

    async fn unenroll(&self, user_id: SurrogateKey, course_id: SurrogateKey) -> Result<bool> {
        let mut state = self.state();
        state
            .course_links
            .retain(|(u, c, _), _| !(*u == user_id && *c == course_id));
        let removed = state.enrollments.remove(&(user_id, course_id));
        if removed && !state.enrollments.iter().any(|(_, c)| *c == course_id) {
            if let Some(courses) = state.rows.get_mut(&EntityKind::Course) {
                courses.remove(&course_id);
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl HierarchyRepository for MemoryCatalog {
    async fn set_parent(
        &self,
        discipline: SurrogateKey,
        parent: Option<SurrogateKey>,
    ) -> Result<bool> {
        self.state().set_parent(discipline, parent)
    }

    async fn ancestor_handles(&self, discipline: SurrogateKey) -> Result<Vec<Handle>> {
        let state = self.state();
        state.require(EntityKind::Discipline, discipline)?;
        Ok(state.ancestor_handles(discipline))
    }
}

#[async_trait]
impl BackfillStore for MemoryCatalog {
    async fn rows_missing_handle(&self, kind: EntityKind) -> Result<Vec<HandleSeed>> {
        let state = self.state();
        let text = |row: &Row, name: &str| {
            row.fields
                .get(name)
                .and_then(FieldValue::as_text)
                .map(str::to_string)
        };
        Ok(state
            .rows(kind)
            .filter(|(_, row)| row.handle.is_none())
            .map(|(key, row)| HandleSeed {
                key: *key,
                name: text(row, kind.seed_column()),
                part_label: text(row, "part_label"),
                multipart: kind == EntityKind::Question
                    && text(row, "question_type").as_deref() == Some("multipart"),
            })
            .collect())
    }

    async fn existing_handles(&self, kind: EntityKind) -> Result<Vec<String>> {
        Ok(self
            .state()
            .rows(kind)
            .filter_map(|(_, row)| row.handle.as_ref().map(|h| h.to_string()))
            .collect())
    }

    async fn write_handle(
        &self,
        kind: EntityKind,
        key: SurrogateKey,
        handle: &Handle,
    ) -> Result<bool> {
        let mut state = self.state();
        self.take_claim(&mut state, kind, handle);
        if state.require(kind, key)?.handle.is_some() {
            return Ok(false);
        }
        if let Some(existing) = state.find_handle(kind, handle) {
            return Err(Error::HandleConflict {
                kind,
                handle: handle.to_string(),
                existing,
            });
        }
        state.row_mut(kind, key)?.handle = Some(handle.clone());
        Ok(true)
    }

    async fn rows_missing_topic(&self, kind: EntityKind) -> Result<Vec<SurrogateKey>> {
        kind.require_categorized()?;
        Ok(self
            .state()
            .rows(kind)
            .filter(|(_, row)| row.topic.is_none())
            .map(|(key, _)| *key)
            .collect())
    }

    async fn primary_discipline_chain(&self, subject: Subject) -> Result<Vec<Handle>> {
        Ok(self.state().primary_chain(subject))
    }

    async fn write_topic(&self, subject: Subject, topic: &Handle) -> Result<bool> {
        let mut state = self.state();
        if state.require(subject.kind, subject.key)?.topic.is_some() {
            return Ok(false);
        }
        state.ensure_topic(topic);
        state.row_mut(subject.kind, subject.key)?.topic = Some(topic.clone());
        Ok(true)
    }
}

#[async_trait]
impl ImportStore for MemoryCatalog {
    async fn create_entity(
        &self,
        kind: EntityKind,
        handle: &Handle,
        fields: &ContentFields,
    ) -> Result<SurrogateKey> {
        let mut state = self.state();
        self.take_claim(&mut state, kind, handle);
        if let Some(existing) = state.find_handle(kind, handle) {
            return Err(Error::HandleConflict {
                kind,
                handle: handle.to_string(),
                existing,
            });
        }
        let mut row = Row {
            handle: Some(handle.clone()),
            fields: fields.clone(),
            ..Default::default()
        };
        if kind.is_categorized() {
            let topic = Handle::parse(UNCATEGORIZED_TOPIC)?;
            state.ensure_topic(&topic);
            row.topic = Some(topic);
        }
        Ok(state.insert(kind, row))
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        key: SurrogateKey,
        fields: &ContentFields,
    ) -> Result<bool> {
        let mut state = self.state();
        let row = state.row_mut(kind, key)?;
        let mut changed = false;
        for (name, value) in fields {
            if row.fields.get(name).unwrap_or(&FieldValue::Null) != value {
                row.fields.insert(name.clone(), value.clone());
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn write_category_set(
        &self,
        subject: Subject,
        set: Option<&CategorySet>,
        topics: &TopicMap,
    ) -> Result<CategoryWrite> {
        subject.kind.require_categorized()?;
        let mut state = self.state();
        state.require(subject.kind, subject.key)?;

        let mut links_changed = false;
        if let Some(set) = set {
            for discipline in set.links.iter().map(|l| l.discipline_id).chain(set.primary) {
                state.require(EntityKind::Discipline, discipline)?;
            }
            let current: Vec<CategoryLink> = state
                .category_links
                .get(&subject)
                .into_iter()
                .flatten()
                .map(|(d, l)| state.to_category_link(*d, l))
                .collect();
            if !set.matches(&current) {
                let mut links: BTreeMap<SurrogateKey, Link> = set
                    .links
                    .iter()
                    .map(|l| {
                        let link = Link {
                            is_primary: set.primary == Some(l.discipline_id),
                            rank: l.rank,
                            notes: l.notes.clone(),
                        };
                        (l.discipline_id, link)
                    })
                    .collect();
                if let Some(primary) = set.primary {
                    links.entry(primary).or_insert(Link {
                        is_primary: true,
                        rank: None,
                        notes: None,
                    });
                }
                state.category_links.insert(subject, links);
                links_changed = true;
            }
        }

        let topic = topics.resolve(&state.primary_chain(subject));
        let topic_changed =
            state.require(subject.kind, subject.key)?.topic.as_ref() != Some(&topic.topic);
        if topic_changed {
            state.ensure_topic(&topic.topic);
            state.row_mut(subject.kind, subject.key)?.topic = Some(topic.topic.clone());
        }
        Ok(CategoryWrite {
            links_changed,
            topic,
            topic_changed,
        })
    }

    async fn link_relation(
        &self,
        subject: Subject,
        relation: RelationType,
        target: SurrogateKey,
    ) -> Result<bool> {
        let target_kind = relation.target_kind(subject.kind)?;
        let mut state = self.state();
        state.require(subject.kind, subject.key)?;
        state.require(target_kind, target)?;
        match relation {
            RelationType::Parent => state.set_parent(subject.key, Some(target)),
            RelationType::Prerequisite if subject.key == target => Err(Error::InvalidInput(
                "a formula cannot be its own prerequisite".to_string(),
            )),
            _ => Ok(state.relations.insert((subject, relation, target))),
        }
    }
}

#[async_trait]
impl ExportStore for MemoryCatalog {
    async fn export_rows(&self, kind: EntityKind) -> Result<Vec<CatalogRow>> {
        Ok(self
            .state()
            .rows(kind)
            .map(|(key, row)| CatalogRow {
                key: *key,
                handle: row.handle.clone(),
                fields: row.fields.clone(),
                topic_handle: row.topic.clone(),
            })
            .collect())
    }

    async fn relations(&self, subject: Subject) -> Result<Vec<RelationSpec>> {
        let state = self.state();
        let handle_of = |kind: EntityKind, key: SurrogateKey| {
            state.row(kind, key).and_then(|row| row.handle.clone())
        };
        let mut out = Vec::new();
        if subject.kind == EntityKind::Discipline {
            if let Some(parent) = state.parent_of(subject.key) {
                if let Some(handle) = handle_of(EntityKind::Discipline, parent) {
                    out.push(RelationSpec::new(RelationType::Parent, handle.into_inner()));
                }
            }
        }
        for (s, relation, target) in &state.relations {
            if *s != subject {
                continue;
            }
            let target_kind = relation.target_kind(subject.kind)?;
            if let Some(handle) = handle_of(target_kind, *target) {
                out.push(RelationSpec::new(*relation, handle.into_inner()));
            }
        }
        Ok(out)
    }
}
