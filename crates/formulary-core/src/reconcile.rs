//! Import reconciler: applies a handle-keyed payload to the local store.
//!
//! Processing runs in three passes:
//!
//! 0. Validate every entry (handle syntax, field whitelist, category link
//!    shape, duplicates within the payload). Nothing is written.
//! 1. Upsert entities. Entries of different kinds run concurrently; entries
//!    of one kind run in payload order. A create that loses a handle race
//!    to another importer is retried as an update.
//! 2. Resolve and write category links and relations, in payload order, once
//!    every entity of the payload has a local key. A subject's category
//!    links and the topic derived from them are written in one store call.
//!
//! Each entry fails on its own; a relation whose target failed earlier in
//! the same payload is reported as skipped rather than failed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::models::{missing_required, CategorySet, ResolvedCategoryLink, Subject, SurrogateKey};
use crate::payload::{validate_entry, ImportPayload, RelationSpec, ValidatedEntry, ValidatedLink};
use crate::report::{
    EntryOutcome, EntryReport, ImportReport, LinkOutcome, LinkReport, SkipReason,
};
use crate::topic::{TopicMap, TopicSource};
use crate::traits::ImportStore;

/// Result of pass 1 for one entry.
#[derive(Debug, Clone, Copy)]
struct Upserted {
    key: SurrogateKey,
    created: bool,
    changed: bool,
}

/// How a referenced handle resolved during pass 2.
enum Target {
    Key(SurrogateKey),
    DependencyFailed,
}

/// Applies import payloads through an `ImportStore`.
pub struct ImportReconciler<'a, S: ImportStore + ?Sized> {
    store: &'a S,
    topics: &'a TopicMap,
}

impl<'a, S: ImportStore + ?Sized> ImportReconciler<'a, S> {
    pub fn new(store: &'a S, topics: &'a TopicMap) -> Self {
        Self { store, topics }
    }

    /// Import a payload. Never aborts on an entry failure; see the report.
    pub async fn import_payload(&self, payload: &ImportPayload) -> ImportReport {
        let start = Instant::now();
        let mut reports: Vec<EntryReport> = Vec::with_capacity(payload.entries.len());
        // (kind, normalised handle) of entries that failed any pass.
        let mut failed: HashSet<(EntityKind, String)> = HashSet::new();

        // Pass 0: validation.
        let mut valid: Vec<ValidatedEntry> = Vec::new();
        let mut first_seen: HashMap<(EntityKind, Handle), usize> = HashMap::new();
        for (index, entry) in payload.entries.iter().enumerate() {
            let validated = validate_entry(index, entry).and_then(|v| {
                match first_seen.get(&(v.kind, v.handle.clone())) {
                    Some(first) => Err(Error::InvalidInput(format!(
                        "duplicate {} '{}' (first at entry {})",
                        v.kind, v.handle, first
                    ))),
                    None => {
                        first_seen.insert((v.kind, v.handle.clone()), index);
                        Ok(v)
                    }
                }
            });
            match validated {
                Ok(v) => valid.push(v),
                Err(e) => {
                    debug!(
                        subsystem = "import",
                        component = "reconciler",
                        entity_kind = %entry.entity_type,
                        handle = %entry.handle,
                        error = %e,
                        "Entry failed validation"
                    );
                    // Nothing can reference an entry of an unknown type.
                    if let Ok(kind) = entry.kind() {
                        let is_duplicate = Handle::parse(&entry.handle)
                            .map_or(false, |h| first_seen.contains_key(&(kind, h)));
                        // A duplicate must not poison relations pointing at the first entry.
                        if !is_duplicate {
                            failed.insert((kind, normalise(&entry.handle)));
                        }
                    }
                    reports.push(EntryReport {
                        index,
                        entity_type: entry.entity_type.clone(),
                        handle: entry.handle.clone(),
                        outcome: EntryOutcome::failed(&e),
                        links: Vec::new(),
                    });
                }
            }
        }

        // Pass 1: entities, concurrently across kinds.
        let mut by_kind: BTreeMap<EntityKind, Vec<&ValidatedEntry>> = BTreeMap::new();
        for entry in &valid {
            by_kind.entry(entry.kind).or_default().push(entry);
        }
        let groups = join_all(
            EntityKind::ALL
                .into_iter()
                .filter_map(|kind| by_kind.remove(&kind))
                .map(|entries| self.upsert_group(entries)),
        )
        .await;

        let mut upserted: HashMap<usize, Upserted> = HashMap::new();
        let mut resolved: HashMap<(EntityKind, Handle), SurrogateKey> = HashMap::new();
        for (entry, result) in groups.into_iter().flatten() {
            match result {
                Ok(u) => {
                    resolved.insert((entry.kind, entry.handle.clone()), u.key);
                    upserted.insert(entry.index, u);
                }
                Err(e) => {
                    warn!(
                        subsystem = "import",
                        component = "reconciler",
                        entity_kind = %entry.kind,
                        handle = %entry.handle,
                        error = %e,
                        "Entry upsert failed"
                    );
                    failed.insert((entry.kind, entry.handle.to_string()));
                    reports.push(EntryReport {
                        index: entry.index,
                        entity_type: entry.kind.to_string(),
                        handle: entry.handle.to_string(),
                        outcome: EntryOutcome::failed(&e),
                        links: Vec::new(),
                    });
                }
            }
        }

        // Pass 2: links and relations, in payload order.
        for entry in &valid {
            let Some(u) = upserted.get(&entry.index).copied() else {
                continue;
            };
            let subject = Subject::new(entry.kind, u.key);
            let mut links = Vec::new();
            let mut link_changed = false;

            if entry.kind.is_categorized() {
                let mut set = None;
                if let Some(category_links) = &entry.category_links {
                    match self
                        .resolve_categories(subject, category_links, &resolved, &failed)
                        .await
                    {
                        Ok(resolved_set) => set = Some((resolved_set, category_links.as_slice())),
                        Err(report) => links.push(report),
                    }
                }
                let (report, changed) = self
                    .write_categories(subject, set.as_ref().map(|(s, l)| (s, *l)))
                    .await;
                link_changed |= changed;
                links.extend(report);
            }
            for relation in &entry.relations {
                let report = self
                    .apply_relation(subject, relation, &resolved, &failed)
                    .await;
                link_changed |= report.outcome == LinkOutcome::Linked;
                links.push(report);
            }

            let outcome = if u.created {
                EntryOutcome::Created { key: u.key }
            } else if u.changed || link_changed {
                EntryOutcome::Updated { key: u.key }
            } else {
                EntryOutcome::Skipped {
                    key: u.key,
                    reason: SkipReason::Unchanged,
                }
            };
            reports.push(EntryReport {
                index: entry.index,
                entity_type: entry.kind.to_string(),
                handle: entry.handle.to_string(),
                outcome,
                links,
            });
        }

        let report = ImportReport::from_entries(reports);
        info!(
            subsystem = "import",
            component = "reconciler",
            op = "import_payload",
            result_count = report.summary.total,
            created = report.summary.created,
            updated = report.summary.updated,
            skipped = report.summary.skipped,
            failed = report.summary.failed,
            links_failed = report.summary.links_failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Import complete"
        );
        report
    }

    /// Upsert one kind's entries sequentially.
    async fn upsert_group<'e>(
        &self,
        entries: Vec<&'e ValidatedEntry>,
    ) -> Vec<(&'e ValidatedEntry, Result<Upserted>)> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self.upsert_entry(entry).await;
            results.push((entry, result));
        }
        results
    }

    async fn upsert_entry(&self, entry: &ValidatedEntry) -> Result<Upserted> {
        if let Some(key) = self.store.resolve(entry.kind, &entry.handle).await? {
            return self.update(entry, key).await;
        }

        let missing = missing_required(entry.kind, &entry.fields);
        if !missing.is_empty() {
            return Err(Error::InvalidInput(format!(
                "new {} '{}' is missing required fields: {}",
                entry.kind,
                entry.handle,
                missing.join(", ")
            )));
        }

        match self
            .store
            .create_entity(entry.kind, &entry.handle, &entry.fields)
            .await
        {
            Ok(key) => {
                debug!(
                    entity_kind = %entry.kind,
                    handle = %entry.handle,
                    surrogate_key = key,
                    "Entity created"
                );
                Ok(Upserted {
                    key,
                    created: true,
                    changed: true,
                })
            }
            Err(Error::HandleConflict { existing, .. }) => {
                warn!(
                    subsystem = "import",
                    component = "reconciler",
                    entity_kind = %entry.kind,
                    handle = %entry.handle,
                    surrogate_key = existing,
                    "Handle registered concurrently, retrying as update"
                );
                self.update(entry, existing).await
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, entry: &ValidatedEntry, key: SurrogateKey) -> Result<Upserted> {
        let changed = self
            .store
            .update_entity(entry.kind, key, &entry.fields)
            .await?;
        Ok(Upserted {
            key,
            created: false,
            changed,
        })
    }

    fn lookup(
        &self,
        resolved: &HashMap<(EntityKind, Handle), SurrogateKey>,
        kind: EntityKind,
        handle: &Handle,
    ) -> Option<SurrogateKey> {
        resolved.get(&(kind, handle.clone())).copied()
    }

    /// Resolve a reference: payload first, then the registry.
    async fn resolve_target(
        &self,
        kind: EntityKind,
        handle: &Handle,
        resolved: &HashMap<(EntityKind, Handle), SurrogateKey>,
        failed: &HashSet<(EntityKind, String)>,
    ) -> Result<Target> {
        if let Some(key) = self.lookup(resolved, kind, handle) {
            return Ok(Target::Key(key));
        }
        if failed.contains(&(kind, handle.to_string())) {
            return Ok(Target::DependencyFailed);
        }
        match self.store.resolve(kind, handle).await? {
            Some(key) => Ok(Target::Key(key)),
            None => Err(Error::UnresolvedReference {
                kind,
                handle: handle.to_string(),
            }),
        }
    }

    fn category_report(links: &[ValidatedLink], outcome: LinkOutcome) -> LinkReport {
        LinkReport {
            relation: "categories".to_string(),
            target: links
                .iter()
                .find(|l| l.is_primary)
                .map(|l| l.discipline.to_string()),
            outcome,
        }
    }

    /// Resolve category links to local keys. A discipline that failed or
    /// cannot be found turns into the entry's category report line.
    async fn resolve_categories(
        &self,
        subject: Subject,
        links: &[ValidatedLink],
        resolved: &HashMap<(EntityKind, Handle), SurrogateKey>,
        failed: &HashSet<(EntityKind, String)>,
    ) -> std::result::Result<CategorySet, LinkReport> {
        let mut desired = Vec::with_capacity(links.len());
        for link in links {
            match self
                .resolve_target(EntityKind::Discipline, &link.discipline, resolved, failed)
                .await
            {
                Ok(Target::Key(key)) => desired.push(ResolvedCategoryLink {
                    discipline_id: key,
                    is_primary: link.is_primary,
                    rank: link.rank,
                    notes: link.notes.clone(),
                }),
                Ok(Target::DependencyFailed) => {
                    warn!(
                        subsystem = "import",
                        component = "reconciler",
                        subject = %subject,
                        discipline = %link.discipline,
                        "Category link skipped, discipline failed to import"
                    );
                    return Err(Self::category_report(
                        links,
                        LinkOutcome::Skipped {
                            reason: SkipReason::DependencyFailed {
                                handle: link.discipline.to_string(),
                            },
                        },
                    ));
                }
                Err(e) => return Err(Self::category_report(links, LinkOutcome::failed(&e))),
            }
        }
        Ok(CategorySet::new(desired))
    }

    /// Write the category set (if any) and recompute the topic in one store
    /// call. Returns the category report line and whether anything changed.
    async fn write_categories(
        &self,
        subject: Subject,
        set: Option<(&CategorySet, &[ValidatedLink])>,
    ) -> (Option<LinkReport>, bool) {
        let written = self
            .store
            .write_category_set(subject, set.map(|(s, _)| s), self.topics)
            .await;

        match written {
            Ok(write) => {
                if let TopicSource::Unmapped { discipline } = &write.topic.source {
                    warn!(
                        subsystem = "import",
                        component = "reconciler",
                        subject = %subject,
                        discipline = %discipline,
                        topic = %write.topic.topic,
                        "Primary discipline has no topic rule, using default topic"
                    );
                }
                let report = set.map(|(_, links)| {
                    let outcome = if write.links_changed {
                        LinkOutcome::Linked
                    } else {
                        LinkOutcome::Unchanged
                    };
                    Self::category_report(links, outcome)
                });
                (report, write.links_changed || write.topic_changed)
            }
            Err(e) => {
                let report = match set {
                    Some((_, links)) => Self::category_report(links, LinkOutcome::failed(&e)),
                    None => LinkReport {
                        relation: "topic".to_string(),
                        target: None,
                        outcome: LinkOutcome::failed(&e),
                    },
                };
                (Some(report), false)
            }
        }
    }

    async fn apply_relation(
        &self,
        subject: Subject,
        relation: &RelationSpec,
        resolved: &HashMap<(EntityKind, Handle), SurrogateKey>,
        failed: &HashSet<(EntityKind, String)>,
    ) -> LinkReport {
        let report = |outcome| LinkReport {
            relation: relation.relation_type.clone(),
            target: Some(relation.target_handle.clone()),
            outcome,
        };

        let relation_type = match relation.relation() {
            Ok(relation_type) => relation_type,
            Err(e) => return report(LinkOutcome::failed(&e)),
        };
        let target_kind = match relation_type.target_kind(subject.kind) {
            Ok(kind) => kind,
            Err(e) => return report(LinkOutcome::failed(&e)),
        };
        let handle = match Handle::parse(&relation.target_handle) {
            Ok(handle) => handle,
            Err(e) => return report(LinkOutcome::failed(&e)),
        };
        let target = match self
            .resolve_target(target_kind, &handle, resolved, failed)
            .await
        {
            Ok(Target::Key(key)) => key,
            Ok(Target::DependencyFailed) => {
                warn!(
                    subsystem = "import",
                    component = "reconciler",
                    subject = %subject,
                    relation = %relation_type,
                    handle = %handle,
                    "Relation skipped, target failed to import"
                );
                return report(LinkOutcome::Skipped {
                    reason: SkipReason::DependencyFailed {
                        handle: handle.to_string(),
                    },
                });
            }
            Err(e) => return report(LinkOutcome::failed(&e)),
        };

        match self
            .store
            .link_relation(subject, relation_type, target)
            .await
        {
            Ok(true) => report(LinkOutcome::Linked),
            Ok(false) => report(LinkOutcome::Unchanged),
            Err(e) => report(LinkOutcome::failed(&e)),
        }
    }
}

fn normalise(raw: &str) -> String {
    raw.trim().to_lowercase()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCatalog;
    use crate::payload::{ImportEntry, RelationType};
    use crate::models::FieldValue;
    use crate::traits::{CategoryRepository, HandleRegistry};

    fn h(s: &str) -> Handle {
        Handle::parse(s).unwrap()
    }

    fn seeded() -> MemoryCatalog {
        let store = MemoryCatalog::new();
        let physics = store.insert_discipline("physics", None);
        store.insert_discipline("classical_mechanics", Some(physics));
        store.insert_discipline("relativity", Some(physics));
        store
    }

    fn newtons_second_law(latex: &str) -> ImportEntry {
        ImportEntry::new(EntityKind::Formula, "newtons_second_law")
            .field("formula_name", "Newton's Second Law")
            .field("latex", latex)
            .category("classical_mechanics", true)
    }

    #[tokio::test]
    async fn test_create_then_update_keeps_identity() {
        let store = seeded();
        let map = TopicMap::builtin();
        let reconciler = ImportReconciler::new(&store, &map);

        let report = reconciler
            .import_payload(&ImportPayload::new(vec![newtons_second_law("F = ma")]))
            .await;
        let key = match report.entries[0].outcome {
            EntryOutcome::Created { key } => key,
            ref other => panic!("expected Created, got {:?}", other),
        };
        let subject = Subject::new(EntityKind::Formula, key);
        assert_eq!(
            store
                .resolve(EntityKind::Formula, &h("newtons_second_law"))
                .await
                .unwrap(),
            Some(key)
        );
        assert_eq!(store.topic_of(subject), Some(h("classical_mechanics")));
        assert_eq!(store.primary_count(subject), 1);

        let report = reconciler
            .import_payload(&ImportPayload::new(vec![newtons_second_law(
                r"\vec{F} = m\vec{a}",
            )]))
            .await;
        assert_eq!(report.entries[0].outcome, EntryOutcome::Updated { key });
        assert_eq!(
            store.field_of(subject, "latex"),
            Some(FieldValue::Text(r"\vec{F} = m\vec{a}".into()))
        );
        assert_eq!(store.row_count(EntityKind::Formula), 1);
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent() {
        let store = seeded();
        let map = TopicMap::builtin();
        let reconciler = ImportReconciler::new(&store, &map);
        let payload = ImportPayload::new(vec![
            ImportEntry::new(EntityKind::Discipline, "optics")
                .field("discipline_name", "Optics")
                .relation(RelationType::Parent, "physics"),
            newtons_second_law("F = ma").relation(RelationType::Prerequisite, "momentum"),
            ImportEntry::new(EntityKind::Formula, "momentum")
                .field("formula_name", "Momentum")
                .field("latex", "p = mv")
                .category("classical_mechanics", false)
                .category("physics", true),
        ]);

        let first = reconciler.import_payload(&payload).await;
        assert!(first.is_clean(), "{:?}", first);
        assert_eq!(first.summary.created, 3);
        let state = store.snapshot();

        let second = reconciler.import_payload(&payload).await;
        assert_eq!(second.summary.created, 0);
        assert_eq!(second.summary.skipped, 3);
        assert_eq!(store.snapshot(), state);
    }

    #[tokio::test]
    async fn test_forward_references_resolve_in_second_pass() {
        let store = seeded();
        let map = TopicMap::builtin();
        let payload = ImportPayload::new(vec![
            ImportEntry::new(EntityKind::Question, "q_force")
                .field("question_type", "word_problem")
                .field("stem", "Compute the force")
                .relation(RelationType::Formula, "force"),
            ImportEntry::new(EntityKind::Formula, "force")
                .field("formula_name", "Force")
                .field("latex", "F = ma"),
        ]);
        let report = ImportReconciler::new(&store, &map)
            .import_payload(&payload)
            .await;
        assert!(report.is_clean(), "{:?}", report);

        let q = store.resolve(EntityKind::Question, &h("q_force")).await.unwrap().unwrap();
        let f = store.resolve(EntityKind::Formula, &h("force")).await.unwrap().unwrap();
        assert!(store.has_relation(
            Subject::new(EntityKind::Question, q),
            RelationType::Formula,
            f
        ));
    }

    #[tokio::test]
    async fn test_failed_entry_skips_dependents_without_aborting() {
        let store = seeded();
        let map = TopicMap::builtin();
        let payload = ImportPayload::new(vec![
            // Missing required latex: fails on create.
            ImportEntry::new(EntityKind::Formula, "broken").field("formula_name", "Broken"),
            ImportEntry::new(EntityKind::Formula, "depends_on_broken")
                .field("formula_name", "Dependent")
                .field("latex", "x")
                .relation(RelationType::Prerequisite, "broken")
                .relation(RelationType::Prerequisite, "nowhere"),
        ]);
        let report = ImportReconciler::new(&store, &map)
            .import_payload(&payload)
            .await;

        assert!(report.entries[0].outcome.is_failed());
        let dependent = &report.entries[1];
        assert!(matches!(dependent.outcome, EntryOutcome::Created { .. }));
        assert_eq!(
            dependent.links[0].outcome,
            LinkOutcome::Skipped {
                reason: SkipReason::DependencyFailed {
                    handle: "broken".into()
                }
            }
        );
        match &dependent.links[1].outcome {
            LinkOutcome::Failed { error_kind, .. } => assert_eq!(error_kind, "unresolved_reference"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.links_skipped, 1);
        assert_eq!(report.summary.links_failed, 1);
    }

    #[tokio::test]
    async fn test_invalid_entries_fail_individually() {
        let store = seeded();
        let map = TopicMap::builtin();
        let payload = ImportPayload::new(vec![
            ImportEntry::new(EntityKind::Term, "bad handle!").field("term_name", "X"),
            newtons_second_law("F = ma").category("relativity", true),
            ImportEntry::new(EntityKind::Term, "mass")
                .field("term_name", "Mass")
                .field("definition", "Quantity of matter"),
            ImportEntry::new(EntityKind::Term, "Mass")
                .field("term_name", "Mass again")
                .field("definition", "dup"),
        ]);
        let report = ImportReconciler::new(&store, &map)
            .import_payload(&payload)
            .await;

        assert!(report.entries[0].outcome.is_failed());
        assert!(report.entries[1].outcome.is_failed());
        assert!(matches!(report.entries[2].outcome, EntryOutcome::Created { .. }));
        assert!(report.entries[3].outcome.is_failed());
        assert_eq!(store.row_count(EntityKind::Term), 1);
        assert_eq!(store.row_count(EntityKind::Formula), 0);
    }

    #[tokio::test]
    async fn test_category_links_are_replaced_and_primary_routed() {
        let store = seeded();
        let map = TopicMap::builtin();
        let reconciler = ImportReconciler::new(&store, &map);
        reconciler
            .import_payload(&ImportPayload::new(vec![newtons_second_law("F = ma")
                .category("physics", false)]))
            .await;

        let moved = ImportEntry::new(EntityKind::Formula, "newtons_second_law")
            .category("relativity", true);
        let report = reconciler
            .import_payload(&ImportPayload::new(vec![moved]))
            .await;
        let key = report.entries[0].outcome.key().unwrap();
        let subject = Subject::new(EntityKind::Formula, key);

        assert!(matches!(report.entries[0].outcome, EntryOutcome::Updated { .. }));
        let links = store.category_links(subject).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].discipline_handle, Some(h("relativity")));
        assert!(links[0].is_primary);
        assert_eq!(store.topic_of(subject), Some(h("relativity")));
    }

    #[tokio::test]
    async fn test_unmapped_primary_falls_back_to_uncategorized() {
        let store = seeded();
        let map = TopicMap::builtin();
        let entry = ImportEntry::new(EntityKind::Term, "inertia")
            .field("term_name", "Inertia")
            .field("definition", "Resistance to change in motion")
            .category("physics", true);
        let report = ImportReconciler::new(&store, &map)
            .import_payload(&ImportPayload::new(vec![entry]))
            .await;
        let key = report.entries[0].outcome.key().unwrap();
        assert_eq!(
            store.topic_of(Subject::new(EntityKind::Term, key)),
            Some(h("uncategorized"))
        );
    }

    #[tokio::test]
    async fn test_lost_create_race_retries_as_update() {
        let store = seeded();
        store.claim_handle_on_next_write(EntityKind::Formula, "newtons_second_law");
        let map = TopicMap::builtin();
        let report = ImportReconciler::new(&store, &map)
            .import_payload(&ImportPayload::new(vec![newtons_second_law("F = ma")]))
            .await;

        assert!(matches!(report.entries[0].outcome, EntryOutcome::Updated { .. }));
        assert_eq!(store.row_count(EntityKind::Formula), 1);
    }

    #[tokio::test]
    async fn test_parent_cycle_fails_only_that_relation() {
        let store = seeded();
        let map = TopicMap::builtin();
        let payload = ImportPayload::new(vec![
            ImportEntry::new(EntityKind::Discipline, "physics")
                .relation(RelationType::Parent, "classical_mechanics"),
        ]);
        let report = ImportReconciler::new(&store, &map)
            .import_payload(&payload)
            .await;
        let entry = &report.entries[0];
        assert!(matches!(entry.outcome, EntryOutcome::Skipped { .. }));
        match &entry.links[0].outcome {
            LinkOutcome::Failed { error_kind, .. } => assert_eq!(error_kind, "cycle_detected"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relation_on_wrong_kind_fails_only_the_relation() {
        let store = seeded();
        let map = TopicMap::builtin();
        let entry = ImportEntry::new(EntityKind::Term, "mass")
            .field("term_name", "Mass")
            .field("definition", "Quantity of matter")
            .relation(RelationType::Parent, "physics");
        let report = ImportReconciler::new(&store, &map)
            .import_payload(&ImportPayload::new(vec![entry]))
            .await;
        assert!(matches!(report.entries[0].outcome, EntryOutcome::Created { .. }));
        assert_eq!(report.summary.links_failed, 1);
    }

    #[tokio::test]
    async fn test_primary_conflict_never_written_directly() {
        let store = seeded();
        let map = TopicMap::builtin();
        let reconciler = ImportReconciler::new(&store, &map);
        // Two imports flip the primary back and forth.
        for primary in ["classical_mechanics", "relativity", "classical_mechanics"] {
            let entry = ImportEntry::new(EntityKind::Formula, "newtons_second_law")
                .field("formula_name", "Newton's Second Law")
                .field("latex", "F = ma")
                .category("classical_mechanics", primary == "classical_mechanics")
                .category("relativity", primary == "relativity");
            reconciler
                .import_payload(&ImportPayload::new(vec![entry]))
                .await;
        }
        let key = store
            .resolve(EntityKind::Formula, &h("newtons_second_law"))
            .await
            .unwrap()
            .unwrap();
        let subject = Subject::new(EntityKind::Formula, key);
        assert_eq!(store.primary_count(subject), 1);
        assert_eq!(
            store
                .derive_primary_category(subject)
                .await
                .unwrap()
                .unwrap()
                .discipline_handle,
            Some(h("classical_mechanics"))
        );
    }

    #[tokio::test]
    async fn test_unknown_relation_or_entity_type_fails_alone() {
        let store = seeded();
        let map = TopicMap::builtin();
        let json = r#"{"entries": [
            {"entity_type": "formula", "handle": "force",
             "fields": {"formula_name": "Force", "latex": "F = ma"},
             "relations": [{"relation_type": "sibling", "target_handle": "momentum"}]},
            {"entity_type": "theorem", "handle": "pythagoras"},
            {"entity_type": "formula", "handle": "momentum",
             "fields": {"formula_name": "Momentum", "latex": "p = mv"}}
        ]}"#;
        let payload = ImportPayload::from_json(json).unwrap();
        let report = ImportReconciler::new(&store, &map)
            .import_payload(&payload)
            .await;

        let force = report.entry("force").unwrap();
        assert!(matches!(force.outcome, EntryOutcome::Created { .. }));
        assert_eq!(force.links[0].relation, "sibling");
        assert!(matches!(force.links[0].outcome, LinkOutcome::Failed { .. }));

        let theorem = report.entry("pythagoras").unwrap();
        assert_eq!(theorem.entity_type, "theorem");
        assert!(theorem.outcome.is_failed());

        assert!(matches!(
            report.entry("momentum").unwrap().outcome,
            EntryOutcome::Created { .. }
        ));
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.links_failed, 1);
    }
}
