//! Export of catalog rows as a handle-keyed payload.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::entity::EntityKind;
use crate::error::Result;
use crate::models::Subject;
use crate::payload::{CategoryLinkSpec, ImportEntry, ImportPayload};
use crate::traits::ExportStore;

/// An exported payload plus rows left out for lack of a handle.
#[derive(Debug, Clone, Default)]
pub struct ExportResult {
    pub payload: ImportPayload,
    pub omitted: BTreeMap<EntityKind, u64>,
}

/// Export rows of the given kinds (all kinds when empty).
///
/// Disciplines come first so a fresh environment can import the payload in
/// one go. Rows without a handle cannot be addressed across environments and
/// are counted in `omitted`.
pub async fn export_payload<S>(store: &S, kinds: &[EntityKind]) -> Result<ExportResult>
where
    S: ExportStore + ?Sized,
{
    let mut result = ExportResult::default();
    let selected = EntityKind::ALL
        .into_iter()
        .filter(|k| kinds.is_empty() || kinds.contains(k));

    for kind in selected {
        let mut omitted = 0u64;
        for row in store.export_rows(kind).await? {
            let Some(handle) = row.handle else {
                omitted += 1;
                continue;
            };
            let subject = Subject::new(kind, row.key);

            let mut entry = ImportEntry::new(kind, handle.into_inner());
            entry.fields = row
                .fields
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();

            if kind.is_categorized() {
                let links = store.category_links(subject).await?;
                entry.category_links = Some(
                    links
                        .into_iter()
                        .filter_map(|link| {
                            link.discipline_handle.map(|d| CategoryLinkSpec {
                                discipline_handle: d.into_inner(),
                                is_primary: link.is_primary,
                                rank: link.rank,
                                notes: link.notes,
                            })
                        })
                        .collect(),
                );
            }
            entry.relations = store.relations(subject).await?;
            result.payload.entries.push(entry);
        }

        if omitted > 0 {
            warn!(
                subsystem = "catalog",
                component = "export",
                entity_kind = %kind,
                result_count = omitted,
                "Rows without a handle left out of export"
            );
            result.omitted.insert(kind, omitted);
        }
    }

    result.payload.exported_at = Some(Utc::now());
    info!(
        subsystem = "catalog",
        component = "export",
        op = "export_payload",
        result_count = result.payload.entries.len(),
        "Export complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::memory::MemoryCatalog;
    use crate::payload::RelationType;
    use crate::reconcile::ImportReconciler;
    use crate::report::EntryOutcome;
    use crate::topic::TopicMap;
    use crate::traits::{CategoryRepository, HandleRegistry, HierarchyRepository};

    fn h(s: &str) -> Handle {
        Handle::parse(s).unwrap()
    }

    async fn source_catalog() -> MemoryCatalog {
        let store = MemoryCatalog::new();
        let physics = store.insert_discipline("physics", None);
        let mechanics = store.insert_discipline("classical_mechanics", None);
        store.set_parent(mechanics, Some(physics)).await.unwrap();

        let map = TopicMap::builtin();
        let force = ImportEntry::new(EntityKind::Formula, "force")
            .field("formula_name", "Force")
            .field("latex", "F = ma")
            .category("classical_mechanics", true);
        ImportReconciler::new(&store, &map)
            .import_payload(&ImportPayload::new(vec![force]))
            .await;
        // Legacy row never backfilled.
        store.insert_legacy(EntityKind::Formula, "Orphan");
        store
    }

    #[tokio::test]
    async fn test_export_omits_rows_without_handles() {
        let store = source_catalog().await;
        let result = export_payload(&store, &[EntityKind::Formula]).await.unwrap();
        assert_eq!(result.payload.entries.len(), 1);
        assert_eq!(result.omitted[&EntityKind::Formula], 1);

        let entry = &result.payload.entries[0];
        assert_eq!(entry.handle, "force");
        let links = entry.category_links.as_ref().unwrap();
        assert_eq!(links[0].discipline_handle, "classical_mechanics");
        assert!(links[0].is_primary);
    }

    #[tokio::test]
    async fn test_export_orders_disciplines_first_with_parents() {
        let store = source_catalog().await;
        let result = export_payload(&store, &[]).await.unwrap();
        assert_eq!(result.payload.entries[0].entity_type, "discipline");
        let mechanics = result
            .payload
            .entries
            .iter()
            .find(|e| e.handle == "classical_mechanics")
            .unwrap();
        assert_eq!(mechanics.relations[0].relation().unwrap(), RelationType::Parent);
        assert_eq!(mechanics.relations[0].target_handle, "physics");
    }

    #[tokio::test]
    async fn test_export_imports_into_fresh_environment() {
        let source = source_catalog().await;
        let exported = export_payload(&source, &[]).await.unwrap();

        // Different surrogate keys on the target side.
        let target = MemoryCatalog::new();
        target.insert_legacy(EntityKind::Formula, "Unrelated");
        let map = TopicMap::builtin();
        let report = ImportReconciler::new(&target, &map)
            .import_payload(&exported.payload)
            .await;
        assert!(report.is_clean(), "{:?}", report);
        assert!(report
            .entries
            .iter()
            .all(|e| matches!(e.outcome, EntryOutcome::Created { .. })));

        let force = target
            .resolve(EntityKind::Formula, &h("force"))
            .await
            .unwrap()
            .unwrap();
        let subject = Subject::new(EntityKind::Formula, force);
        assert_eq!(target.topic_of(subject), Some(h("classical_mechanics")));
        assert_eq!(
            target
                .derive_primary_category(subject)
                .await
                .unwrap()
                .unwrap()
                .discipline_handle,
            Some(h("classical_mechanics"))
        );
    }
}
