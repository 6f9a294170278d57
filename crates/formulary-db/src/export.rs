//! Reads issued by the exporter.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::Row;

use formulary_core::{
    CatalogRow, EntityKind, Error, ExportStore, RelationSpec, RelationType, Result, Subject,
};

use crate::catalog::{fields_from_doc, relation_table, stored_handle, PgCatalog};

#[async_trait]
impl ExportStore for PgCatalog {
    async fn export_rows(&self, kind: EntityKind) -> Result<Vec<CatalogRow>> {
        let rows = sqlx::query(&format!(
            "SELECT t.{key}::BIGINT AS key, t.{handle} AS handle, to_jsonb(t) AS doc \
             FROM {table} t ORDER BY t.{key}",
            key = kind.key_column(),
            handle = kind.handle_column(),
            table = kind.table(),
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| {
                let doc: JsonValue = row.get("doc");
                let topic_handle = if kind.is_categorized() {
                    stored_handle(
                        doc.get("topic_handle")
                            .and_then(JsonValue::as_str)
                            .map(str::to_string),
                    )
                } else {
                    None
                };
                Ok(CatalogRow {
                    key: row.get("key"),
                    handle: stored_handle(row.get("handle")),
                    fields: fields_from_doc(kind, &doc)?,
                    topic_handle,
                })
            })
            .collect()
    }

    async fn relations(&self, subject: Subject) -> Result<Vec<RelationSpec>> {
        let mut relations = Vec::new();
        for &relation in RelationType::for_subject(subject.kind) {
            let target_kind = relation.target_kind(subject.kind)?;
            let sql = match relation_table(relation) {
                Some((table, subject_col, target_col)) => format!(
                    "SELECT t.{handle} FROM {table} r \
                     JOIN {target_table} t ON t.{target_key} = r.{target_col} \
                     WHERE r.{subject_col} = $1 ORDER BY t.{target_key}",
                    handle = target_kind.handle_column(),
                    target_table = target_kind.table(),
                    target_key = target_kind.key_column(),
                ),
                None => "SELECT p.discipline_handle FROM tbl_discipline d \
                         JOIN tbl_discipline p ON p.discipline_id = d.parent_discipline_id \
                         WHERE d.discipline_id = $1"
                    .to_string(),
            };

            let handles = sqlx::query_scalar::<_, Option<String>>(&sql)
                .bind(subject.key)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;

            relations.extend(
                handles
                    .into_iter()
                    .filter_map(stored_handle)
                    .map(|target| RelationSpec::new(relation, target.into_inner())),
            );
        }
        Ok(relations)
    }
}
