//! Writes issued by the import reconciler.

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::trace;

use formulary_core::{
    CategorySet, CategoryWrite, ContentFields, EntityKind, Error, Handle, HierarchyRepository,
    ImportStore, RelationType, Result, Subject, SurrogateKey, TopicMap, UNCATEGORIZED_TOPIC,
};

use crate::catalog::{
    ensure_topic, field_specs, push_field_value, relation_table, require_row, PgCatalog,
};
use crate::categories::{category_links_tx, link_table};
use crate::hierarchy::primary_chain_tx;

#[async_trait]
impl ImportStore for PgCatalog {
    async fn create_entity(
        &self,
        kind: EntityKind,
        handle: &Handle,
        fields: &ContentFields,
    ) -> Result<SurrogateKey> {
        let specs = field_specs(kind, fields)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let mut qb = QueryBuilder::new(format!("INSERT INTO {} (", kind.table()));
        let mut columns = qb.separated(", ");
        columns.push(kind.handle_column());
        if kind.is_categorized() {
            columns.push("topic_handle");
        }
        for (spec, _) in &specs {
            columns.push(spec.name);
        }
        qb.push(") VALUES (");
        qb.push_bind(handle.as_str().to_string());
        if kind.is_categorized() {
            let topic = Handle::parse(UNCATEGORIZED_TOPIC)?;
            ensure_topic(&mut tx, &topic).await?;
            qb.push(", ");
            qb.push_bind(topic.into_inner());
        }
        for (spec, value) in &specs {
            qb.push(", ");
            push_field_value(&mut qb, spec, value)?;
        }
        qb.push(format!(") RETURNING {}::BIGINT", kind.key_column()));

        let inserted = qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *tx)
            .await;

        let key = match inserted {
            Ok(key) => key,
            Err(e) => {
                drop(tx);
                return Err(self.handle_conflict(kind, handle, e).await);
            }
        };
        tx.commit().await.map_err(Error::Database)?;

        trace!(
            subsystem = "import",
            component = "store",
            op = "create_entity",
            entity_kind = %kind,
            handle = %handle,
            surrogate_key = key,
            "Row created"
        );
        Ok(key)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        key: SurrogateKey,
        fields: &ContentFields,
    ) -> Result<bool> {
        let specs = field_specs(kind, fields)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        require_row(&mut tx, Subject::new(kind, key), true).await?;
        if specs.is_empty() {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(false);
        }

        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", kind.table()));
        for (i, (spec, value)) in specs.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(spec.name).push(" = ");
            push_field_value(&mut qb, spec, value)?;
        }
        if kind.is_categorized() {
            // Legacy rows written before the topic backfill would fail the
            // topic CHECK on any update; the reconciler recomputes the topic next.
            let topic = Handle::parse(UNCATEGORIZED_TOPIC)?;
            ensure_topic(&mut tx, &topic).await?;
            qb.push(", topic_handle = COALESCE(topic_handle, ");
            qb.push_bind(topic.into_inner());
            qb.push(")");
        }
        qb.push(format!(" WHERE {} = ", kind.key_column()));
        qb.push_bind(key);
        qb.push(" AND (");
        for (i, (spec, value)) in specs.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push(spec.name).push(" IS DISTINCT FROM ");
            push_field_value(&mut qb, spec, value)?;
        }
        qb.push(")");

        let result = qb
            .build()
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_category_set(
        &self,
        subject: Subject,
        set: Option<&CategorySet>,
        topics: &TopicMap,
    ) -> Result<CategoryWrite> {
        let table = link_table(subject.kind)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        require_row(&mut tx, subject, true).await?;

        let mut links_changed = false;
        if let Some(set) = set {
            let current = category_links_tx(&mut tx, subject).await?;
            if !set.matches(&current) {
                write_links(&mut tx, table, subject, set).await?;
                links_changed = true;
            }
        }

        let chain = primary_chain_tx(&mut tx, subject).await?;
        let topic = topics.resolve(&chain);
        ensure_topic(&mut tx, &topic.topic).await?;
        let result = sqlx::query(&format!(
            "UPDATE {table} SET topic_handle = $1 \
             WHERE {key} = $2 AND topic_handle IS DISTINCT FROM $1",
            table = subject.kind.table(),
            key = subject.kind.key_column(),
        ))
        .bind(topic.topic.as_str())
        .bind(subject.key)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        trace!(
            subsystem = "import",
            component = "store",
            op = "write_category_set",
            subject = %subject,
            links_changed,
            topic = %topic.topic,
            "Category set written"
        );
        Ok(CategoryWrite {
            links_changed,
            topic,
            topic_changed: result.rows_affected() > 0,
        })
    }

    async fn link_relation(
        &self,
        subject: Subject,
        relation: RelationType,
        target: SurrogateKey,
    ) -> Result<bool> {
        let target_kind = relation.target_kind(subject.kind)?;
        let Some((table, subject_col, target_col)) = relation_table(relation) else {
            return self.set_parent(subject.key, Some(target)).await;
        };
        if relation == RelationType::Prerequisite && subject.key == target {
            return Err(Error::InvalidInput(
                "a formula cannot be its own prerequisite".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        require_row(&mut tx, subject, false).await?;
        require_row(&mut tx, Subject::new(target_kind, target), false).await?;

        let result = sqlx::query(&format!(
            "INSERT INTO {table} ({subject_col}, {target_col}) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING"
        ))
        .bind(subject.key)
        .bind(target)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Replace a subject's links with `set` inside `tx`. Primaries are demoted
/// before the upserts so the partial unique index never sees two.
async fn write_links(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    subject: Subject,
    set: &CategorySet,
) -> Result<()> {
    let key = subject.kind.key_column();
    let keep: Vec<i64> = set
        .links
        .iter()
        .map(|l| l.discipline_id)
        .chain(set.primary)
        .collect();
    sqlx::query(&format!(
        "DELETE FROM {table} WHERE {key} = $1 AND NOT (discipline_id = ANY($2))"
    ))
    .bind(subject.key)
    .bind(&keep)
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?;

    sqlx::query(&format!(
        "UPDATE {table} SET is_primary = FALSE \
         WHERE {key} = $1 AND is_primary AND discipline_id IS DISTINCT FROM $2"
    ))
    .bind(subject.key)
    .bind(set.primary)
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?;

    let mut rows: Vec<(SurrogateKey, Option<i32>, Option<&str>)> = set
        .links
        .iter()
        .map(|l| (l.discipline_id, l.rank, l.notes.as_deref()))
        .collect();
    if let Some(primary) = set.primary {
        if !rows.iter().any(|(d, _, _)| *d == primary) {
            rows.push((primary, None, None));
        }
    }

    for (discipline, rank, notes) in rows {
        let upserted = sqlx::query(&format!(
            "INSERT INTO {table} ({key}, discipline_id, is_primary, rank, notes) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT ({key}, discipline_id) DO UPDATE \
             SET is_primary = EXCLUDED.is_primary, rank = EXCLUDED.rank, notes = EXCLUDED.notes"
        ))
        .bind(subject.key)
        .bind(discipline)
        .bind(set.primary == Some(discipline))
        .bind(rank)
        .bind(notes)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database);

        match upserted {
            Err(e) if e.is_foreign_key_violation() => {
                return Err(Error::NotFound(
                    Subject::new(EntityKind::Discipline, discipline).to_string(),
                ))
            }
            Err(e) if e.is_unique_violation() => {
                return Err(Error::PrimaryConflict {
                    kind: subject.kind,
                    subject: subject.key,
                })
            }
            other => {
                other?;
            }
        }
    }
    Ok(())
}
