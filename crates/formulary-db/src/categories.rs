//! Category links and the one-primary-per-subject rule.
//!
//! `set_primary` locks the subject row, so concurrent calls on the same
//! subject serialise and the last committer wins. After the tightening
//! migrations a partial unique index backs the rule as well.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use formulary_core::{
    CategoryLink, CategoryRepository, EntityKind, Error, Result, Subject, SurrogateKey,
};

use crate::catalog::{require_row, stored_handle, PgCatalog};

pub(crate) fn link_table(kind: EntityKind) -> Result<&'static str> {
    kind.require_categorized()?;
    kind.category_link_table()
        .map(|(table, _)| table)
        .ok_or_else(|| Error::Internal(format!("{} has no category link table", kind)))
}

fn link_select(kind: EntityKind, table: &str) -> String {
    format!(
        "SELECT l.discipline_id::BIGINT AS discipline_id, d.discipline_handle, \
                l.is_primary, l.rank, l.notes \
         FROM {table} l \
         JOIN tbl_discipline d ON d.discipline_id = l.discipline_id \
         WHERE l.{key} = $1",
        table = table,
        key = kind.key_column(),
    )
}

fn to_link(row: PgRow) -> CategoryLink {
    CategoryLink {
        discipline_id: row.get("discipline_id"),
        discipline_handle: stored_handle(row.get("discipline_handle")),
        is_primary: row.get("is_primary"),
        rank: row.get("rank"),
        notes: row.get("notes"),
    }
}

/// Links of a subject as seen inside `tx`.
pub(crate) async fn category_links_tx(
    tx: &mut Transaction<'_, Postgres>,
    subject: Subject,
) -> Result<Vec<CategoryLink>> {
    let table = link_table(subject.kind)?;
    let rows = sqlx::query(&link_select(subject.kind, table))
        .bind(subject.key)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;
    Ok(rows.into_iter().map(to_link).collect())
}

/// The subject's primary discipline as seen inside `tx`. Legacy data may
/// still hold several; the lowest rank wins.
pub(crate) async fn primary_discipline_tx(
    tx: &mut Transaction<'_, Postgres>,
    subject: Subject,
) -> Result<Option<SurrogateKey>> {
    let table = link_table(subject.kind)?;
    sqlx::query_scalar(&format!(
        "SELECT discipline_id::BIGINT FROM {table} WHERE {key} = $1 AND is_primary \
         ORDER BY rank NULLS LAST, discipline_id LIMIT 1",
        key = subject.kind.key_column(),
    ))
    .bind(subject.key)
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)
}

#[async_trait]
impl CategoryRepository for PgCatalog {
    async fn set_primary(&self, subject: Subject, discipline: SurrogateKey) -> Result<()> {
        let table = link_table(subject.kind)?;
        let key = subject.kind.key_column();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        require_row(&mut tx, subject, true).await?;
        let discipline_exists = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM tbl_discipline WHERE discipline_id = $1 FOR SHARE",
        )
        .bind(discipline)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        if discipline_exists.is_none() {
            return Err(Error::NotFound(
                Subject::new(EntityKind::Discipline, discipline).to_string(),
            ));
        }

        sqlx::query(&format!(
            "UPDATE {table} SET is_primary = FALSE \
             WHERE {key} = $1 AND is_primary AND discipline_id <> $2",
        ))
        .bind(subject.key)
        .bind(discipline)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let promoted = sqlx::query(&format!(
            "INSERT INTO {table} ({key}, discipline_id, is_primary) VALUES ($1, $2, TRUE) \
             ON CONFLICT ({key}, discipline_id) DO UPDATE SET is_primary = TRUE",
        ))
        .bind(subject.key)
        .bind(discipline)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database);

        match promoted {
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
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn clear_primary(&self, subject: Subject) -> Result<bool> {
        let table = link_table(subject.kind)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        require_row(&mut tx, subject, true).await?;

        let result = sqlx::query(&format!(
            "UPDATE {table} SET is_primary = FALSE WHERE {key} = $1 AND is_primary",
            table = table,
            key = subject.kind.key_column(),
        ))
        .bind(subject.key)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn derive_primary_category(&self, subject: Subject) -> Result<Option<CategoryLink>> {
        let table = link_table(subject.kind)?;
        let row = sqlx::query(&format!(
            "{} AND l.is_primary ORDER BY l.rank NULLS LAST, l.discipline_id LIMIT 1",
            link_select(subject.kind, table)
        ))
        .bind(subject.key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(to_link))
    }

    async fn category_links(&self, subject: Subject) -> Result<Vec<CategoryLink>> {
        let table = link_table(subject.kind)?;
        let rows = sqlx::query(&format!(
            "{} ORDER BY l.is_primary DESC, l.rank NULLS LAST, l.discipline_id",
            link_select(subject.kind, table)
        ))
        .bind(subject.key)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(to_link).collect())
    }

    async fn repair_primaries(&self, kind: EntityKind) -> Result<u64> {
        let table = link_table(kind)?;
        let key = kind.key_column();

        // Keep the lowest-rank primary (then lowest discipline id) per subject.
        let repaired: i64 = sqlx::query_scalar(&format!(
            r#"
            WITH ranked AS (
                SELECT {key}, discipline_id,
                       row_number() OVER (
                           PARTITION BY {key}
                           ORDER BY rank NULLS LAST, discipline_id
                       ) AS rn
                FROM {table}
                WHERE is_primary
            ),
            demoted AS (
                UPDATE {table} l SET is_primary = FALSE
                FROM ranked r
                WHERE l.{key} = r.{key} AND l.discipline_id = r.discipline_id AND r.rn > 1
                RETURNING l.{key}
            )
            SELECT COUNT(DISTINCT {key}) FROM demoted
            "#,
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        if repaired > 0 {
            info!(
                subsystem = "catalog",
                component = "categories",
                op = "repair_primaries",
                entity_kind = %kind,
                result_count = repaired,
                "Demoted extra primary categories"
            );
        }
        Ok(repaired as u64)
    }
}
