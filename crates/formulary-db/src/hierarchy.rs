//! Discipline parent/child tree.
//!
//! Parent changes take a transaction-scoped advisory lock so two concurrent
//! changes cannot each pass the cycle check and together close a loop.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use formulary_core::defaults::HIERARCHY_LOCK_KEY;
use formulary_core::{
    check_parent_assignment, topic_chain, EntityKind, Error, Handle, HierarchyRepository, Result,
    Subject, SurrogateKey,
};

use crate::catalog::{require_row, stored_handle, PgCatalog, ANCESTOR_CHAIN_SQL};
use crate::categories::primary_discipline_tx;

/// (discipline, parent, handle) from `start` upward.
pub(crate) async fn ancestor_rows(
    tx: &mut Transaction<'_, Postgres>,
    start: SurrogateKey,
) -> Result<Vec<(SurrogateKey, Option<SurrogateKey>, Option<String>)>> {
    let rows = sqlx::query(ANCESTOR_CHAIN_SQL)
        .bind(start)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get("id"), r.get("parent"), r.get("handle")))
        .collect())
}

/// Handles of `start` and its ancestors, nearest first.
pub(crate) async fn ancestor_handles_tx(
    tx: &mut Transaction<'_, Postgres>,
    start: SurrogateKey,
) -> Result<Vec<Handle>> {
    Ok(ancestor_rows(tx, start)
        .await?
        .into_iter()
        .filter_map(|(_, _, handle)| stored_handle(handle))
        .collect())
}

/// Topic resolution chain of a subject's primary discipline.
pub(crate) async fn primary_chain_tx(
    tx: &mut Transaction<'_, Postgres>,
    subject: Subject,
) -> Result<Vec<Handle>> {
    let Some(primary) = primary_discipline_tx(tx, subject).await? else {
        return Ok(Vec::new());
    };
    let handles = ancestor_rows(tx, primary)
        .await?
        .into_iter()
        .map(|(_, _, handle)| stored_handle(handle));
    Ok(topic_chain(handles))
}

#[async_trait]
impl HierarchyRepository for PgCatalog {
    async fn set_parent(
        &self,
        discipline: SurrogateKey,
        parent: Option<SurrogateKey>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(HIERARCHY_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        require_row(&mut tx, Subject::new(EntityKind::Discipline, discipline), true).await?;
        if let Some(parent) = parent {
            require_row(&mut tx, Subject::new(EntityKind::Discipline, parent), false).await?;
            let parents: HashMap<SurrogateKey, Option<SurrogateKey>> = ancestor_rows(&mut tx, parent)
                .await?
                .into_iter()
                .map(|(id, parent, _)| (id, parent))
                .collect();
            check_parent_assignment(discipline, parent, |node| {
                parents.get(&node).copied().flatten()
            })?;
        }

        let result = sqlx::query(
            "UPDATE tbl_discipline SET parent_discipline_id = $2 \
             WHERE discipline_id = $1 AND parent_discipline_id IS DISTINCT FROM $2",
        )
        .bind(discipline)
        .bind(parent)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        let changed = result.rows_affected() > 0;
        debug!(
            subsystem = "catalog",
            component = "hierarchy",
            op = "set_parent",
            surrogate_key = discipline,
            parent = ?parent,
            changed,
            "Discipline parent set"
        );
        Ok(changed)
    }

    async fn ancestor_handles(&self, discipline: SurrogateKey) -> Result<Vec<Handle>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        require_row(&mut tx, Subject::new(EntityKind::Discipline, discipline), false).await?;
        let handles = ancestor_handles_tx(&mut tx, discipline).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(handles)
    }
}
