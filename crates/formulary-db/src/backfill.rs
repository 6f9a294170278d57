//! Row access for the backfill resolver.

use async_trait::async_trait;
use sqlx::Row;

use formulary_core::{
    BackfillStore, EntityKind, Error, Handle, HandleSeed, Result, Subject, SurrogateKey,
};

use crate::catalog::{ensure_topic, PgCatalog};
use crate::hierarchy::primary_chain_tx;

#[async_trait]
impl BackfillStore for PgCatalog {
    async fn rows_missing_handle(&self, kind: EntityKind) -> Result<Vec<HandleSeed>> {
        let extra = if kind == EntityKind::Question {
            "part_label, question_type"
        } else {
            "NULL::TEXT AS part_label, NULL::TEXT AS question_type"
        };
        let rows = sqlx::query(&format!(
            "SELECT {key}::BIGINT AS key, {seed}::TEXT AS name, {extra} \
             FROM {table} \
             WHERE {handle} IS NULL OR {handle} = '' \
             ORDER BY {key}",
            key = kind.key_column(),
            seed = kind.seed_column(),
            table = kind.table(),
            handle = kind.handle_column(),
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let question_type: Option<String> = r.get("question_type");
                HandleSeed {
                    key: r.get("key"),
                    name: r.get("name"),
                    part_label: r.get("part_label"),
                    multipart: question_type.as_deref() == Some("multipart"),
                }
            })
            .collect())
    }

    async fn existing_handles(&self, kind: EntityKind) -> Result<Vec<String>> {
        sqlx::query_scalar(&format!(
            "SELECT {handle} FROM {table} WHERE {handle} IS NOT NULL AND {handle} <> ''",
            handle = kind.handle_column(),
            table = kind.table(),
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn write_handle(
        &self,
        kind: EntityKind,
        key: SurrogateKey,
        handle: &Handle,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {table} SET {handle_col} = $1 \
             WHERE {key_col} = $2 AND ({handle_col} IS NULL OR {handle_col} = '')",
            table = kind.table(),
            handle_col = kind.handle_column(),
            key_col = kind.key_column(),
        ))
        .bind(handle.as_str())
        .bind(key)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() > 0),
            Err(e) => Err(self.handle_conflict(kind, handle, e).await),
        }
    }

    async fn rows_missing_topic(&self, kind: EntityKind) -> Result<Vec<SurrogateKey>> {
        kind.require_categorized()?;
        sqlx::query_scalar(&format!(
            "SELECT {key}::BIGINT FROM {table} WHERE topic_handle IS NULL ORDER BY {key}",
            key = kind.key_column(),
            table = kind.table(),
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn primary_discipline_chain(&self, subject: Subject) -> Result<Vec<Handle>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let chain = primary_chain_tx(&mut tx, subject).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(chain)
    }

    async fn write_topic(&self, subject: Subject, topic: &Handle) -> Result<bool> {
        subject.kind.require_categorized()?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        ensure_topic(&mut tx, topic).await?;

        let result = sqlx::query(&format!(
            "UPDATE {table} SET topic_handle = $1 WHERE {key} = $2 AND topic_handle IS NULL",
            table = subject.kind.table(),
            key = subject.kind.key_column(),
        ))
        .bind(topic.as_str())
        .bind(subject.key)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
