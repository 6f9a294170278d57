//! Handle registry over the per-kind sparse unique handle columns.

use async_trait::async_trait;
use tracing::info;

use formulary_core::{EntityKind, Error, Handle, HandleRegistry, Result, Subject, SurrogateKey};

use crate::catalog::{find_by_handle, handle_lookup_sql, stored_handle, PgCatalog};

#[async_trait]
impl HandleRegistry for PgCatalog {
    async fn assign_handle(
        &self,
        kind: EntityKind,
        key: SurrogateKey,
        proposed: &Handle,
    ) -> Result<Handle> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let current: Option<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT {handle} FROM {table} WHERE {key} = $1 FOR UPDATE",
            handle = kind.handle_column(),
            table = kind.table(),
            key = kind.key_column(),
        ))
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        match current {
            None => return Err(Error::NotFound(Subject::new(kind, key).to_string())),
            Some(Some(current)) if !current.trim().is_empty() => {
                if stored_handle(Some(current.clone())).as_ref() == Some(proposed) {
                    return Ok(proposed.clone());
                }
                return Err(Error::HandleImmutable {
                    kind,
                    key,
                    current,
                });
            }
            Some(_) => {}
        }

        if let Some(existing) = find_by_handle(&mut *tx, kind, proposed).await? {
            return Err(Error::HandleConflict {
                kind,
                handle: proposed.to_string(),
                existing,
            });
        }

        let updated = sqlx::query(&format!(
            "UPDATE {table} SET {handle} = $1 WHERE {key} = $2",
            table = kind.table(),
            handle = kind.handle_column(),
            key = kind.key_column(),
        ))
        .bind(proposed.as_str())
        .bind(key)
        .execute(&mut *tx)
        .await;

        if let Err(e) = updated {
            drop(tx);
            return Err(self.handle_conflict(kind, proposed, e).await);
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok(proposed.clone())
    }

    async fn resolve(&self, kind: EntityKind, handle: &Handle) -> Result<Option<SurrogateKey>> {
        find_by_handle(&self.pool, kind, handle).await
    }

    async fn handle_of(&self, kind: EntityKind, key: SurrogateKey) -> Result<Option<Handle>> {
        let raw: Option<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT {handle} FROM {table} WHERE {key} = $1",
            handle = kind.handle_column(),
            table = kind.table(),
            key = kind.key_column(),
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(stored_handle(raw.flatten()))
    }

    async fn rename_handle(
        &self,
        kind: EntityKind,
        old: &Handle,
        new: &Handle,
    ) -> Result<SurrogateKey> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let lookup = format!("{} FOR UPDATE", handle_lookup_sql(kind));
        let key: Option<i64> = sqlx::query_scalar(&lookup)
            .bind(old.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let key = key.ok_or_else(|| Error::NotFound(format!("{} handle '{}'", kind, old)))?;
        if old == new {
            return Ok(key);
        }

        let renamed = sqlx::query(&format!(
            "UPDATE {table} SET {handle} = $1 WHERE {key} = $2",
            table = kind.table(),
            handle = kind.handle_column(),
            key = kind.key_column(),
        ))
        .bind(new.as_str())
        .bind(key)
        .execute(&mut *tx)
        .await;

        if let Err(e) = renamed {
            drop(tx);
            return Err(self.handle_conflict(kind, new, e).await);
        }
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "catalog",
            component = "handles",
            op = "rename_handle",
            entity_kind = %kind,
            surrogate_key = key,
            old = %old,
            handle = %new,
            "Handle renamed"
        );
        Ok(key)
    }
}
