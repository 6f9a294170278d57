//! Backfill resolver: derives handles and topics for pre-existing rows.
//!
//! Both passes only touch rows whose target column is still null, so a
//! re-run after partial completion picks up where the last one stopped and
//! a run over a complete table is a no-op.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::handle::{base_handle, HandleAllocator};
use crate::models::{HandleSeed, Subject};
use crate::topic::{TopicMap, TopicSource};
use crate::traits::BackfillStore;

/// Attempts per row before giving up on concurrent handle collisions.
const MAX_HANDLE_ATTEMPTS: usize = 32;

/// Rows touched per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub handles: BTreeMap<EntityKind, u64>,
    pub topics: BTreeMap<EntityKind, u64>,
}

impl BackfillSummary {
    pub fn total(&self) -> u64 {
        self.handles.values().sum::<u64>() + self.topics.values().sum::<u64>()
    }
}

/// Populates null handles and topics.
pub struct BackfillResolver<'a, S: BackfillStore + ?Sized> {
    store: &'a S,
    topics: &'a TopicMap,
}

impl<'a, S: BackfillStore + ?Sized> BackfillResolver<'a, S> {
    pub fn new(store: &'a S, topics: &'a TopicMap) -> Self {
        Self { store, topics }
    }

    /// Backfill handles using the default slug generator.
    pub async fn backfill_handles(&self, kind: EntityKind) -> Result<u64> {
        self.backfill_handles_with(kind, |seed| {
            base_handle(kind, seed.key, &seed.seed_text())
        })
        .await
    }

    /// Backfill handles with a custom base-slug generator.
    ///
    /// The generator proposes a base; collisions with existing handles get
    /// `_2`, `_3`, ... appended.
    pub async fn backfill_handles_with<G>(&self, kind: EntityKind, generator: G) -> Result<u64>
    where
        G: Fn(&HandleSeed) -> String + Send + Sync,
    {
        let start = Instant::now();
        let rows = self.store.rows_missing_handle(kind).await?;
        if rows.is_empty() {
            debug!(
                subsystem = "backfill",
                component = "handles",
                entity_kind = %kind,
                "No rows missing handles"
            );
            return Ok(0);
        }

        let mut allocator = HandleAllocator::with_used(self.store.existing_handles(kind).await?);
        let mut written = 0u64;

        for row in &rows {
            let base = generator(row);
            let mut attempts = 0;
            loop {
                attempts += 1;
                let handle = allocator.allocate(&base)?;
                match self.store.write_handle(kind, row.key, &handle).await {
                    Ok(true) => {
                        if handle.as_str() != base {
                            warn!(
                                subsystem = "backfill",
                                component = "handles",
                                entity_kind = %kind,
                                surrogate_key = row.key,
                                handle = %handle,
                                base = %base,
                                "Handle collision, suffix appended"
                            );
                        } else {
                            trace!(
                                entity_kind = %kind,
                                surrogate_key = row.key,
                                handle = %handle,
                                "Handle assigned"
                            );
                        }
                        written += 1;
                        break;
                    }
                    Ok(false) => {
                        debug!(
                            entity_kind = %kind,
                            surrogate_key = row.key,
                            "Row received a handle concurrently"
                        );
                        break;
                    }
                    Err(Error::HandleConflict { .. }) if attempts < MAX_HANDLE_ATTEMPTS => {
                        // Another writer took this handle after we read the used set.
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            subsystem = "backfill",
            component = "handles",
            op = "backfill_handles",
            entity_kind = %kind,
            result_count = written,
            duration_ms = start.elapsed().as_millis() as u64,
            "Handle backfill complete"
        );
        Ok(written)
    }

    /// Derive the topic of every categorized row that has none.
    ///
    /// Total: rows without a mapped primary discipline get the default topic.
    pub async fn backfill_topic(&self, kind: EntityKind) -> Result<u64> {
        kind.require_categorized()?;
        let start = Instant::now();
        let keys = self.store.rows_missing_topic(kind).await?;
        let mut written = 0u64;
        let mut fallbacks = 0u64;

        for key in keys {
            let subject = Subject::new(kind, key);
            let chain = self.store.primary_discipline_chain(subject).await?;
            let assignment = self.topics.resolve(&chain);
            match &assignment.source {
                TopicSource::Unmapped { discipline } => {
                    warn!(
                        subsystem = "backfill",
                        component = "topics",
                        entity_kind = %kind,
                        surrogate_key = key,
                        discipline = %discipline,
                        topic = %assignment.topic,
                        "Primary discipline has no topic rule, using default topic"
                    );
                    fallbacks += 1;
                }
                TopicSource::NoPrimary => {
                    trace!(entity_kind = %kind, surrogate_key = key, "No primary category");
                    fallbacks += 1;
                }
                TopicSource::Ancestor { via } => {
                    debug!(
                        entity_kind = %kind,
                        surrogate_key = key,
                        via = %via,
                        "Topic resolved through ancestor discipline"
                    );
                }
                TopicSource::Mapped => {}
            }
            if self.store.write_topic(subject, &assignment.topic).await? {
                written += 1;
            }
        }

        info!(
            subsystem = "backfill",
            component = "topics",
            op = "backfill_topic",
            entity_kind = %kind,
            result_count = written,
            fallbacks,
            duration_ms = start.elapsed().as_millis() as u64,
            "Topic backfill complete"
        );
        Ok(written)
    }

    /// Handles of uncategorized kinds, then topics, then handles of
    /// categorized kinds.
    ///
    /// Topic derivation reads discipline handles, and a categorized row must
    /// carry a topic before any other write to it passes the topic check.
    pub async fn backfill_all(&self) -> Result<BackfillSummary> {
        let mut summary = BackfillSummary::default();
        let (categorized, plain): (Vec<_>, Vec<_>) =
            EntityKind::ALL.into_iter().partition(|k| k.is_categorized());
        for kind in plain {
            summary.handles.insert(kind, self.backfill_handles(kind).await?);
        }
        for &kind in &categorized {
            summary.topics.insert(kind, self.backfill_topic(kind).await?);
        }
        for kind in categorized {
            summary.handles.insert(kind, self.backfill_handles(kind).await?);
        }
        Ok(summary)
    }
}
