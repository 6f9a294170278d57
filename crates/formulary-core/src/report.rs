//! Import reports.

use serde::Serialize;

use crate::error::Error;
use crate::models::SurrogateKey;

/// Why an entry or link was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Stored content already matched the payload.
    Unchanged,
    /// The referenced entry failed earlier in the same payload.
    DependencyFailed { handle: String },
}

/// Outcome of one payload entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryOutcome {
    Created { key: SurrogateKey },
    Updated { key: SurrogateKey },
    Skipped { key: SurrogateKey, reason: SkipReason },
    Failed { error_kind: String, message: String },
}

impl EntryOutcome {
    pub fn failed(err: &Error) -> Self {
        Self::Failed {
            error_kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn key(&self) -> Option<SurrogateKey> {
        match self {
            Self::Created { key } | Self::Updated { key } | Self::Skipped { key, .. } => Some(*key),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one category link or relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkOutcome {
    Linked,
    Unchanged,
    Skipped { reason: SkipReason },
    Failed { error_kind: String, message: String },
}

impl LinkOutcome {
    pub fn failed(err: &Error) -> Self {
        Self::Failed {
            error_kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Report line for a category link set or a single relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkReport {
    /// `categories` or the relation type.
    pub relation: String,
    /// Target handle, or the primary discipline for category sets.
    pub target: Option<String>,
    pub outcome: LinkOutcome,
}

/// Report for one payload entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryReport {
    pub index: usize,
    /// As given in the payload, so entries with an unknown type still report.
    pub entity_type: String,
    pub handle: String,
    pub outcome: EntryOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkReport>,
}

/// Payload-level counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub links_failed: usize,
    pub links_skipped: usize,
}

/// Full result of an import run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub entries: Vec<EntryReport>,
    pub summary: ImportSummary,
}

impl ImportReport {
    /// Build a report, ordering entries by payload position and counting outcomes.
    pub fn from_entries(mut entries: Vec<EntryReport>) -> Self {
        entries.sort_by_key(|e| e.index);
        let mut summary = ImportSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            match entry.outcome {
                EntryOutcome::Created { .. } => summary.created += 1,
                EntryOutcome::Updated { .. } => summary.updated += 1,
                EntryOutcome::Skipped { .. } => summary.skipped += 1,
                EntryOutcome::Failed { .. } => summary.failed += 1,
            }
            for link in &entry.links {
                match link.outcome {
                    LinkOutcome::Failed { .. } => summary.links_failed += 1,
                    LinkOutcome::Skipped { .. } => summary.links_skipped += 1,
                    _ => {}
                }
            }
        }
        Self { entries, summary }
    }

    /// True when nothing failed or was skipped for a dependency.
    pub fn is_clean(&self) -> bool {
        self.summary.failed == 0 && self.summary.links_failed == 0 && self.summary.links_skipped == 0
    }

    pub fn entry(&self, handle: &str) -> Option<&EntryReport> {
        self.entries.iter().find(|e| e.handle == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    fn entry(index: usize, outcome: EntryOutcome) -> EntryReport {
        EntryReport {
            index,
            entity_type: "formula".into(),
            handle: format!("f{}", index),
            outcome,
            links: Vec::new(),
        }
    }

    #[test]
    fn test_summary_counts_and_ordering() {
        let mut failed = entry(
            0,
            EntryOutcome::failed(&Error::InvalidInput("bad".into())),
        );
        failed.links.push(LinkReport {
            relation: "prerequisite".into(),
            target: Some("x".into()),
            outcome: LinkOutcome::Skipped {
                reason: SkipReason::DependencyFailed { handle: "x".into() },
            },
        });
        let report = ImportReport::from_entries(vec![
            entry(2, EntryOutcome::Created { key: 1 }),
            failed,
            entry(
                1,
                EntryOutcome::Skipped {
                    key: 3,
                    reason: SkipReason::Unchanged,
                },
            ),
        ]);

        assert_eq!(
            report.entries.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(report.summary.created, 1);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.links_skipped, 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(EntryOutcome::Skipped {
            key: 7,
            reason: SkipReason::Unchanged,
        })
        .unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"]["kind"], "unchanged");
    }

    #[test]
    fn test_failed_outcome_carries_error_kind() {
        let outcome = EntryOutcome::failed(&Error::UnresolvedReference {
            kind: EntityKind::Discipline,
            handle: "optics".into(),
        });
        match outcome {
            EntryOutcome::Failed { error_kind, .. } => {
                assert_eq!(error_kind, "unresolved_reference")
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
