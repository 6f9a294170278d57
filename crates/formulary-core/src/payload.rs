//! Handle-keyed import/export payload.
//!
//! The wire shape is deliberately loose (handles as plain strings, fields as
//! raw JSON scalars) so that one malformed entry fails on its own instead of
//! rejecting the whole document at deserialization time.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::models::{parse_fields, ContentFields};

/// An ordered sequence of entries keyed by handles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Utc>>,
    pub entries: Vec<ImportEntry>,
}

impl ImportPayload {
    pub fn new(entries: Vec<ImportEntry>) -> Self {
        Self {
            exported_at: None,
            entries,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One entity in a payload.
///
/// `entity_type` stays a string on the wire; an unknown type fails this
/// entry in [`validate_entry`] rather than the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportEntry {
    pub entity_type: String,
    pub handle: String,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
    /// Complete link set when present; absent leaves stored links untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_links: Option<Vec<CategoryLinkSpec>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<RelationSpec>,
}

impl ImportEntry {
    pub fn new(entity_type: EntityKind, handle: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.as_str().to_string(),
            handle: handle.into(),
            fields: BTreeMap::new(),
            category_links: None,
            relations: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn category(mut self, discipline_handle: &str, is_primary: bool) -> Self {
        self.category_links.get_or_insert_with(Vec::new).push(CategoryLinkSpec {
            discipline_handle: discipline_handle.to_string(),
            is_primary,
            rank: None,
            notes: None,
        });
        self
    }

    /// Parsed entity type.
    pub fn kind(&self) -> Result<EntityKind> {
        self.entity_type.parse()
    }

    pub fn relation(mut self, relation_type: RelationType, target_handle: &str) -> Self {
        self.relations.push(RelationSpec {
            relation_type: relation_type.as_str().to_string(),
            target_handle: target_handle.to_string(),
        });
        self
    }
}

/// A category link by discipline handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLinkSpec {
    pub discipline_handle: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A non-category relation by target handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub relation_type: String,
    pub target_handle: String,
}

impl RelationSpec {
    pub fn new(relation_type: RelationType, target_handle: impl Into<String>) -> Self {
        Self {
            relation_type: relation_type.as_str().to_string(),
            target_handle: target_handle.into(),
        }
    }

    /// Parsed relation type; an unknown one fails only this relation.
    pub fn relation(&self) -> Result<RelationType> {
        self.relation_type.parse()
    }
}

/// Relations the payload can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    /// Discipline hierarchy parent.
    Parent,
    /// Question belongs to a formula.
    Formula,
    /// Question belongs to a term.
    Term,
    /// Formula builds on another formula.
    Prerequisite,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Formula => "formula",
            Self::Term => "term",
            Self::Prerequisite => "prerequisite",
        }
    }

    /// Kind of the relation's target when attached to `subject`.
    pub fn target_kind(&self, subject: EntityKind) -> Result<EntityKind> {
        match (self, subject) {
            (Self::Parent, EntityKind::Discipline) => Ok(EntityKind::Discipline),
            (Self::Formula, EntityKind::Question) => Ok(EntityKind::Formula),
            (Self::Term, EntityKind::Question) => Ok(EntityKind::Term),
            (Self::Prerequisite, EntityKind::Formula) => Ok(EntityKind::Formula),
            _ => Err(Error::InvalidInput(format!(
                "{} rows cannot carry a '{}' relation",
                subject, self
            ))),
        }
    }

    /// Relations a kind can carry, in export order.
    pub fn for_subject(kind: EntityKind) -> &'static [RelationType] {
        match kind {
            EntityKind::Discipline => &[Self::Parent],
            EntityKind::Question => &[Self::Formula, Self::Term],
            EntityKind::Formula => &[Self::Prerequisite],
            _ => &[],
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "parent" => Ok(Self::Parent),
            "formula" => Ok(Self::Formula),
            "term" => Ok(Self::Term),
            "prerequisite" => Ok(Self::Prerequisite),
            other => Err(Error::InvalidInput(format!("unknown relation type: {}", other))),
        }
    }
}

/// Category link after handle normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedLink {
    pub discipline: Handle,
    pub is_primary: bool,
    pub rank: Option<i32>,
    pub notes: Option<String>,
}

/// An entry that passed entry-level validation.
///
/// Relations are kept raw; a bad relation fails only itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEntry {
    pub index: usize,
    pub kind: EntityKind,
    pub handle: Handle,
    pub fields: ContentFields,
    pub category_links: Option<Vec<ValidatedLink>>,
    pub relations: Vec<RelationSpec>,
}

impl ValidatedEntry {
    pub fn primary(&self) -> Option<&Handle> {
        self.category_links
            .iter()
            .flatten()
            .find(|l| l.is_primary)
            .map(|l| &l.discipline)
    }
}

/// Validate an entry before any write.
pub fn validate_entry(index: usize, entry: &ImportEntry) -> Result<ValidatedEntry> {
    let kind = entry.kind()?;
    let handle = Handle::parse(&entry.handle)?;
    let fields = parse_fields(kind, &entry.fields)?;

    let category_links = match &entry.category_links {
        Some(links) => {
            kind.require_categorized()?;
            Some(validate_links(links)?)
        }
        None => None,
    };

    Ok(ValidatedEntry {
        index,
        kind,
        handle,
        fields,
        category_links,
        relations: entry.relations.clone(),
    })
}

fn validate_links(links: &[CategoryLinkSpec]) -> Result<Vec<ValidatedLink>> {
    let mut seen = HashSet::new();
    let mut category_links = Vec::with_capacity(links.len());
    for link in links {
        let discipline = Handle::parse(&link.discipline_handle)?;
        if !seen.insert(discipline.clone()) {
            return Err(Error::InvalidInput(format!(
                "discipline '{}' linked more than once",
                discipline
            )));
        }
        category_links.push(ValidatedLink {
            discipline,
            is_primary: link.is_primary,
            rank: link.rank,
            notes: link
                .notes
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        });
    }

    let primaries = category_links.iter().filter(|l| l.is_primary).count();
    if primaries > 1 {
        return Err(Error::InvalidInput(format!(
            "{} category links marked primary; at most one is allowed",
            primaries
        )));
    }
    Ok(category_links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn newtons_second_law() -> ImportEntry {
        ImportEntry::new(EntityKind::Formula, "newtons_second_law")
            .field("formula_name", "Newton's Second Law")
            .field("latex", "F = ma")
            .category("classical_mechanics", true)
    }

    #[test]
    fn test_payload_parses_wire_format() {
        let json = json!({
            "entries": [{
                "entity_type": "formula",
                "handle": "newtons_second_law",
                "fields": {"formula_name": "Newton's Second Law", "latex": "F = ma"},
                "category_links": [{"discipline_handle": "classical_mechanics", "is_primary": true, "rank": 1}],
                "relations": [{"relation_type": "prerequisite", "target_handle": "momentum"}]
            }]
        });
        let payload: ImportPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.entries.len(), 1);
        let entry = &payload.entries[0];
        assert_eq!(entry.category_links.as_ref().unwrap()[0].rank, Some(1));
        assert_eq!(entry.relations[0].relation().unwrap(), RelationType::Prerequisite);
    }

    #[test]
    fn test_unknown_types_parse_and_fail_per_entry() {
        let json = json!({
            "entries": [
                {"entity_type": "formula", "handle": "force",
                 "relations": [{"relation_type": "sibling", "target_handle": "momentum"}]},
                {"entity_type": "theorem", "handle": "pythagoras"}
            ]
        });
        let payload = ImportPayload::from_json(&json.to_string()).unwrap();
        assert!(payload.entries[0].relations[0].relation().is_err());
        assert!(validate_entry(0, &payload.entries[0]).is_ok());

        let err = validate_entry(1, &payload.entries[1]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{:?}", err);
    }

    #[test]
    fn test_validate_normalizes_handles() {
        let mut entry = newtons_second_law();
        entry.handle = " Newtons_Second_Law ".into();
        entry.category_links.as_mut().unwrap()[0].discipline_handle =
            "Classical_Mechanics".into();
        let v = validate_entry(0, &entry).unwrap();
        assert_eq!(v.handle.as_str(), "newtons_second_law");
        assert_eq!(v.primary().unwrap().as_str(), "classical_mechanics");
    }

    #[test]
    fn test_validate_rejects_two_primaries() {
        let entry = newtons_second_law().category("physics", true);
        let err = validate_entry(0, &entry).unwrap_err();
        assert!(err.to_string().contains("primary"));
    }

    #[test]
    fn test_validate_rejects_links_on_uncategorized_kind() {
        let entry = ImportEntry::new(EntityKind::Course, "phys_101")
            .field("course_name", "Physics 101")
            .category("physics", false);
        assert!(validate_entry(0, &entry).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_discipline() {
        let entry = newtons_second_law().category("classical_mechanics", false);
        assert!(validate_entry(0, &entry).is_err());
    }

    #[test]
    fn test_absent_links_differ_from_empty_links() {
        let untouched = ImportEntry::new(EntityKind::Term, "union")
            .field("term_name", "Union")
            .field("definition", "A or B");
        let v = validate_entry(0, &untouched).unwrap();
        assert!(v.category_links.is_none());

        let mut cleared = untouched.clone();
        cleared.category_links = Some(Vec::new());
        let v = validate_entry(0, &cleared).unwrap();
        assert_eq!(v.category_links, Some(Vec::new()));
        assert!(v.primary().is_none());
    }

    #[test]
    fn test_relation_target_kinds() {
        assert_eq!(
            RelationType::Parent.target_kind(EntityKind::Discipline).unwrap(),
            EntityKind::Discipline
        );
        assert_eq!(
            RelationType::Term.target_kind(EntityKind::Question).unwrap(),
            EntityKind::Term
        );
        assert!(RelationType::Parent.target_kind(EntityKind::Formula).is_err());
        assert!(RelationType::Prerequisite.target_kind(EntityKind::Term).is_err());
    }

    #[test]
    fn test_serialization_omits_empty_collections() {
        let entry = ImportEntry::new(EntityKind::Topic, "optics").field("topic_name", "Optics");
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("category_links").is_none());
        assert!(json.get("relations").is_none());
    }
}
