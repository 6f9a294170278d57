//! Core data models for the catalog.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entity::{EntityKind, FieldSpec, FieldType};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::topic::TopicAssignment;

/// Environment-local integer identity. Never portable across environments.
pub type SurrogateKey = i64;

/// A row of some kind, addressed by its local key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    pub kind: EntityKind,
    pub key: SurrogateKey,
}

impl Subject {
    pub fn new(kind: EntityKind, key: SurrogateKey) -> Self {
        Self { kind, key }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

// =============================================================================
// CONTENT FIELDS
// =============================================================================

/// Scalar value of a content field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce a JSON scalar to the field's declared type.
    ///
    /// Text is trimmed and empty text becomes null; integers also accept
    /// numeric strings.
    pub fn from_json(spec: &FieldSpec, value: &JsonValue) -> Result<Self> {
        let invalid = || {
            Error::InvalidInput(format!(
                "field '{}' expects {:?}, got {}",
                spec.name, spec.ty, value
            ))
        };

        let coerced = match (spec.ty, value) {
            (_, JsonValue::Null) => FieldValue::Null,
            (FieldType::Text, JsonValue::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    FieldValue::Null
                } else {
                    FieldValue::Text(trimmed.to_string())
                }
            }
            (FieldType::Text, JsonValue::Number(n)) => FieldValue::Text(n.to_string()),
            (FieldType::Integer, JsonValue::Number(n)) => {
                FieldValue::Integer(n.as_i64().ok_or_else(invalid)?)
            }
            (FieldType::Integer, JsonValue::String(s)) => {
                FieldValue::Integer(s.trim().parse().map_err(|_| invalid())?)
            }
            (FieldType::Float, JsonValue::Number(n)) => {
                FieldValue::Float(n.as_f64().ok_or_else(invalid)?)
            }
            (FieldType::Boolean, JsonValue::Bool(b)) => FieldValue::Boolean(*b),
            _ => return Err(invalid()),
        };

        if let (Some(allowed), FieldValue::Text(s)) = (spec.allowed, &coerced) {
            if !allowed.contains(&s.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "field '{}' must be one of: {}",
                    spec.name,
                    allowed.join(", ")
                )));
            }
        }

        Ok(coerced)
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Boolean(b) => JsonValue::Bool(*b),
            FieldValue::Integer(i) => JsonValue::from(*i),
            FieldValue::Float(f) => JsonValue::from(*f),
            FieldValue::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

/// Content fields keyed by column name.
pub type ContentFields = BTreeMap<String, FieldValue>;

/// Validate raw payload fields against a kind's whitelist.
pub fn parse_fields(
    kind: EntityKind,
    raw: &BTreeMap<String, JsonValue>,
) -> Result<ContentFields> {
    let mut fields = ContentFields::new();
    for (name, value) in raw {
        let spec = kind.field(name).ok_or_else(|| {
            Error::InvalidInput(format!("{} has no field '{}'", kind, name))
        })?;
        fields.insert(name.clone(), FieldValue::from_json(spec, value)?);
    }
    Ok(fields)
}

/// Required fields missing (absent or null) from a set destined for a new row.
pub fn missing_required(kind: EntityKind, fields: &ContentFields) -> Vec<&'static str> {
    kind.fields()
        .iter()
        .filter(|spec| spec.required)
        .filter(|spec| fields.get(spec.name).map_or(true, FieldValue::is_null))
        .map(|spec| spec.name)
        .collect()
}

// =============================================================================
// CATEGORY LINKS
// =============================================================================

/// Association between a subject (formula or term) and a discipline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryLink {
    pub discipline_id: SurrogateKey,
    pub discipline_handle: Option<Handle>,
    pub is_primary: bool,
    pub rank: Option<i32>,
    pub notes: Option<String>,
}

/// Category link with its discipline already resolved to a local key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCategoryLink {
    pub discipline_id: SurrogateKey,
    pub is_primary: bool,
    pub rank: Option<i32>,
    pub notes: Option<String>,
}

/// The complete category state an import wants for one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct CategorySet {
    pub links: Vec<ResolvedCategoryLink>,
    pub primary: Option<SurrogateKey>,
}

impl CategorySet {
    pub fn new(links: Vec<ResolvedCategoryLink>) -> Self {
        let primary = links
            .iter()
            .filter(|l| l.is_primary)
            .map(|l| l.discipline_id)
            .last();
        Self { links, primary }
    }

    /// True if `current` already holds exactly these links and this primary.
    pub fn matches(&self, current: &[CategoryLink]) -> bool {
        let mut have: Vec<_> = current
            .iter()
            .map(|l| (l.discipline_id, l.is_primary, l.rank, l.notes.clone()))
            .collect();
        let mut want: Vec<_> = self
            .links
            .iter()
            .map(|l| {
                let is_primary = self.primary == Some(l.discipline_id);
                (l.discipline_id, is_primary, l.rank, l.notes.clone())
            })
            .collect();
        have.sort();
        want.sort();
        have == want
    }
}

/// Result of one atomic category-and-topic write.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryWrite {
    pub links_changed: bool,
    pub topic: TopicAssignment,
    pub topic_changed: bool,
}

// =============================================================================
// ENROLLMENT-SCOPED LINKS
// =============================================================================

/// Kind of course segment a linked item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    Chapter,
    Module,
    Examination,
}

impl SegmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chapter => "chapter",
            Self::Module => "module",
            Self::Examination => "examination",
        }
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "chapter" => Ok(Self::Chapter),
            "module" => Ok(Self::Module),
            "examination" => Ok(Self::Examination),
            other => Err(Error::InvalidInput(format!(
                "segment_type must be chapter, module or examination, got '{}'",
                other
            ))),
        }
    }
}

/// Optional segment classification on a course link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSegment {
    pub segment_type: Option<SegmentType>,
    pub segment_label: Option<String>,
}

impl CourseSegment {
    /// Build a segment; the label is trimmed and an empty label becomes `None`.
    pub fn new(segment_type: Option<SegmentType>, label: Option<&str>) -> Self {
        Self {
            segment_type,
            segment_label: label
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        }
    }
}

/// A (user, course, item) link valid only under an existing enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentLink {
    pub user_id: SurrogateKey,
    pub course_id: SurrogateKey,
    pub item: Subject,
    pub segment: CourseSegment,
}

// =============================================================================
// ROWS
// =============================================================================

/// A catalog row as seen by exports and the in-memory store.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    pub key: SurrogateKey,
    pub handle: Option<Handle>,
    pub fields: ContentFields,
    pub topic_handle: Option<Handle>,
}

/// A row still lacking a handle, with the text used to seed one.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleSeed {
    pub key: SurrogateKey,
    /// Display name (or stem for questions).
    pub name: Option<String>,
    /// Part label of multipart question parts.
    pub part_label: Option<String>,
    pub multipart: bool,
}

impl HandleSeed {
    pub fn named(key: SurrogateKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: Some(name.into()),
            part_label: None,
            multipart: false,
        }
    }

    /// Seed text for slugging; multipart parts are prefixed with their label.
    pub fn seed_text(&self) -> String {
        let name = self.name.as_deref().unwrap_or("");
        match (&self.part_label, self.multipart) {
            (Some(label), true) if !label.trim().is_empty() => format!("{}_{}", label, name),
            _ => name.to_string(),
        }
    }
}
