//! Catalog entity kinds and their storage descriptors.
//!
//! Every kind carries a fixed descriptor: table, surrogate key column,
//! handle column, the column used to seed handle slugs, and the whitelist
//! of content fields accepted by imports. Identifiers returned here are
//! static and safe to splice into SQL text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scalar type of a content field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
}

/// A whitelisted content field of an entity kind.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Column name, also the key used in import payloads.
    pub name: &'static str,
    pub ty: FieldType,
    /// Must be present and non-null when the row is created.
    pub required: bool,
    /// Closed set of accepted text values, if constrained.
    pub allowed: Option<&'static [&'static str]>,
}

const fn text(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        ty: FieldType::Text,
        required: false,
        allowed: None,
    }
}

const fn required_text(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        ty: FieldType::Text,
        required: true,
        allowed: None,
    }
}

const fn integer(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        ty: FieldType::Integer,
        required: false,
        allowed: None,
    }
}

/// Accepted values of `tbl_question.question_type`.
pub const QUESTION_TYPES: &[&str] = &["multiple_choice", "true_false", "word_problem", "multipart"];

const FORMULA_FIELDS: &[FieldSpec] = &[
    required_text("formula_name"),
    required_text("latex"),
    text("formula_description"),
    text("english_verbalization"),
    text("symbolic_verbalization"),
    text("units"),
    text("example"),
    text("historical_context"),
    integer("display_order"),
];

const TERM_FIELDS: &[FieldSpec] = &[
    required_text("term_name"),
    required_text("definition"),
    text("formulaic_expression"),
    integer("display_order"),
];

const QUESTION_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "question_type",
        ty: FieldType::Text,
        required: true,
        allowed: Some(QUESTION_TYPES),
    },
    required_text("stem"),
    text("explanation"),
    text("part_label"),
    integer("display_order"),
];

const COURSE_FIELDS: &[FieldSpec] = &[
    required_text("course_name"),
    text("course_code"),
    text("course_description"),
];

const DISCIPLINE_FIELDS: &[FieldSpec] = &[
    required_text("discipline_name"),
    text("discipline_description"),
];

const TOPIC_FIELDS: &[FieldSpec] = &[required_text("topic_name"), text("topic_description")];

const CONSTANT_FIELDS: &[FieldSpec] = &[
    required_text("constant_name"),
    text("symbol"),
    text("value_text"),
    text("description"),
    integer("display_order"),
];

const UNIT_FIELDS: &[FieldSpec] = &[
    required_text("unit_name"),
    text("symbol"),
    text("unit_system"),
    text("description"),
    integer("display_order"),
];

/// Kind of catalog entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Formula,
    Term,
    Question,
    Course,
    Discipline,
    Topic,
    Constant,
    Unit,
}

impl EntityKind {
    /// All kinds, in the order backfills and exports visit them.
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Discipline,
        EntityKind::Topic,
        EntityKind::Formula,
        EntityKind::Term,
        EntityKind::Question,
        EntityKind::Course,
        EntityKind::Constant,
        EntityKind::Unit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Formula => "formula",
            Self::Term => "term",
            Self::Question => "question",
            Self::Course => "course",
            Self::Discipline => "discipline",
            Self::Topic => "topic",
            Self::Constant => "constant",
            Self::Unit => "unit",
        }
    }

    /// Table holding rows of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Formula => "tbl_formula",
            Self::Term => "tbl_term",
            Self::Question => "tbl_question",
            Self::Course => "tbl_course",
            Self::Discipline => "tbl_discipline",
            Self::Topic => "tbl_topic",
            Self::Constant => "tbl_constant",
            Self::Unit => "tbl_unit",
        }
    }

    /// Surrogate key column.
    pub fn key_column(&self) -> &'static str {
        match self {
            Self::Formula => "formula_id",
            Self::Term => "term_id",
            Self::Question => "question_id",
            Self::Course => "course_id",
            Self::Discipline => "discipline_id",
            Self::Topic => "topic_id",
            Self::Constant => "constant_id",
            Self::Unit => "unit_id",
        }
    }

    /// Handle column.
    pub fn handle_column(&self) -> &'static str {
        match self {
            Self::Formula => "formula_handle",
            Self::Term => "term_handle",
            Self::Question => "question_handle",
            Self::Course => "course_handle",
            Self::Discipline => "discipline_handle",
            Self::Topic => "topic_handle",
            Self::Constant => "constant_handle",
            Self::Unit => "unit_handle",
        }
    }

    /// Name of the sparse unique index over the handle column.
    pub fn handle_index(&self) -> &'static str {
        match self {
            Self::Formula => "uq_formula_handle",
            Self::Term => "uq_term_handle",
            Self::Question => "uq_question_handle",
            Self::Course => "uq_course_handle",
            Self::Discipline => "uq_discipline_handle",
            Self::Topic => "uq_topic_handle",
            Self::Constant => "uq_constant_handle",
            Self::Unit => "uq_unit_handle",
        }
    }

    /// Column whose text seeds generated handles.
    pub fn seed_column(&self) -> &'static str {
        match self {
            Self::Question => "stem",
            _ => self.fields()[0].name,
        }
    }

    /// Maximum slug length used when generating handles.
    pub fn slug_max_len(&self) -> usize {
        match self {
            Self::Question => 100,
            _ => 80,
        }
    }

    /// Whitelisted content fields.
    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            Self::Formula => FORMULA_FIELDS,
            Self::Term => TERM_FIELDS,
            Self::Question => QUESTION_FIELDS,
            Self::Course => COURSE_FIELDS,
            Self::Discipline => DISCIPLINE_FIELDS,
            Self::Topic => TOPIC_FIELDS,
            Self::Constant => CONSTANT_FIELDS,
            Self::Unit => UNIT_FIELDS,
        }
    }

    /// Look up a content field by name.
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// Whether rows of this kind carry category links and a derived topic.
    pub fn is_categorized(&self) -> bool {
        matches!(self, Self::Formula | Self::Term)
    }

    /// Category link table and its column prefix, for categorized kinds.
    pub fn category_link_table(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Formula => Some(("tbl_formula_discipline", "formula_discipline")),
            Self::Term => Some(("tbl_term_discipline", "term_discipline")),
            _ => None,
        }
    }

    /// Enrollment-scoped course link table, for kinds that can be attached to courses.
    pub fn course_link_table(&self) -> Option<&'static str> {
        match self {
            Self::Formula => Some("tbl_user_course_formula"),
            Self::Term => Some("tbl_user_course_term"),
            _ => None,
        }
    }

    /// Fail with `InvalidInput` unless the kind carries category links.
    pub fn require_categorized(&self) -> Result<()> {
        if self.is_categorized() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "{} rows do not carry category links",
                self
            )))
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "formula" => Ok(Self::Formula),
            "term" => Ok(Self::Term),
            "question" => Ok(Self::Question),
            "course" => Ok(Self::Course),
            "discipline" => Ok(Self::Discipline),
            "topic" => Ok(Self::Topic),
            "constant" => Ok(Self::Constant),
            "unit" => Ok(Self::Unit),
            other => Err(Error::InvalidInput(format!("unknown entity type: {}", other))),
        }
    }
}
