//! PostgreSQL catalog store.
//!
//! `PgCatalog` implements every storage trait of `formulary-core`; the
//! implementations are split by concern across the sibling modules. Each
//! trait method is one transaction. Identifiers spliced into SQL text come
//! from the static `EntityKind` descriptors, never from input.

use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use formulary_core::{
    ContentFields, EntityKind, Error, FieldSpec, FieldType, FieldValue, Handle, RelationType,
    Result, Subject, SurrogateKey,
};

/// PostgreSQL implementation of the catalog storage traits.
#[derive(Clone)]
pub struct PgCatalog {
    pub(crate) pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Build the `HandleConflict` for a unique violation on a handle index,
    /// or pass the database error through when it is something else.
    pub(crate) async fn handle_conflict(
        &self,
        kind: EntityKind,
        handle: &Handle,
        err: sqlx::Error,
    ) -> Error {
        let err = Error::Database(err);
        if !err.is_unique_violation() || err.constraint() != Some(kind.handle_index()) {
            return err;
        }
        match find_by_handle(&self.pool, kind, handle).await {
            Ok(Some(existing)) => Error::HandleConflict {
                kind,
                handle: handle.to_string(),
                existing,
            },
            _ => err,
        }
    }
}

/// Parse a stored handle. Legacy values outside the handle alphabet read as absent.
pub(crate) fn stored_handle(raw: Option<String>) -> Option<Handle> {
    raw.and_then(|h| Handle::parse(&h).ok())
}

/// A handle column compared the way `Handle::parse` reads it, so legacy
/// values with stray case or whitespace still resolve. Backed by the
/// `idx_<kind>_handle_folded` index.
pub(crate) fn folded_handle(column: &str) -> String {
    format!(r"lower(btrim({}, E' \t\n\r'))", column)
}

/// Row holding `handle`, preferring an exact match over a folded one.
pub(crate) fn handle_lookup_sql(kind: EntityKind) -> String {
    format!(
        "SELECT {key}::BIGINT FROM {table} WHERE {folded} = $1 \
         ORDER BY ({handle} = $1) DESC, {key} LIMIT 1",
        key = kind.key_column(),
        table = kind.table(),
        folded = folded_handle(kind.handle_column()),
        handle = kind.handle_column(),
    )
}

pub(crate) async fn find_by_handle<'e, E>(
    executor: E,
    kind: EntityKind,
    handle: &Handle,
) -> Result<Option<SurrogateKey>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>(&handle_lookup_sql(kind))
        .bind(handle.as_str())
        .fetch_optional(executor)
        .await
        .map_err(Error::Database)
}

/// Fail with `NotFound` unless the row exists; with `lock`, hold it `FOR UPDATE`.
pub(crate) async fn require_row(
    tx: &mut Transaction<'_, Postgres>,
    subject: Subject,
    lock: bool,
) -> Result<()> {
    let found = sqlx::query_scalar::<_, i32>(&format!(
        "SELECT 1 FROM {table} WHERE {key} = $1{lock}",
        table = subject.kind.table(),
        key = subject.kind.key_column(),
        lock = if lock { " FOR UPDATE" } else { "" },
    ))
    .bind(subject.key)
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)?;

    found
        .map(|_| ())
        .ok_or_else(|| Error::NotFound(subject.to_string()))
}

/// Create the topic row for `topic` if it does not exist yet.
pub(crate) async fn ensure_topic(tx: &mut Transaction<'_, Postgres>, topic: &Handle) -> Result<()> {
    sqlx::query(
        "INSERT INTO tbl_topic (topic_handle, topic_name) VALUES ($1, $2) \
         ON CONFLICT (topic_handle) WHERE topic_handle IS NOT NULL DO NOTHING",
    )
    .bind(topic.as_str())
    .bind(topic.as_str().replace('_', " "))
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?;
    Ok(())
}

/// Bind a content value with the SQL type of its column.
pub(crate) fn push_field_value(
    qb: &mut QueryBuilder<'_, Postgres>,
    spec: &FieldSpec,
    value: &FieldValue,
) -> Result<()> {
    let mismatch = || {
        Error::InvalidInput(format!(
            "field '{}' expects {:?}, got {:?}",
            spec.name, spec.ty, value
        ))
    };
    match (spec.ty, value) {
        (FieldType::Text, FieldValue::Null) => qb.push_bind(None::<String>),
        (FieldType::Text, FieldValue::Text(s)) => qb.push_bind(Some(s.clone())),
        (FieldType::Integer, FieldValue::Null) => qb.push_bind(None::<i64>),
        (FieldType::Integer, FieldValue::Integer(i)) => qb.push_bind(Some(*i)),
        (FieldType::Float, FieldValue::Null) => qb.push_bind(None::<f64>),
        (FieldType::Float, FieldValue::Float(f)) => qb.push_bind(Some(*f)),
        (FieldType::Boolean, FieldValue::Null) => qb.push_bind(None::<bool>),
        (FieldType::Boolean, FieldValue::Boolean(b)) => qb.push_bind(Some(*b)),
        _ => return Err(mismatch()),
    };
    Ok(())
}

/// Resolve field names to their specs, rejecting anything off the whitelist.
pub(crate) fn field_specs<'f>(
    kind: EntityKind,
    fields: &'f ContentFields,
) -> Result<Vec<(&'static FieldSpec, &'f FieldValue)>> {
    fields
        .iter()
        .map(|(name, value)| {
            kind.field(name)
                .map(|spec| (spec, value))
                .ok_or_else(|| Error::InvalidInput(format!("{} has no field '{}'", kind, name)))
        })
        .collect()
}

/// Decode whitelisted content fields from a `to_jsonb(row)` document.
pub(crate) fn fields_from_doc(kind: EntityKind, doc: &JsonValue) -> Result<ContentFields> {
    let mut fields = ContentFields::new();
    for spec in kind.fields() {
        let raw = doc.get(spec.name).unwrap_or(&JsonValue::Null);
        let value = FieldValue::from_json(spec, raw).map_err(|e| {
            Error::Internal(format!("stored {} field '{}': {}", kind, spec.name, e))
        })?;
        fields.insert(spec.name.to_string(), value);
    }
    Ok(fields)
}

/// Storage of a non-parent relation: (table, subject column, target column).
pub(crate) fn relation_table(
    relation: RelationType,
) -> Option<(&'static str, &'static str, &'static str)> {
    match relation {
        RelationType::Parent => None,
        RelationType::Formula => Some(("tbl_formula_question", "question_id", "formula_id")),
        RelationType::Term => Some(("tbl_term_question", "question_id", "term_id")),
        RelationType::Prerequisite => Some((
            "tbl_formula_prerequisite",
            "formula_id",
            "prerequisite_formula_id",
        )),
    }
}

/// Discipline chain from `$1` upward, nearest first, stopping on a loop.
pub(crate) const ANCESTOR_CHAIN_SQL: &str = r#"
    WITH RECURSIVE chain (id, parent, handle, depth, path) AS (
        SELECT discipline_id::BIGINT, parent_discipline_id::BIGINT, discipline_handle,
               0, ARRAY[discipline_id::BIGINT]
        FROM tbl_discipline
        WHERE discipline_id = $1
        UNION ALL
        SELECT d.discipline_id::BIGINT, d.parent_discipline_id::BIGINT, d.discipline_handle,
               c.depth + 1, c.path || d.discipline_id::BIGINT
        FROM tbl_discipline d
        JOIN chain c ON d.discipline_id = c.parent
        WHERE NOT d.discipline_id = ANY(c.path)
    )
    SELECT id, parent, handle FROM chain ORDER BY depth
"#;
