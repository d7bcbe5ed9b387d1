//! Typed columns and rows exchanged with a [`StorageBackend`].
//!
//! Backends never see entity semantics: they move [`Row`]s of typed
//! [`Cell`]s keyed by [`Column`]. The repository and the ingestion engine
//! assemble and decode those rows.
//!
//! [`StorageBackend`]: crate::backend::StorageBackend

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::time::{format_timestamp, parse_stored_timestamp};
use crate::{Result, SpotterError};

/// Storage representation of a column's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Json,
    Timestamp,
    Boolean,
}

/// Every column of the entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    InternalId,
    EntityType,
    ExternalId,
    Attributes,
    History,
    FirstSeenAt,
    LastSeenAt,
    FullyUpdatedAt,
    Active,
    ExpiresAt,
}

impl Column {
    pub const ALL: [Column; 10] = [
        Column::InternalId,
        Column::EntityType,
        Column::ExternalId,
        Column::Attributes,
        Column::History,
        Column::FirstSeenAt,
        Column::LastSeenAt,
        Column::FullyUpdatedAt,
        Column::Active,
        Column::ExpiresAt,
    ];

    /// Column name as it appears in the persisted schema.
    pub fn name(self) -> &'static str {
        match self {
            Column::InternalId => "internal_id",
            Column::EntityType => "entity_type",
            Column::ExternalId => "external_id",
            Column::Attributes => "attributes",
            Column::History => "history",
            Column::FirstSeenAt => "first_seen_at",
            Column::LastSeenAt => "last_seen_at",
            Column::FullyUpdatedAt => "fully_updated_at",
            Column::Active => "active",
            Column::ExpiresAt => "expires_at",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn kind(self) -> ColumnKind {
        match self {
            Column::InternalId | Column::EntityType | Column::ExternalId => ColumnKind::Text,
            Column::Attributes | Column::History => ColumnKind::Json,
            Column::FirstSeenAt
            | Column::LastSeenAt
            | Column::FullyUpdatedAt
            | Column::ExpiresAt => ColumnKind::Timestamp,
            Column::Active => ColumnKind::Boolean,
        }
    }

    /// Written on insert only. Backends skip these columns on update.
    pub fn is_immutable(self) -> bool {
        matches!(self, Column::InternalId | Column::FirstSeenAt)
    }
}

impl std::fmt::Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Bool(bool),
    Time(DateTime<Utc>),
    Json(JsonValue),
}

impl Cell {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Cell::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Encode for the embedded backend's JSON row format.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Cell::Null => JsonValue::Null,
            Cell::Text(s) => JsonValue::String(s.clone()),
            Cell::Bool(b) => JsonValue::Bool(*b),
            Cell::Time(t) => JsonValue::String(format_timestamp(*t)),
            Cell::Json(v) => v.clone(),
        }
    }

    /// Decode a JSON-encoded cell according to the column's kind.
    pub fn from_json(column: Column, value: JsonValue) -> Result<Self> {
        let mismatch = |v: &JsonValue| {
            SpotterError::Storage(format!("column {column}: unexpected stored value {v}"))
        };
        match (column.kind(), value) {
            (_, JsonValue::Null) => Ok(Cell::Null),
            (ColumnKind::Json, v) => Ok(Cell::Json(v)),
            (ColumnKind::Text, JsonValue::String(s)) => Ok(Cell::Text(s)),
            (ColumnKind::Boolean, JsonValue::Bool(b)) => Ok(Cell::Bool(b)),
            (ColumnKind::Timestamp, JsonValue::String(s)) => {
                Ok(Cell::Time(parse_stored_timestamp(&s)?))
            }
            (_, other) => Err(mismatch(&other)),
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}
impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}
impl From<bool> for Cell {
    fn from(b: bool) -> Self {
        Cell::Bool(b)
    }
}
impl From<DateTime<Utc>> for Cell {
    fn from(t: DateTime<Utc>) -> Self {
        Cell::Time(t)
    }
}
impl From<JsonValue> for Cell {
    fn from(v: JsonValue) -> Self {
        Cell::Json(v)
    }
}

/// An ordered set of column values. Absent columns are "not supplied",
/// which is different from a present [`Cell::Null`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: BTreeMap<Column, Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: Column, cell: impl Into<Cell>) -> Self {
        self.set(column, cell);
        self
    }

    pub fn set(&mut self, column: Column, cell: impl Into<Cell>) {
        self.cells.insert(column, cell.into());
    }

    pub fn get(&self, column: Column) -> Option<&Cell> {
        self.cells.get(&column)
    }

    pub fn contains(&self, column: Column) -> bool {
        self.cells.contains_key(&column)
    }

    pub fn columns(&self) -> impl Iterator<Item = Column> + '_ {
        self.cells.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Column, &Cell)> {
        self.cells.iter().map(|(c, v)| (*c, v))
    }

    pub fn text(&self, column: Column) -> Option<&str> {
        self.get(column).and_then(Cell::as_text)
    }

    pub fn time(&self, column: Column) -> Option<DateTime<Utc>> {
        self.get(column).and_then(Cell::as_time)
    }

    pub fn bool(&self, column: Column) -> Option<bool> {
        self.get(column).and_then(Cell::as_bool)
    }

    /// JSON column content; `Null` and absent both read as `None`.
    pub fn json(&self, column: Column) -> Option<&JsonValue> {
        match self.get(column) {
            Some(Cell::Json(v)) if !v.is_null() => Some(v),
            _ => None,
        }
    }

    /// Restrict to the requested columns, in request order.
    pub fn project(&self, columns: &[Column]) -> Row {
        let mut out = Row::new();
        for &c in columns {
            if let Some(cell) = self.cells.get(&c) {
                out.set(c, cell.clone());
            }
        }
        out
    }

    /// Text-encoded JSON object keyed by column name.
    pub fn to_json(&self) -> JsonValue {
        let map = self
            .cells
            .iter()
            .map(|(c, v)| (c.name().to_string(), v.to_json()))
            .collect();
        JsonValue::Object(map)
    }

    pub fn from_json(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(map) = value else {
            return Err(SpotterError::Storage(
                "stored row is not a JSON object".to_string(),
            ));
        };
        let mut row = Row::new();
        for (name, v) in map {
            let column = Column::from_name(&name)
                .ok_or_else(|| SpotterError::Storage(format!("unknown stored column {name}")))?;
            row.set(column, Cell::from_json(column, v)?);
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn column_names_round_trip() {
        for c in Column::ALL {
            assert_eq!(Column::from_name(c.name()), Some(c));
        }
        assert_eq!(Column::from_name("uuid"), None);
    }

    #[test]
    fn only_identity_of_creation_is_immutable() {
        let immutable: Vec<Column> = Column::ALL
            .into_iter()
            .filter(|c| c.is_immutable())
            .collect();
        assert_eq!(immutable, vec![Column::InternalId, Column::FirstSeenAt]);
    }

    #[test]
    fn stored_row_decodes_by_column_kind() {
        let row = Row::new()
            .with(Column::ExternalId, "x1")
            .with(Column::Active, true)
            .with(Column::LastSeenAt, dt("2024-01-01T00:00:00Z"))
            .with(Column::Attributes, json!({"title": "Hello"}))
            .with(Column::FullyUpdatedAt, Cell::Null);

        let decoded = Row::from_json(row.to_json()).unwrap();
        assert_eq!(decoded, row);
        assert_eq!(decoded.text(Column::ExternalId), Some("x1"));
        assert_eq!(decoded.bool(Column::Active), Some(true));
        assert!(decoded.json(Column::FullyUpdatedAt).is_none());
    }

    #[test]
    fn mistyped_stored_value_is_a_storage_error() {
        let err = Row::from_json(json!({"active": "yes"})).unwrap_err();
        assert!(matches!(err, SpotterError::Storage(_)), "got {err:?}");
    }

    #[test]
    fn project_keeps_only_requested_columns() {
        let row = Row::new()
            .with(Column::ExternalId, "x1")
            .with(Column::EntityType, "page")
            .with(Column::Active, false);
        let p = row.project(&[Column::Active, Column::InternalId]);
        assert_eq!(p.columns().collect::<Vec<_>>(), vec![Column::Active]);
    }
}
