//! Backend-neutral filter predicates.
//!
//! The query translator and the repository build a [`Predicate`] tree; each
//! backend lowers it on its own terms. `SqliteBackend` turns it into
//! parameterized SQL, `EmbeddedBackend` evaluates it with [`Predicate::matches`].
//! Caller-supplied values only ever live in [`Cell`]s, never in query text.

use std::cmp::Ordering;

use serde_json::Value as JsonValue;

use crate::row::{Cell, Column, Row};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    Gt,
}

impl CmpOp {
    pub fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Gt => ord == Ordering::Greater,
        }
    }
}

/// Left-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(Column),
    /// Top-level key of the `attributes` object, compared by its text rendering.
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row.
    True,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare {
        operand: Operand,
        op: CmpOp,
        value: Cell,
    },
    IsTrue(Column),
}

impl Predicate {
    pub fn column(column: Column, op: CmpOp, value: impl Into<Cell>) -> Self {
        Predicate::Compare {
            operand: Operand::Column(column),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: Column, value: impl Into<Cell>) -> Self {
        Self::column(column, CmpOp::Eq, value)
    }

    pub fn attribute_eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Compare {
            operand: Operand::Attribute(key.into()),
            op: CmpOp::Eq,
            value: Cell::Text(value.into()),
        }
    }

    /// Conjunction that collapses trivial cases.
    pub fn all(mut parts: Vec<Predicate>) -> Self {
        parts.retain(|p| *p != Predicate::True);
        match parts.len() {
            0 => Predicate::True,
            1 => parts.remove(0),
            _ => Predicate::And(parts),
        }
    }

    /// Disjunction. An empty disjunction matches nothing.
    pub fn any(mut parts: Vec<Predicate>) -> Self {
        match parts.len() {
            1 => parts.remove(0),
            _ => Predicate::Or(parts),
        }
    }

    /// Equality on every cell of `key`, ANDed.
    pub fn matching_row(key: &Row) -> Self {
        Self::all(
            key.iter()
                .map(|(column, cell)| Predicate::eq(column, cell.clone()))
                .collect(),
        )
    }

    /// Evaluate against a decoded row. `NULL` and absent values never match
    /// a comparison, as in SQL.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::True => true,
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
            Predicate::IsTrue(column) => row.bool(*column) == Some(true),
            Predicate::Compare {
                operand: Operand::Column(column),
                op,
                value,
            } => row
                .get(*column)
                .and_then(|cell| compare_cells(cell, value))
                .is_some_and(|ord| op.accepts(ord)),
            Predicate::Compare {
                operand: Operand::Attribute(key),
                op,
                value,
            } => {
                let Some(expected) = value.as_text() else {
                    return false;
                };
                row.json(Column::Attributes)
                    .and_then(|attrs| attrs.get(key))
                    .and_then(attribute_text)
                    .is_some_and(|actual| op.accepts(actual.as_str().cmp(expected)))
            }
        }
    }
}

fn compare_cells(a: &Cell, b: &Cell) -> Option<Ordering> {
    match (a, b) {
        (Cell::Text(x), Cell::Text(y)) => Some(x.cmp(y)),
        (Cell::Time(x), Cell::Time(y)) => Some(x.cmp(y)),
        (Cell::Bool(x), Cell::Bool(y)) => Some(x.cmp(y)),
        (Cell::Json(x), Cell::Json(y)) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

/// Text form of an attribute value used for filter comparisons.
///
/// Strings compare as themselves, numbers by their JSON text, booleans as
/// `true`/`false`, objects and arrays as compact JSON. `null` has no text form.
pub fn attribute_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
