//! Filter parameters to [`Predicate`].
//!
//! Reserved keys address entity columns; every other key is an exact match
//! on the text form of a top-level attribute. Keys are ANDed, the values of
//! an array parameter are ORed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::predicate::{attribute_text, CmpOp, Predicate};
use crate::row::Column;
use crate::time::parse_timestamp;
use crate::{Result, SpotterError};

/// A single value or a list of alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    One(String),
    Many(Vec<String>),
}

impl ParamValue {
    /// Read a parameter from a JSON request. Scalars become `One` (numbers and
    /// booleans in their JSON text), arrays become `Many` with nulls dropped,
    /// `null` becomes an empty `Many`.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Array(items) => {
                ParamValue::Many(items.iter().filter_map(attribute_text).collect())
            }
            JsonValue::Null => ParamValue::Many(Vec::new()),
            other => ParamValue::One(attribute_text(other).unwrap_or_default()),
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            ParamValue::One(v) => std::slice::from_ref(v),
            ParamValue::Many(vs) => vs,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::One(v.to_string())
    }
}

impl From<Vec<&str>> for ParamValue {
    fn from(vs: Vec<&str>) -> Self {
        ParamValue::Many(vs.into_iter().map(String::from).collect())
    }
}

pub type FilterParams = BTreeMap<String, ParamValue>;

/// Build the predicate for `params`. `now` anchors the `active` filter.
pub fn translate(params: &FilterParams, now: DateTime<Utc>) -> Result<Predicate> {
    let mut clauses = Vec::with_capacity(params.len());
    for (key, value) in params {
        let clause = match key.as_str() {
            "seen_before" | "seenBefore" => {
                Predicate::column(Column::FirstSeenAt, CmpOp::Lt, bound(key, value)?)
            }
            "seen_after" | "seenAfter" => {
                Predicate::column(Column::FirstSeenAt, CmpOp::Gt, bound(key, value)?)
            }
            "active" => Predicate::all(vec![
                Predicate::IsTrue(Column::Active),
                Predicate::column(Column::ExpiresAt, CmpOp::Gt, now),
            ]),
            "id" => any_of(value, |v| Predicate::eq(Column::ExternalId, v)),
            "type" => any_of(value, |v| Predicate::eq(Column::EntityType, v)),
            attribute => any_of(value, |v| Predicate::attribute_eq(attribute, v)),
        };
        clauses.push(clause);
    }
    Ok(Predicate::all(clauses))
}

fn bound(key: &str, value: &ParamValue) -> Result<DateTime<Utc>> {
    match value.values() {
        [single] => parse_timestamp(single),
        _ => Err(SpotterError::Validation(format!(
            "`{key}` takes exactly one timestamp"
        ))),
    }
}

fn any_of(value: &ParamValue, clause: impl Fn(&str) -> Predicate) -> Predicate {
    match value {
        ParamValue::One(v) => clause(v),
        ParamValue::Many(vs) if vs.is_empty() => Predicate::True,
        ParamValue::Many(vs) => Predicate::any(vs.iter().map(|v| clause(v)).collect()),
    }
}
