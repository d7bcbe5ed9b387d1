//! Observation ingestion: parse raw items, merge them into stored entities.
//!
//! An item is a flat JSON object. `id` and `type` identify the entity, keys
//! starting with `__` are control fields, keys starting with `$` are
//! historical, everything else is an attribute.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::backend::UpsertOutcome;
use crate::config::{HistoryMode, StoreConfig};
use crate::repository::EntityRepository;
use crate::row::{Column, Row};
use crate::time::{ensure_storable, normalize, parse_timestamp};
use crate::{EntityId, HistoryEntry, Result, SpotterError};

const ID_FIELD: &str = "id";
const TYPE_FIELD: &str = "type";
const TIME_FIELDS: [&str; 2] = ["__dt__", "__visited_on__"];
const TTL_FIELD: &str = "__ttl__";
const PARTIAL_FIELD: &str = "__partial_update__";
const CONTROL_PREFIX: &str = "__";
const HISTORY_SIGIL: char = '$';

/// Ages beyond this many seconds (about 31 700 years) are rejected.
const MAX_TTL_SECS: f64 = 1e12;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Overwrites `attributes[key]`.
    Attribute,
    /// Appends `[t, value]` to `history[key]`.
    Historical,
}

impl FieldKind {
    /// Classify an item key. Control fields yield `None`; historical keys are
    /// returned without their `$`.
    pub fn classify(name: &str) -> Option<(FieldKind, &str)> {
        if name == ID_FIELD || name == TYPE_FIELD || name.starts_with(CONTROL_PREFIX) {
            return None;
        }
        match name.strip_prefix(HISTORY_SIGIL) {
            Some(key) if !key.is_empty() => Some((FieldKind::Historical, key)),
            _ => Some((FieldKind::Attribute, name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservedField {
    pub kind: FieldKind,
    pub key: String,
    pub value: JsonValue,
}

/// One validated item.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub external_id: String,
    pub entity_type: String,
    pub partial: bool,
    /// `__dt__`; `None` means "now".
    pub observed_at: Option<DateTime<Utc>>,
    /// `__ttl__`: how old the observation already was at `observed_at`.
    pub age: TimeDelta,
    pub fields: Vec<ObservedField>,
}

impl Observation {
    pub fn from_json(item: &JsonValue) -> Result<Self> {
        let JsonValue::Object(map) = item else {
            return Err(SpotterError::Validation("item must be a JSON object".to_string()));
        };

        let external_id = match map.get(ID_FIELD) {
            Some(JsonValue::String(s)) if !s.is_empty() => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => return Err(SpotterError::Validation("item is missing `id`".to_string())),
        };

        let entity_type = match map.get(TYPE_FIELD) {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            Some(JsonValue::Bool(b)) => b.to_string(),
            Some(_) => {
                return Err(SpotterError::Validation("`type` must be a scalar".to_string()));
            }
        };

        let partial = map.get(PARTIAL_FIELD).is_some_and(truthy);

        let mut observed_at = None;
        for name in TIME_FIELDS {
            match map.get(name) {
                None | Some(JsonValue::Null) => continue,
                Some(JsonValue::String(s)) if s.trim().is_empty() => continue,
                Some(JsonValue::String(s)) => {
                    observed_at = Some(parse_timestamp(s)?);
                    break;
                }
                Some(other) => {
                    return Err(SpotterError::Validation(format!(
                        "`{name}` must be a timestamp string, got {other}"
                    )));
                }
            }
        }

        let age = match map.get(TTL_FIELD) {
            None | Some(JsonValue::Null) => TimeDelta::zero(),
            Some(value) => parse_ttl(value)?,
        };

        let fields = map
            .iter()
            .filter_map(|(name, value)| {
                FieldKind::classify(name).map(|(kind, key)| ObservedField {
                    kind,
                    key: key.to_string(),
                    value: value.clone(),
                })
            })
            .collect();

        Ok(Self {
            external_id,
            entity_type,
            partial,
            observed_at,
            age,
            fields,
        })
    }
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

fn parse_ttl(value: &JsonValue) -> Result<TimeDelta> {
    let secs = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) if s.trim().is_empty() => Some(0.0),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|secs| secs.is_finite() && secs.abs() <= MAX_TTL_SECS)
    .ok_or_else(|| SpotterError::Validation(format!("`{TTL_FIELD}` must be seconds, got {value}")))?;
    Ok(TimeDelta::microseconds((secs * 1_000_000.0).round() as i64))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ItemStatus {
    Created,
    Updated,
    Failed(SpotterError),
}

#[derive(Debug)]
pub struct ItemOutcome {
    /// Position of the item in the submitted batch.
    pub index: usize,
    /// `None` when the item carried no usable id.
    pub external_id: Option<String>,
    pub status: ItemStatus,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl IngestReport {
    pub fn created(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Created))
    }

    pub fn updated(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Updated))
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Failed(_)))
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    fn count(&self, pred: impl Fn(&ItemStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct IngestionEngine<'r> {
    repo: &'r EntityRepository,
    active_window: TimeDelta,
    history_mode: HistoryMode,
}

impl<'r> IngestionEngine<'r> {
    pub fn new(repo: &'r EntityRepository, config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            repo,
            active_window: config.active_window()?,
            history_mode: config.history_mode,
        })
    }

    pub fn ingest(&self, items: &[JsonValue], now: DateTime<Utc>) -> Result<IngestReport> {
        if items.is_empty() {
            return Err(SpotterError::Validation(
                "at least one item is required".to_string(),
            ));
        }
        let now = normalize(now);
        let outcomes = items
            .iter()
            .enumerate()
            .map(|(index, item)| self.ingest_item(index, item, now))
            .collect();
        Ok(IngestReport { outcomes })
    }

    fn ingest_item(&self, index: usize, item: &JsonValue, now: DateTime<Utc>) -> ItemOutcome {
        let result = Observation::from_json(item).and_then(|obs| {
            let outcome = self.merge(&obs, now)?;
            debug!(
                index,
                external_id = %obs.external_id,
                entity_type = %obs.entity_type,
                partial = obs.partial,
                ?outcome,
                "merged observation"
            );
            Ok((obs.external_id, outcome))
        });

        match result {
            Ok((external_id, outcome)) => ItemOutcome {
                index,
                external_id: Some(external_id),
                status: match outcome {
                    UpsertOutcome::Inserted => ItemStatus::Created,
                    UpsertOutcome::Updated => ItemStatus::Updated,
                },
            },
            Err(e) => {
                let external_id = item.get(ID_FIELD).and_then(|v| match v {
                    JsonValue::String(s) => Some(s.clone()),
                    JsonValue::Number(n) => Some(n.to_string()),
                    _ => None,
                });
                warn!(index, external_id = ?external_id, error = %e, "observation rejected");
                ItemOutcome {
                    index,
                    external_id,
                    status: ItemStatus::Failed(e),
                }
            }
        }
    }

    /// Merge one observation into its entity.
    pub fn merge(&self, obs: &Observation, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        let t = obs
            .observed_at
            .map(normalize)
            .unwrap_or(now)
            .checked_sub_signed(obs.age)
            .map(normalize)
            .ok_or_else(|| SpotterError::Validation("observation time out of range".to_string()))
            .and_then(ensure_storable)?;
        let expires_at = t
            .checked_add_signed(self.active_window)
            .ok_or_else(|| SpotterError::Validation("expiry out of range".to_string()))
            .and_then(ensure_storable)?;
        let active = expires_at > now;

        self.repo
            .record(&obs.external_id, &obs.entity_type, |prior| {
                let is_new = prior.is_none();
                let prior = prior.unwrap_or_default();
                let (mut attributes, mut history) = (prior.attributes, prior.history);

                for field in &obs.fields {
                    match field.kind {
                        FieldKind::Attribute => {
                            attributes.insert(field.key.clone(), field.value.clone());
                        }
                        FieldKind::Historical => {
                            let series = history.entry(field.key.clone()).or_default();
                            push_history(series, HistoryEntry(t, field.value.clone()), self.history_mode);
                            // Ordered series also expose their newest value as an attribute.
                            if self.history_mode == HistoryMode::Ordered {
                                if let Some(HistoryEntry(_, latest)) = series.last() {
                                    attributes.insert(field.key.clone(), latest.clone());
                                }
                            }
                        }
                    }
                }

                let mut row = Row::new()
                    .with(Column::LastSeenAt, t)
                    .with(Column::Active, active)
                    .with(Column::ExpiresAt, expires_at)
                    .with(Column::Attributes, JsonValue::Object(attributes));
                if is_new {
                    row.set(Column::InternalId, EntityId::generate()?.0);
                    row.set(Column::FirstSeenAt, t);
                }
                if !obs.partial {
                    row.set(Column::FullyUpdatedAt, t);
                }
                if !history.is_empty() {
                    row.set(Column::History, serde_json::to_value(&history)?);
                }
                Ok(row)
            })
    }
}

fn push_history(series: &mut Vec<HistoryEntry>, entry: HistoryEntry, mode: HistoryMode) {
    match mode {
        HistoryMode::Append => series.push(entry),
        HistoryMode::Ordered => {
            let at = series.partition_point(|existing| existing.0 <= entry.0);
            let repeats_previous = at > 0 && series[at - 1].1 == entry.1;
            let repeats_next = series.get(at).is_some_and(|next| next.1 == entry.1);
            if !repeats_previous && !repeats_next {
                series.insert(at, entry);
            }
        }
    }
}
