//! Entity-level access to a [`StorageBackend`]: identity lookups,
//! existence checks, and listing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::backend::{StorageBackend, UpsertOutcome};
use crate::predicate::{CmpOp, Predicate};
use crate::row::{Column, Row};
use crate::{Attributes, EntitySnapshot, EntityState, History, Result, SpotterError};

/// Columns the merge step needs from an existing row.
const STATE_COLUMNS: [Column; 3] = [Column::FirstSeenAt, Column::Attributes, Column::History];

const SNAPSHOT_COLUMNS: [Column; 9] = [
    Column::ExternalId,
    Column::EntityType,
    Column::FirstSeenAt,
    Column::LastSeenAt,
    Column::FullyUpdatedAt,
    Column::ExpiresAt,
    Column::Active,
    Column::Attributes,
    Column::History,
];

pub struct EntityRepository {
    backend: Box<dyn StorageBackend>,
}

impl EntityRepository {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Predicate selecting exactly the entity `(entity_type, external_id)`.
    pub fn identity(external_id: &str, entity_type: &str) -> Predicate {
        Predicate::all(vec![
            Predicate::eq(Column::ExternalId, external_id),
            Predicate::eq(Column::EntityType, entity_type),
        ])
    }

    pub fn find_by_identity(
        &self,
        external_id: &str,
        entity_type: &str,
    ) -> Result<Option<EntityState>> {
        self.backend
            .fetch_one(&STATE_COLUMNS, &Self::identity(external_id, entity_type))?
            .map(|row| EntityState::from_row(&row))
            .transpose()
    }

    pub fn exists(
        &self,
        external_id: &str,
        entity_type: &str,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let predicate = Predicate::all(vec![
            Self::identity(external_id, entity_type),
            updated_after_clause(updated_after),
        ]);
        Ok(self.backend.count(&predicate)? > 0)
    }

    /// One map entry per requested id, resolved with a single fetch.
    pub fn exists_batch(
        &self,
        external_ids: &[String],
        entity_type: &str,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, bool>> {
        let mut found: BTreeMap<String, bool> = external_ids
            .iter()
            .map(|id| (id.clone(), false))
            .collect();
        if found.is_empty() {
            return Ok(found);
        }

        let predicate = Predicate::all(vec![
            Predicate::eq(Column::EntityType, entity_type),
            Predicate::any(
                found
                    .keys()
                    .map(|id| Predicate::eq(Column::ExternalId, id.as_str()))
                    .collect(),
            ),
            updated_after_clause(updated_after),
        ]);
        for row in self.backend.fetch_all(&[Column::ExternalId], &predicate)? {
            if let Some(flag) = row.text(Column::ExternalId).and_then(|id| found.get_mut(id)) {
                *flag = true;
            }
        }
        Ok(found)
    }

    /// Matching entities ordered by `(entity_type, external_id)`.
    pub fn list(&self, predicate: &Predicate, now: DateTime<Utc>) -> Result<Vec<EntitySnapshot>> {
        let mut snapshots = self
            .backend
            .fetch_all(&SNAPSHOT_COLUMNS, predicate)?
            .iter()
            .map(|row| EntitySnapshot::from_row(row, now))
            .collect::<Result<Vec<_>>>()?;
        snapshots.sort_by(|a, b| {
            (&a.entity_type, &a.external_id).cmp(&(&b.entity_type, &b.external_id))
        });
        Ok(snapshots)
    }

    /// Read the current state of `(entity_type, external_id)` and write the
    /// row `build` derives from it, atomically.
    pub fn record<F>(&self, external_id: &str, entity_type: &str, build: F) -> Result<UpsertOutcome>
    where
        F: FnOnce(Option<EntityState>) -> Result<Row>,
    {
        let key = Row::new()
            .with(Column::ExternalId, external_id)
            .with(Column::EntityType, entity_type);
        let mut build = Some(build);
        self.backend
            .upsert_with(&key, &STATE_COLUMNS, &mut |existing| {
                let build = build.take().ok_or_else(|| {
                    SpotterError::Internal("merge builder invoked twice".to_string())
                })?;
                let state = existing.as_ref().map(EntityState::from_row).transpose()?;
                build(state)
            })
    }
}

fn updated_after_clause(updated_after: Option<DateTime<Utc>>) -> Predicate {
    match updated_after {
        Some(t) => Predicate::column(Column::FullyUpdatedAt, CmpOp::Gt, t),
        None => Predicate::True,
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

impl EntityState {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            first_seen_at: row.time(Column::FirstSeenAt),
            attributes: decode_attributes(row.json(Column::Attributes))?,
            history: decode_history(row.json(Column::History))?,
        })
    }
}

impl EntitySnapshot {
    pub fn from_row(row: &Row, now: DateTime<Utc>) -> Result<Self> {
        let expires_at = row.time(Column::ExpiresAt);
        let stored_active = row.bool(Column::Active).unwrap_or(false);
        Ok(Self {
            external_id: row.text(Column::ExternalId).unwrap_or_default().to_string(),
            entity_type: row.text(Column::EntityType).unwrap_or_default().to_string(),
            first_seen_at: row.time(Column::FirstSeenAt),
            last_seen_at: row.time(Column::LastSeenAt),
            fully_updated_at: row.time(Column::FullyUpdatedAt),
            expires_at,
            active: stored_active && expires_at.is_none_or(|at| at > now),
            attributes: decode_attributes(row.json(Column::Attributes))?,
            history: decode_history(row.json(Column::History))?,
        })
    }
}

fn decode_attributes(value: Option<&JsonValue>) -> Result<Attributes> {
    match value {
        None => Ok(Attributes::new()),
        Some(JsonValue::Object(map)) => Ok(map.clone()),
        Some(other) => Err(SpotterError::Storage(format!(
            "stored attributes are not an object: {other}"
        ))),
    }
}

fn decode_history(value: Option<&JsonValue>) -> Result<History> {
    match value {
        None => Ok(History::new()),
        Some(v) => Ok(serde_json::from_value(v.clone())?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::HistoryEntry;
    use serde_json::json;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn repo() -> EntityRepository {
        EntityRepository::new(Box::new(SqliteBackend::open_in_memory("entities").unwrap()))
    }

    fn seed(repo: &EntityRepository, ty: &str, ext: &str, fully_updated: &str) {
        repo.record(ext, ty, |_| {
            Ok(Row::new()
                .with(Column::InternalId, format!("u-{ty}-{ext}"))
                .with(Column::FirstSeenAt, dt(fully_updated))
                .with(Column::FullyUpdatedAt, dt(fully_updated))
                .with(Column::ExpiresAt, dt("2030-01-01T00:00:00Z"))
                .with(Column::Active, true)
                .with(Column::Attributes, json!({"title": ext})))
        })
        .unwrap();
    }

    #[test]
    fn find_by_identity_decodes_state() {
        let repo = repo();
        assert!(repo.find_by_identity("x1", "page").unwrap().is_none());
        repo.record("x1", "page", |prior| {
            assert!(prior.is_none());
            Ok(Row::new()
                .with(Column::InternalId, "u-1")
                .with(Column::FirstSeenAt, dt("2024-01-01T00:00:00Z"))
                .with(Column::Attributes, json!({"a": 1}))
                .with(
                    Column::History,
                    json!({"price": [["2024-01-01T00:00:00Z", 10]]}),
                ))
        })
        .unwrap();

        let state = repo.find_by_identity("x1", "page").unwrap().unwrap();
        assert_eq!(state.first_seen_at, Some(dt("2024-01-01T00:00:00Z")));
        assert_eq!(state.attributes["a"], 1);
        assert_eq!(
            state.history["price"],
            vec![HistoryEntry(dt("2024-01-01T00:00:00Z"), json!(10))]
        );
        assert!(repo.find_by_identity("x1", "post").unwrap().is_none());
    }

    #[test]
    fn exists_respects_updated_after_strictly() {
        let repo = repo();
        seed(&repo, "page", "x1", "2024-01-10T00:00:00Z");
        assert!(repo.exists("x1", "page", None).unwrap());
        assert!(repo.exists("x1", "page", Some(dt("2024-01-09T00:00:00Z"))).unwrap());
        assert!(!repo.exists("x1", "page", Some(dt("2024-01-10T00:00:00Z"))).unwrap());
        assert!(!repo.exists("x1", "", None).unwrap());
    }

    #[test]
    fn exists_batch_reports_every_requested_id() {
        let repo = repo();
        seed(&repo, "page", "x1", "2024-01-10T00:00:00Z");
        seed(&repo, "page", "x2", "2024-01-01T00:00:00Z");
        seed(&repo, "post", "x3", "2024-01-10T00:00:00Z");

        let ids: Vec<String> = ["x1", "x2", "x3", "x4"].map(String::from).to_vec();
        let found = repo.exists_batch(&ids, "page", None).unwrap();
        assert_eq!(found.len(), 4);
        assert!(found["x1"] && found["x2"]);
        assert!(!found["x3"] && !found["x4"]);

        let recent = repo
            .exists_batch(&ids, "page", Some(dt("2024-01-05T00:00:00Z")))
            .unwrap();
        assert!(recent["x1"]);
        assert!(!recent["x2"]);
    }

    #[test]
    fn list_orders_by_type_then_id() {
        let repo = repo();
        seed(&repo, "post", "a", "2024-01-01T00:00:00Z");
        seed(&repo, "page", "b", "2024-01-01T00:00:00Z");
        seed(&repo, "page", "a", "2024-01-01T00:00:00Z");
        let listed = repo.list(&Predicate::True, dt("2024-06-01T00:00:00Z")).unwrap();
        let order: Vec<(&str, &str)> = listed
            .iter()
            .map(|s| (s.entity_type.as_str(), s.external_id.as_str()))
            .collect();
        assert_eq!(order, vec![("page", "a"), ("page", "b"), ("post", "a")]);
    }

    #[test]
    fn snapshot_active_lapses_at_expiry() {
        let row = Row::new()
            .with(Column::ExternalId, "x1")
            .with(Column::EntityType, "")
            .with(Column::Active, true)
            .with(Column::ExpiresAt, dt("2024-01-08T00:00:00Z"));
        let before = EntitySnapshot::from_row(&row, dt("2024-01-07T23:59:59Z")).unwrap();
        assert!(before.active);
        let at = EntitySnapshot::from_row(&row, dt("2024-01-08T00:00:00Z")).unwrap();
        assert!(!at.active);
    }

    #[test]
    fn malformed_attributes_are_a_storage_error() {
        let row = Row::new().with(Column::Attributes, json!([1, 2]));
        let err = EntityState::from_row(&row).unwrap_err();
        assert!(matches!(err, SpotterError::Storage(_)));
    }
}
