//! Storage backends: one table, typed rows, upsert by unique key.

mod embedded;
mod sqlite;

pub use embedded::EmbeddedBackend;
pub use sqlite::SqliteBackend;

use crate::config::{BackendKind, StoreConfig};
use crate::predicate::Predicate;
use crate::row::{Column, Row};
use crate::{Result, SpotterError};

/// Whether an upsert created or modified a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Callback handed the existing row (if any) inside a write transaction,
/// returning the values to write.
pub type BuildRow<'a> = dyn FnMut(Option<Row>) -> Result<Row> + 'a;

/// Single-table storage.
///
/// Implementations own schema provisioning (done once, at construction) and
/// must bind every caller value as data, never as query text.
pub trait StorageBackend: Send + Sync {
    /// Idempotently create the table and its `(entity_type, external_id)`
    /// uniqueness constraint.
    fn ensure_schema(&self) -> Result<()>;

    /// Number of rows matching `predicate`.
    fn count(&self, predicate: &Predicate) -> Result<u64>;

    /// First matching row, restricted to `columns`.
    fn fetch_one(&self, columns: &[Column], predicate: &Predicate) -> Result<Option<Row>>;

    /// Every matching row, restricted to `columns`. No match is an empty vec.
    fn fetch_all(&self, columns: &[Column], predicate: &Predicate) -> Result<Vec<Row>>;

    /// Read-merge-write in one write transaction.
    ///
    /// The row equal to every cell of `key` is read (restricted to
    /// `read_columns`) and passed to `build`. When it exists, the mutable
    /// supplied columns that are not part of `key` are updated; otherwise
    /// every supplied column is inserted.
    fn upsert_with(
        &self,
        key: &Row,
        read_columns: &[Column],
        build: &mut BuildRow<'_>,
    ) -> Result<UpsertOutcome>;

    /// Write `values`, updating the row identified by `unique_keys` when it
    /// exists and inserting otherwise.
    fn upsert(&self, values: &Row, unique_keys: &[Column]) -> Result<UpsertOutcome> {
        let key = values.project(unique_keys);
        if key.columns().count() != unique_keys.len() {
            return Err(SpotterError::Storage(
                "upsert values must include every unique key column".to_string(),
            ));
        }
        self.upsert_with(&key, &[], &mut |_| Ok(values.clone()))
    }
}

/// Open the backend selected by `config`.
pub fn open_backend(config: &StoreConfig) -> Result<Box<dyn StorageBackend>> {
    config.validate()?;
    let backend: Box<dyn StorageBackend> = match (config.backend, config.path.as_deref()) {
        (BackendKind::Sqlite, Some(path)) => Box::new(SqliteBackend::open(path, &config.table)?),
        (BackendKind::Sqlite, None) => Box::new(SqliteBackend::open_in_memory(&config.table)?),
        (BackendKind::Embedded, Some(path)) => {
            Box::new(EmbeddedBackend::open(path, &config.table)?)
        }
        (BackendKind::Embedded, None) => {
            Box::new(EmbeddedBackend::open_in_memory(&config.table)?)
        }
    };
    Ok(backend)
}

/// Columns an update may touch: supplied, mutable, and not part of the key.
pub(crate) fn updatable_columns<'r>(
    values: &'r Row,
    key: &'r Row,
) -> impl Iterator<Item = Column> + 'r {
    values
        .columns()
        .filter(move |c| !c.is_immutable() && !key.contains(*c))
}

#[cfg(test)]
mod tests {
    //! Behaviour every backend must share.

    use super::*;
    use crate::predicate::CmpOp;
    use crate::row::Cell;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn entity(internal_id: &str, ty: &str, ext: &str) -> Row {
        Row::new()
            .with(Column::InternalId, internal_id)
            .with(Column::EntityType, ty)
            .with(Column::ExternalId, ext)
            .with(Column::FirstSeenAt, dt("2024-01-01T00:00:00Z"))
            .with(Column::LastSeenAt, dt("2024-01-01T00:00:00Z"))
            .with(Column::Active, true)
            .with(Column::Attributes, json!({"title": "Hello", "rank": 3}))
    }

    const IDENTITY: [Column; 2] = [Column::ExternalId, Column::EntityType];

    fn upsert_inserts_then_updates(backend: &dyn StorageBackend) {
        let first = backend.upsert(&entity("u-1", "page", "x1"), &IDENTITY).unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);

        let update = Row::new()
            .with(Column::EntityType, "page")
            .with(Column::ExternalId, "x1")
            .with(Column::LastSeenAt, dt("2024-02-01T00:00:00Z"))
            .with(Column::Attributes, json!({"title": "Bye"}));
        let second = backend.upsert(&update, &IDENTITY).unwrap();
        assert_eq!(second, UpsertOutcome::Updated);

        let key = Predicate::eq(Column::ExternalId, "x1");
        assert_eq!(backend.count(&key).unwrap(), 1);
        let row = backend
            .fetch_one(&Column::ALL, &key)
            .unwrap()
            .expect("row exists");
        assert_eq!(row.text(Column::InternalId), Some("u-1"));
        assert_eq!(row.time(Column::FirstSeenAt), Some(dt("2024-01-01T00:00:00Z")));
        assert_eq!(row.time(Column::LastSeenAt), Some(dt("2024-02-01T00:00:00Z")));
        assert_eq!(row.json(Column::Attributes), Some(&json!({"title": "Bye"})));
    }

    fn update_never_rewrites_immutable_columns(backend: &dyn StorageBackend) {
        backend.upsert(&entity("u-1", "page", "x1"), &IDENTITY).unwrap();
        let clobber = entity("u-2", "page", "x1")
            .with(Column::FirstSeenAt, dt("2030-01-01T00:00:00Z"));
        assert_eq!(
            backend.upsert(&clobber, &IDENTITY).unwrap(),
            UpsertOutcome::Updated
        );
        let row = backend
            .fetch_one(&[Column::InternalId, Column::FirstSeenAt], &Predicate::True)
            .unwrap()
            .unwrap();
        assert_eq!(row.text(Column::InternalId), Some("u-1"));
        assert_eq!(row.time(Column::FirstSeenAt), Some(dt("2024-01-01T00:00:00Z")));
    }

    fn identity_is_unique_per_type(backend: &dyn StorageBackend) {
        backend.upsert(&entity("u-1", "page", "x1"), &IDENTITY).unwrap();
        backend.upsert(&entity("u-2", "", "x1"), &IDENTITY).unwrap();
        assert_eq!(backend.count(&Predicate::True).unwrap(), 2);

        // A plain insert keyed on internal_id collides on the identity pair.
        let err = backend
            .upsert(&entity("u-3", "page", "x1"), &[Column::InternalId])
            .unwrap_err();
        assert!(matches!(err, SpotterError::Storage(_)), "got {err:?}");
    }

    fn fetch_all_filters_and_projects(backend: &dyn StorageBackend) {
        backend.upsert(&entity("u-1", "page", "x1"), &IDENTITY).unwrap();
        backend.upsert(&entity("u-2", "page", "x2"), &IDENTITY).unwrap();
        backend
            .upsert(
                &entity("u-3", "post", "x3").with(Column::Attributes, json!({"title": "Other"})),
                &IDENTITY,
            )
            .unwrap();

        let hello = Predicate::all(vec![
            Predicate::attribute_eq("title", "Hello"),
            Predicate::attribute_eq("rank", "3"),
        ]);
        let rows = backend.fetch_all(&[Column::ExternalId], &hello).unwrap();
        let mut ids: Vec<&str> = rows.iter().filter_map(|r| r.text(Column::ExternalId)).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["x1", "x2"]);
        assert!(rows.iter().all(|r| r.columns().count() == 1));

        let either = Predicate::any(vec![
            Predicate::eq(Column::EntityType, "post"),
            Predicate::eq(Column::ExternalId, "x2"),
        ]);
        assert_eq!(backend.count(&either).unwrap(), 2);

        let none = Predicate::column(Column::FirstSeenAt, CmpOp::Gt, dt("2025-01-01T00:00:00Z"));
        assert!(backend.fetch_all(&Column::ALL, &none).unwrap().is_empty());
        assert!(backend.fetch_one(&Column::ALL, &none).unwrap().is_none());
    }

    fn upsert_with_sees_existing_row(backend: &dyn StorageBackend) {
        let key = Row::new()
            .with(Column::ExternalId, "x1")
            .with(Column::EntityType, "page");
        let mut seen = Vec::new();
        for n in 0..3 {
            backend
                .upsert_with(&key, &[Column::Attributes], &mut |existing| {
                    let count = existing
                        .as_ref()
                        .and_then(|r| r.json(Column::Attributes))
                        .and_then(|a| a.get("n"))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(-1);
                    seen.push(count);
                    let mut row = key
                        .clone()
                        .with(Column::Attributes, json!({ "n": n }))
                        .with(Column::Active, Cell::Bool(true));
                    if existing.is_none() {
                        row.set(Column::InternalId, "u-1");
                    }
                    Ok(row)
                })
                .unwrap();
        }
        assert_eq!(seen, vec![-1, 0, 1]);
    }

    fn failing_build_writes_nothing(backend: &dyn StorageBackend) {
        let key = Row::new()
            .with(Column::ExternalId, "x1")
            .with(Column::EntityType, "page");
        let err = backend
            .upsert_with(&key, &[], &mut |_| {
                Err(SpotterError::Validation("rejected".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, SpotterError::Validation(_)));
        assert_eq!(backend.count(&Predicate::True).unwrap(), 0);
    }

    fn run_contract(open: impl Fn() -> Box<dyn StorageBackend>) {
        upsert_inserts_then_updates(open().as_ref());
        update_never_rewrites_immutable_columns(open().as_ref());
        identity_is_unique_per_type(open().as_ref());
        fetch_all_filters_and_projects(open().as_ref());
        upsert_with_sees_existing_row(open().as_ref());
        failing_build_writes_nothing(open().as_ref());
    }

    #[test]
    fn upsert_requires_every_unique_key() {
        let backend = SqliteBackend::open_in_memory("entities").unwrap();
        let values = Row::new().with(Column::ExternalId, "x1");
        let err = backend.upsert(&values, &IDENTITY).unwrap_err();
        assert!(matches!(err, SpotterError::Storage(_)));
    }

    #[test]
    fn sqlite_backend_contract() {
        run_contract(|| Box::new(SqliteBackend::open_in_memory("entities").unwrap()));
    }

    #[test]
    fn embedded_backend_contract() {
        run_contract(|| Box::new(EmbeddedBackend::open_in_memory("entities").unwrap()));
    }

    #[test]
    fn open_backend_rejects_bad_table_name() {
        let config = StoreConfig::in_memory(BackendKind::Sqlite).with_table("entities; DROP");
        let err = open_backend(&config).err().expect("invalid table name");
        assert!(matches!(err, SpotterError::Validation(_)));
    }
}
