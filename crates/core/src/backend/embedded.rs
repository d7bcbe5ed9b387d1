//! Embedded backend on redb: a single-file ACID key-value store, no server.
//!
//! Rows live in table `<name>` as JSON keyed by `internal_id`. A second
//! table, `<name>__identity`, maps the JSON pair `[entity_type, external_id]`
//! to `internal_id` and is what enforces identity uniqueness. Predicates are
//! evaluated in-process over decoded rows (linear scan); identity lookups go
//! through the index.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::info;

use super::{updatable_columns, BuildRow, StorageBackend, UpsertOutcome};
use crate::config::validate_table_name;
use crate::predicate::Predicate;
use crate::row::{Column, Row};
use crate::{Result, SpotterError};

type StrTable<'a> = TableDefinition<'a, &'static str, &'static str>;

/// redb-backed entity table.
pub struct EmbeddedBackend {
    db: Database,
    table: String,
    identity_table: String,
}

impl EmbeddedBackend {
    /// Open or create a store file at `path`.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let db = Database::create(path)?;
        Self::init(db, table)
    }

    /// In-memory store (no file I/O). Data is lost when the backend is dropped.
    pub fn open_in_memory(table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db, table)
    }

    fn init(db: Database, table: &str) -> Result<Self> {
        let backend = Self {
            db,
            table: table.to_string(),
            identity_table: format!("{table}__identity"),
        };
        backend.ensure_schema()?;
        Ok(backend)
    }

    fn rows(&self) -> StrTable<'_> {
        TableDefinition::new(&self.table)
    }

    fn identity(&self) -> StrTable<'_> {
        TableDefinition::new(&self.identity_table)
    }

    // Internal: decode every row, keep those matching `predicate`.
    fn scan(&self, predicate: &Predicate) -> Result<Vec<Row>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.rows())?;
        let mut results = Vec::new();

        for entry in table.iter()? {
            let (_k, v) = entry?;
            let row = decode_row(v.value())?;
            if predicate.matches(&row) {
                results.push(row);
            }
        }

        Ok(results)
    }

    /// Find the row equal to `key`, returning its `internal_id` and content.
    fn locate(
        rows: &impl ReadableTable<&'static str, &'static str>,
        identity: &impl ReadableTable<&'static str, &'static str>,
        key: &Row,
    ) -> Result<Option<(String, Row)>> {
        let is_identity_key = key.columns().count() == 2
            && key.contains(Column::EntityType)
            && key.contains(Column::ExternalId);

        if is_identity_key {
            let ident = identity_key(key)?;
            let Some(id) = identity.get(ident.as_str())?.map(|g| g.value().to_string()) else {
                return Ok(None);
            };
            let stored: Option<String> = rows.get(id.as_str())?.map(|g| g.value().to_string());
            return match stored {
                Some(json) => Ok(Some((id, decode_row(&json)?))),
                None => Err(SpotterError::Storage(format!(
                    "identity index points at missing row {id}"
                ))),
            };
        }

        let lookup = Predicate::matching_row(key);
        for entry in rows.iter()? {
            let (k, v) = entry?;
            let row = decode_row(v.value())?;
            if lookup.matches(&row) {
                return Ok(Some((k.value().to_string(), row)));
            }
        }
        Ok(None)
    }
}

impl StorageBackend for EmbeddedBackend {
    fn ensure_schema(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.open_table(self.rows())?;
        write_txn.open_table(self.identity())?;
        write_txn.commit()?;
        info!(table = %self.table, "embedded schema ready");
        Ok(())
    }

    fn count(&self, predicate: &Predicate) -> Result<u64> {
        Ok(self.scan(predicate)?.len() as u64)
    }

    fn fetch_one(&self, columns: &[Column], predicate: &Predicate) -> Result<Option<Row>> {
        Ok(self
            .scan(predicate)?
            .first()
            .map(|row| row.project(columns)))
    }

    fn fetch_all(&self, columns: &[Column], predicate: &Predicate) -> Result<Vec<Row>> {
        Ok(self
            .scan(predicate)?
            .iter()
            .map(|row| row.project(columns))
            .collect())
    }

    fn upsert_with(
        &self,
        key: &Row,
        read_columns: &[Column],
        build: &mut BuildRow<'_>,
    ) -> Result<UpsertOutcome> {
        // redb serialises write transactions, so nothing can slip in between
        // the lookup and the write below. Returning early drops `write_txn`,
        // which rolls it back.
        let write_txn = self.db.begin_write()?;

        let outcome = {
            let mut rows = write_txn.open_table(self.rows())?;
            let mut identity = write_txn.open_table(self.identity())?;

            let existing = Self::locate(&rows, &identity, key)?;
            let mut values = build(
                existing
                    .as_ref()
                    .map(|(_, row)| row.project(read_columns)),
            )?;
            for (column, cell) in key.iter() {
                if !values.contains(column) {
                    values.set(column, cell.clone());
                }
            }

            match existing {
                Some((id, mut row)) => {
                    let old_ident = identity_key(&row)?;
                    for column in updatable_columns(&values, key) {
                        if let Some(cell) = values.get(column) {
                            row.set(column, cell.clone());
                        }
                    }
                    let new_ident = identity_key(&row)?;
                    if new_ident != old_ident {
                        if identity.get(new_ident.as_str())?.is_some() {
                            return Err(unique_violation(&new_ident));
                        }
                        identity.remove(old_ident.as_str())?;
                        identity.insert(new_ident.as_str(), id.as_str())?;
                    }
                    let json = encode_row(&row)?;
                    rows.insert(id.as_str(), json.as_str())?;
                    UpsertOutcome::Updated
                }
                None => {
                    let id = values
                        .text(Column::InternalId)
                        .ok_or_else(|| {
                            SpotterError::Storage("insert requires internal_id".to_string())
                        })?
                        .to_string();
                    let ident = identity_key(&values)?;
                    if identity.get(ident.as_str())?.is_some() {
                        return Err(unique_violation(&ident));
                    }
                    if rows.get(id.as_str())?.is_some() {
                        return Err(SpotterError::Storage(format!(
                            "primary key violation: internal_id {id} already exists"
                        )));
                    }
                    let json = encode_row(&values)?;
                    rows.insert(id.as_str(), json.as_str())?;
                    identity.insert(ident.as_str(), id.as_str())?;
                    UpsertOutcome::Inserted
                }
            }
        };

        write_txn.commit()?;
        Ok(outcome)
    }
}

fn identity_key(row: &Row) -> Result<String> {
    match (row.text(Column::EntityType), row.text(Column::ExternalId)) {
        (Some(ty), Some(ext)) => Ok(serde_json::to_string(&[ty, ext])?),
        _ => Err(SpotterError::Storage(
            "entity_type and external_id must not be null".to_string(),
        )),
    }
}

fn unique_violation(ident: &str) -> SpotterError {
    SpotterError::Storage(format!(
        "unique constraint violated on (entity_type, external_id) = {ident}"
    ))
}

fn encode_row(row: &Row) -> Result<String> {
    Ok(serde_json::to_string(&row.to_json())?)
}

fn decode_row(json: &str) -> Result<Row> {
    Row::from_json(serde_json::from_str(json)?)
}
