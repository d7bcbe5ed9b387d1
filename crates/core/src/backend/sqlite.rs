//! SQLite backend (rusqlite).
//!
//! The predicate tree is lowered to SQL here and nowhere else. Values are
//! bound as `?` parameters; the only interpolated text is the table name
//! (validated as a plain identifier) and fixed column names.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use tracing::info;

use super::{updatable_columns, BuildRow, StorageBackend, UpsertOutcome};
use crate::config::validate_table_name;
use crate::predicate::{Operand, Predicate};
use crate::row::{Cell, Column, ColumnKind, Row};
use crate::time::{format_timestamp, parse_stored_timestamp};
use crate::{Result, SpotterError};

/// Text rendering of a `json_each` entry, matching
/// [`attribute_text`](crate::predicate::attribute_text).
///
/// Numbers, objects and arrays are read back as their JSON text via `->`.
/// The column was written by serde_json, so that text is serde's own and
/// large integers or exponents are not re-rendered by SQLite's REAL casts.
const ATTRIBUTE_TEXT: &str = "(CASE a.type \
     WHEN 'null' THEN NULL \
     WHEN 'true' THEN 'true' \
     WHEN 'false' THEN 'false' \
     WHEN 'text' THEN a.value \
     ELSE e.attributes -> a.fullpath END)";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed entity table.
///
/// One connection behind a mutex; writes run in `BEGIN IMMEDIATE`
/// transactions so the lookup and the write see the same row.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteBackend {
    /// Open or create a database file and provision `table` in it.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Other processes may hold the file; wait for them from the first statement on.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn, table)
    }

    /// Private in-memory database. Data is lost when the backend is dropped.
    pub fn open_in_memory(table: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, table)
    }

    fn init(conn: Connection, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let backend = Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        };
        backend.ensure_schema()?;
        Ok(backend)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SpotterError::Internal("sqlite connection lock poisoned".into()))
    }

    fn query_rows(
        &self,
        conn: &Connection,
        columns: &[Column],
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<Row>> {
        let mut params = Vec::new();
        let where_sql = lower(predicate, &mut params);
        let mut sql = format!(
            "SELECT {} FROM \"{}\" AS e WHERE {where_sql} ORDER BY e.rowid",
            select_list(columns),
            self.table
        );
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_from_iter(params.iter()), |r| {
                (0..columns.len())
                    .map(|i| r.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|values| decode_row(columns, values))
            .collect()
    }
}

impl StorageBackend for SqliteBackend {
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{t}\" (
                internal_id TEXT PRIMARY KEY NOT NULL,
                entity_type TEXT NOT NULL,
                external_id TEXT NOT NULL,
                attributes TEXT,
                history TEXT,
                first_seen_at TEXT,
                last_seen_at TEXT,
                fully_updated_at TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                expires_at TEXT,
                UNIQUE (entity_type, external_id)
            );",
            t = self.table
        ))?;
        info!(table = %self.table, "sqlite schema ready");
        Ok(())
    }

    fn count(&self, predicate: &Predicate) -> Result<u64> {
        let conn = self.lock()?;
        let mut params = Vec::new();
        let where_sql = lower(predicate, &mut params);
        let sql = format!(
            "SELECT COUNT(*) FROM \"{}\" AS e WHERE {where_sql}",
            self.table
        );
        let n: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn fetch_one(&self, columns: &[Column], predicate: &Predicate) -> Result<Option<Row>> {
        let conn = self.lock()?;
        Ok(self
            .query_rows(&conn, columns, predicate, Some(1))?
            .into_iter()
            .next())
    }

    fn fetch_all(&self, columns: &[Column], predicate: &Predicate) -> Result<Vec<Row>> {
        let conn = self.lock()?;
        self.query_rows(&conn, columns, predicate, None)
    }

    fn upsert_with(
        &self,
        key: &Row,
        read_columns: &[Column],
        build: &mut BuildRow<'_>,
    ) -> Result<UpsertOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let lookup = Predicate::matching_row(key);
        let existing = self
            .query_rows(&tx, read_columns, &lookup, Some(1))?
            .into_iter()
            .next();
        let existed = existing.is_some();

        let mut values = build(existing)?;
        for (column, cell) in key.iter() {
            if !values.contains(column) {
                values.set(column, cell.clone());
            }
        }

        let outcome = if existed {
            let columns: Vec<Column> = updatable_columns(&values, key).collect();
            if !columns.is_empty() {
                let mut params: Vec<SqlValue> = columns
                    .iter()
                    .filter_map(|c| values.get(*c).map(encode_cell))
                    .collect();
                let assignments = columns
                    .iter()
                    .map(|c| format!("{} = ?", c.name()))
                    .collect::<Vec<_>>()
                    .join(", ");
                let where_sql = lower(&lookup, &mut params);
                let sql = format!(
                    "UPDATE \"{}\" AS e SET {assignments} WHERE {where_sql}",
                    self.table
                );
                tx.execute(&sql, params_from_iter(params.iter()))?;
            }
            UpsertOutcome::Updated
        } else {
            let columns: Vec<Column> = values.columns().collect();
            let params: Vec<SqlValue> = values.iter().map(|(_, cell)| encode_cell(cell)).collect();
            let names = columns
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO \"{}\" ({names}) VALUES ({placeholders})",
                self.table
            );
            tx.execute(&sql, params_from_iter(params.iter()))?;
            UpsertOutcome::Inserted
        };

        tx.commit()?;
        Ok(outcome)
    }
}

fn select_list(columns: &[Column]) -> String {
    if columns.is_empty() {
        return "1".to_string();
    }
    columns
        .iter()
        .map(|c| format!("e.{}", c.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lower a predicate to a SQL boolean expression over alias `e`, appending
/// bound values to `params` in placeholder order.
fn lower(predicate: &Predicate, params: &mut Vec<SqlValue>) -> String {
    match predicate {
        Predicate::True => "1 = 1".to_string(),
        Predicate::And(parts) if parts.is_empty() => "1 = 1".to_string(),
        Predicate::Or(parts) if parts.is_empty() => "1 = 0".to_string(),
        Predicate::And(parts) => join(parts, " AND ", params),
        Predicate::Or(parts) => join(parts, " OR ", params),
        Predicate::IsTrue(column) => format!("e.{} = 1", column.name()),
        Predicate::Compare {
            operand: Operand::Column(column),
            op,
            value,
        } => {
            params.push(encode_cell(value));
            format!("e.{} {} ?", column.name(), op.sql())
        }
        Predicate::Compare {
            operand: Operand::Attribute(key),
            op,
            value,
        } => {
            params.push(SqlValue::Text(key.clone()));
            params.push(encode_cell(value));
            format!(
                "EXISTS (SELECT 1 FROM json_each(e.attributes) AS a \
                 WHERE a.key = ? AND {ATTRIBUTE_TEXT} {} ?)",
                op.sql()
            )
        }
    }
}

fn join(parts: &[Predicate], sep: &str, params: &mut Vec<SqlValue>) -> String {
    let lowered: Vec<String> = parts.iter().map(|p| lower(p, params)).collect();
    format!("({})", lowered.join(sep))
}

fn encode_cell(cell: &Cell) -> SqlValue {
    match cell {
        Cell::Null | Cell::Json(serde_json::Value::Null) => SqlValue::Null,
        Cell::Text(s) => SqlValue::Text(s.clone()),
        Cell::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Cell::Time(t) => SqlValue::Text(format_timestamp(*t)),
        Cell::Json(v) => SqlValue::Text(v.to_string()),
    }
}

fn decode_cell(column: Column, value: SqlValue) -> Result<Cell> {
    match (column.kind(), value) {
        (_, SqlValue::Null) => Ok(Cell::Null),
        (ColumnKind::Text, SqlValue::Text(s)) => Ok(Cell::Text(s)),
        (ColumnKind::Json, SqlValue::Text(s)) => Ok(Cell::Json(serde_json::from_str(&s)?)),
        (ColumnKind::Timestamp, SqlValue::Text(s)) => Ok(Cell::Time(parse_stored_timestamp(&s)?)),
        (ColumnKind::Boolean, SqlValue::Integer(i)) => Ok(Cell::Bool(i != 0)),
        (_, other) => Err(SpotterError::Storage(format!(
            "column {column}: unexpected sqlite value {other:?}"
        ))),
    }
}

fn decode_row(columns: &[Column], values: Vec<SqlValue>) -> Result<Row> {
    let mut row = Row::new();
    for (&column, value) in columns.iter().zip(values) {
        row.set(column, decode_cell(column, value)?);
    }
    Ok(row)
}
