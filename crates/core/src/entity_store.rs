//! Spotter: temporal entity store for scraped observations.
//!
//! Each observation describes an externally identified entity
//! (`(type, external_id)`) at a point in time. The store merges it into one
//! persisted record:
//!
//! - **attributes** are shallow-merged: new values overwrite, absent keys are
//!   left alone, nothing is ever deleted;
//! - **history** keys (fields named with a leading `$`) grow an append-only
//!   series of `[timestamp, value]` pairs;
//! - **recency** is tracked twice: `last_seen_at` moves on every observation,
//!   `fully_updated_at` only on non-partial ones.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use serde_json::json;
//! use spotter::{EntityStore, FilterParams, ParamValue};
//!
//! let store = EntityStore::open_in_memory().unwrap();
//!
//! // Record an observation
//! let report = store
//!     .ingest(&[json!({"id": "x1", "type": "page", "title": "Hello"})], Utc::now())
//!     .unwrap();
//! assert!(report.is_clean());
//!
//! // Existence check
//! assert!(store.exists("x1", "page", None).unwrap());
//!
//! // Filter query
//! let mut params = FilterParams::new();
//! params.insert("type".into(), ParamValue::One("page".into()));
//! let pages = store.list(&params, Utc::now()).unwrap();
//! ```

pub mod backend;
pub mod config;
pub mod ingest;
pub mod operation;
pub mod predicate;
pub mod query;
pub mod repository;
pub mod row;
pub mod time;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub use backend::{open_backend, EmbeddedBackend, SqliteBackend, StorageBackend, UpsertOutcome};
pub use config::{BackendKind, HistoryMode, StoreConfig};
pub use ingest::{IngestReport, IngestionEngine, ItemOutcome, ItemStatus, Observation};
pub use operation::{Operation, Verb};
pub use predicate::Predicate;
pub use query::{translate, FilterParams, ParamValue};
pub use repository::EntityRepository;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SpotterError {
    /// The caller's input was rejected before touching storage.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SpotterError {
    pub fn is_validation(&self) -> bool {
        matches!(self, SpotterError::Validation(_))
    }
}

impl From<redb::DatabaseError> for SpotterError {
    fn from(e: redb::DatabaseError) -> Self {
        SpotterError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for SpotterError {
    fn from(e: redb::TransactionError) -> Self {
        SpotterError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for SpotterError {
    fn from(e: redb::TableError) -> Self {
        SpotterError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for SpotterError {
    fn from(e: redb::StorageError) -> Self {
        SpotterError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for SpotterError {
    fn from(e: redb::CommitError) -> Self {
        SpotterError::Storage(e.to_string())
    }
}
impl From<rusqlite::Error> for SpotterError {
    fn from(e: rusqlite::Error) -> Self {
        SpotterError::Storage(e.to_string())
    }
}
impl From<getrandom::Error> for SpotterError {
    fn from(e: getrandom::Error) -> Self {
        SpotterError::Internal(format!("entropy source failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SpotterError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Opaque primary key of an entity row: a version-4 UUID built from 128
/// bits of OS entropy. Assigned once, on first insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0_u8; 16];
        getrandom::fill(&mut bytes)?;
        Ok(Self(
            uuid::Builder::from_random_bytes(bytes)
                .into_uuid()
                .to_string(),
        ))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shallow-merged attribute map.
pub type Attributes = serde_json::Map<String, JsonValue>;

/// Per-key append-only series, oldest first.
pub type History = BTreeMap<String, Vec<HistoryEntry>>;

/// One observed value of a historical field. Serialises as `[timestamp, value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry(pub DateTime<Utc>, pub JsonValue);

/// Merge state recovered for an existing entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityState {
    pub first_seen_at: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    pub history: History,
}

/// An entity as returned by filter queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    #[serde(rename = "id")]
    pub external_id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub fully_updated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Re-derived when read: false once `expires_at` has passed, even if the
    /// row was active when written.
    pub active: bool,
    pub attributes: Attributes,
    pub history: History,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Spotter entity store.
///
/// Owns one [`StorageBackend`] (chosen by [`StoreConfig::backend`]) and
/// exposes the four operations a request front-end dispatches to. Callers
/// pass the current time in, so every operation is deterministic under test.
///
/// # Example
///
/// ```rust,no_run
/// use chrono::Utc;
/// use serde_json::json;
/// use spotter::{BackendKind, EntityStore, StoreConfig};
///
/// let store = EntityStore::open(StoreConfig::at_path(BackendKind::Sqlite, "items.db")).unwrap();
/// store.ingest(&[json!({"id": "obj://1", "$price": 10})], Utc::now()).unwrap();
/// assert!(store.exists("obj://1", "", None).unwrap());
/// ```
pub struct EntityStore {
    repo: EntityRepository,
    config: StoreConfig,
}

impl EntityStore {
    /// Open the configured backend, provisioning its table if needed.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let backend = open_backend(&config)?;
        Ok(Self {
            repo: EntityRepository::new(backend),
            config,
        })
    }

    /// In-memory SQLite store with default settings.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig::default())
    }

    pub fn repository(&self) -> &EntityRepository {
        &self.repo
    }

    /// Merge a batch of observations. Items are independent: a failing item
    /// is reported in the returned [`IngestReport`] and the rest still land.
    ///
    /// # Errors
    ///
    /// [`SpotterError::Validation`] for an empty batch.
    pub fn ingest(&self, items: &[JsonValue], now: DateTime<Utc>) -> Result<IngestReport> {
        IngestionEngine::new(&self.repo, &self.config)?.ingest(items, now)
    }

    /// Is `(entity_type, external_id)` stored, and, when `updated_after` is
    /// given, fully updated after it?
    pub fn exists(
        &self,
        external_id: &str,
        entity_type: &str,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        if external_id.is_empty() {
            return Err(SpotterError::Validation("id is required".to_string()));
        }
        self.repo.exists(external_id, entity_type, updated_after)
    }

    /// [`exists`](Self::exists) for several ids of one type.
    pub fn exists_batch(
        &self,
        external_ids: &[String],
        entity_type: &str,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, bool>> {
        if external_ids.is_empty() {
            return Err(SpotterError::Validation(
                "at least one id is required".to_string(),
            ));
        }
        self.repo
            .exists_batch(external_ids, entity_type, updated_after)
    }

    /// Entities matching every filter in `params`.
    pub fn list(&self, params: &FilterParams, now: DateTime<Utc>) -> Result<Vec<EntitySnapshot>> {
        let predicate = translate(params, now)?;
        self.repo.list(&predicate, now)
    }

    pub fn find_by_identity(
        &self,
        external_id: &str,
        entity_type: &str,
    ) -> Result<Option<EntityState>> {
        self.repo.find_by_identity(external_id, entity_type)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
