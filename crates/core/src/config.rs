//! Store configuration.

use std::path::PathBuf;

use chrono::TimeDelta;

use crate::{Result, SpotterError};

/// Default active window: seven days.
pub const DEFAULT_ACTIVE_WINDOW_SECS: i64 = 604_800;

/// Default table name.
pub const DEFAULT_TABLE: &str = "entities";

/// Which storage engine backs the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Relational table in a SQLite database file.
    #[default]
    Sqlite,
    /// redb key-value file, no SQL.
    Embedded,
}

impl std::str::FromStr for BackendKind {
    type Err = SpotterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "embedded" | "redb" => Ok(BackendKind::Embedded),
            other => Err(SpotterError::Validation(format!(
                "unknown backend {other:?} (expected `sqlite` or `embedded`)"
            ))),
        }
    }
}

/// How historical fields grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryMode {
    /// Every observation is pushed to the end of the series.
    #[default]
    Append,
    /// Entries are kept in timestamp order; an observation whose value equals
    /// its neighbour's is dropped.
    Ordered,
}

impl std::str::FromStr for HistoryMode {
    type Err = SpotterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(HistoryMode::Append),
            "ordered" => Ok(HistoryMode::Ordered),
            other => Err(SpotterError::Validation(format!(
                "unknown history mode {other:?} (expected `append` or `ordered`)"
            ))),
        }
    }
}

/// Everything needed to open an [`EntityStore`](crate::EntityStore).
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Database file. `None` opens an in-memory store.
    pub path: Option<PathBuf>,
    /// Table holding entity rows. Must be a plain identifier.
    pub table: String,
    /// Seconds after the effective observation time before an entity
    /// stops being active.
    pub active_window_secs: i64,
    pub history_mode: HistoryMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: None,
            table: DEFAULT_TABLE.to_string(),
            active_window_secs: DEFAULT_ACTIVE_WINDOW_SECS,
            history_mode: HistoryMode::default(),
        }
    }
}

impl StoreConfig {
    pub fn at_path(backend: BackendKind, path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn in_memory(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_active_window_secs(mut self, secs: i64) -> Self {
        self.active_window_secs = secs;
        self
    }

    pub fn with_history_mode(mut self, mode: HistoryMode) -> Self {
        self.history_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.table)?;
        self.active_window().map(|_| ())
    }

    /// The active window as a duration.
    ///
    /// # Errors
    ///
    /// [`SpotterError::Validation`] unless the window is positive and
    /// representable as a [`TimeDelta`].
    pub fn active_window(&self) -> Result<TimeDelta> {
        let secs = self.active_window_secs;
        if secs <= 0 {
            return Err(SpotterError::Validation(format!(
                "active window must be positive, got {secs}"
            )));
        }
        TimeDelta::try_seconds(secs).ok_or_else(|| {
            SpotterError::Validation(format!("active window of {secs} seconds is too large"))
        })
    }
}

/// Table names are interpolated into SQL and redb table names, so only
/// `[A-Za-z_][A-Za-z0-9_]*` is accepted.
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(SpotterError::Validation(format!(
            "invalid table name {name:?}"
        )))
    }
}
