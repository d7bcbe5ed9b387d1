use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};
use spotter::time::parse_timestamp;
use spotter::{
    BackendKind, EntityStore, FilterParams, HistoryMode, ItemStatus, Operation, ParamValue,
    SpotterError, StoreConfig, Verb,
};
use std::env;
use std::io::{self, BufRead, BufReader, Read, Write};
use tracing::{debug, info, warn};

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_BATCH_ITEMS: usize = 10_000;
const DEFAULT_DB_PATH: &str = "./spotter.db";

struct AppState {
    store: EntityStore,
}

impl AppState {
    fn open() -> Result<Self> {
        let config = config_from_env()?;
        info!(
            backend = ?config.backend,
            path = ?config.path,
            table = %config.table,
            "opening entity store"
        );
        let store = EntityStore::open(config)?;
        Ok(Self { store })
    }
}

fn config_from_env() -> Result<StoreConfig> {
    let backend: BackendKind = match env::var("SPOTTER_BACKEND") {
        Ok(name) => name.parse().context("invalid SPOTTER_BACKEND")?,
        Err(_) => BackendKind::default(),
    };
    let path = env::var("SPOTTER_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let mut config = StoreConfig::at_path(backend, path);
    if let Ok(table) = env::var("SPOTTER_TABLE") {
        config = config.with_table(table);
    }
    if let Ok(secs) = env::var("SPOTTER_ACTIVE_WINDOW_SECS") {
        let secs = secs
            .trim()
            .parse::<i64>()
            .context("invalid SPOTTER_ACTIVE_WINDOW_SECS")?;
        config = config.with_active_window_secs(secs);
    }
    if let Ok(mode) = env::var("SPOTTER_HISTORY_MODE") {
        let mode: HistoryMode = mode.parse().context("invalid SPOTTER_HISTORY_MODE")?;
        config = config.with_history_mode(mode);
    }
    Ok(config)
}

fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let state = AppState::open().context("failed to open spotter database")?;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "unreadable request frame");
                let resp = response(
                    JsonValue::Null,
                    Err(ApiError::bad_request(format!("parse error: {e:#}"))),
                );
                write_message(&mut writer, &resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        let resp = handle_request(&state, &request, Utc::now());
        write_message(&mut writer, &resp)?;
    }

    info!("stdin closed, shutting down");
    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        // Skip the payload so the next frame starts on a header.
        io::copy(&mut reader.by_ref().take(len as u64), &mut io::sink())?;
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Failed request: an HTTP-style status code and a message for the caller.
#[derive(Debug)]
struct ApiError {
    status: u16,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            message: message.into(),
        }
    }

    fn method_not_allowed(message: impl Into<String>) -> Self {
        Self {
            status: 405,
            message: message.into(),
        }
    }
}

impl From<SpotterError> for ApiError {
    fn from(e: SpotterError) -> Self {
        let status = if e.is_validation() { 400 } else { 500 };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

fn response(id: JsonValue, result: std::result::Result<JsonValue, ApiError>) -> JsonValue {
    match result {
        Ok(body) => json!({ "id": id, "status": 200, "body": body }),
        Err(err) => json!({
            "id": id,
            "status": err.status,
            "body": { "status": "error", "message": err.message }
        }),
    }
}

fn handle_request(state: &AppState, req: &JsonValue, now: DateTime<Utc>) -> JsonValue {
    let id = req.get("id").cloned().unwrap_or(JsonValue::Null);
    let result = dispatch(state, req, now);
    if let Err(err) = &result {
        if err.status >= 500 {
            warn!(status = err.status, message = %err.message, "request failed");
        } else {
            debug!(status = err.status, message = %err.message, "request rejected");
        }
    }
    response(id, result)
}

fn dispatch(
    state: &AppState,
    req: &JsonValue,
    now: DateTime<Utc>,
) -> std::result::Result<JsonValue, ApiError> {
    let action = req
        .get("action")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ApiError::not_found("you should select an action"))?;
    let op = Operation::from_action(action)
        .ok_or_else(|| ApiError::not_found(format!("unknown action: {action}")))?;

    let verb: Verb = req
        .get("verb")
        .and_then(JsonValue::as_str)
        .unwrap_or("GET")
        .parse()?;
    let required = op.required_verb();
    if verb != required {
        return Err(ApiError::method_not_allowed(format!(
            "only {required} is accepted"
        )));
    }

    let empty = Map::new();
    let params = req
        .get("params")
        .and_then(JsonValue::as_object)
        .unwrap_or(&empty);
    let body = req.get("body").unwrap_or(&JsonValue::Null);

    match op {
        Operation::RecordItems => record_items(state, body, now),
        Operation::ItemExists => item_exists(state, params),
        Operation::ItemsExist => items_exist(state, body),
        Operation::Query => query(state, params, now),
    }
}

fn record_items(
    state: &AppState,
    body: &JsonValue,
    now: DateTime<Utc>,
) -> std::result::Result<JsonValue, ApiError> {
    let items = body
        .get("items")
        .and_then(JsonValue::as_array)
        .filter(|items| !items.is_empty())
        .ok_or_else(|| ApiError::bad_request("you should provide at least one item"))?;
    if items.len() > MAX_BATCH_ITEMS {
        return Err(ApiError::bad_request(format!(
            "batch exceeds max allowed {MAX_BATCH_ITEMS} items"
        )));
    }

    let report = state.store.ingest(items, now)?;
    let failed: Vec<JsonValue> = report
        .outcomes
        .iter()
        .filter_map(|o| match &o.status {
            ItemStatus::Failed(e) => Some(json!({
                "index": o.index,
                "id": o.external_id,
                "message": e.to_string(),
            })),
            _ => None,
        })
        .collect();
    Ok(json!({
        "status": "ok",
        "created": report.created(),
        "updated": report.updated(),
        "failed": failed,
    }))
}

fn item_exists(
    state: &AppState,
    params: &Map<String, JsonValue>,
) -> std::result::Result<JsonValue, ApiError> {
    let id = scalar_text(params.get("id"))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("you should provide an id"))?;
    let entity_type = scalar_text(params.get("type")).unwrap_or_default();
    let updated_after = updated_after(params.get("updated_after"))?;
    let exists = state.store.exists(&id, &entity_type, updated_after)?;
    Ok(json!({ "status": "ok", "exists": exists }))
}

fn items_exist(state: &AppState, body: &JsonValue) -> std::result::Result<JsonValue, ApiError> {
    let ids: Vec<String> = body
        .get("ids")
        .and_then(JsonValue::as_array)
        .map(|ids| ids.iter().filter_map(|v| scalar_text(Some(v))).collect())
        .unwrap_or_default();
    if ids.is_empty() {
        return Err(ApiError::bad_request("you should provide at least one id"));
    }
    let entity_type = scalar_text(body.get("type")).unwrap_or_default();
    let updated_after = updated_after(body.get("updated_after"))?;
    let exist = state.store.exists_batch(&ids, &entity_type, updated_after)?;
    Ok(json!({ "status": "ok", "exist": exist }))
}

fn query(
    state: &AppState,
    params: &Map<String, JsonValue>,
    now: DateTime<Utc>,
) -> std::result::Result<JsonValue, ApiError> {
    let filters: FilterParams = params
        .iter()
        .map(|(key, value)| (key.clone(), ParamValue::from_json(value)))
        .collect();
    let items = state.store.list(&filters, now)?;
    Ok(json!({ "status": "ok", "items": items }))
}

/// Strings as-is, numbers by their JSON text; anything else is absent.
fn scalar_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn updated_after(value: Option<&JsonValue>) -> std::result::Result<Option<DateTime<Utc>>, ApiError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(parse_timestamp(s)?)),
        Some(other) => Err(ApiError::bad_request(format!(
            "updated_after must be a timestamp string, got {other}"
        ))),
    }
}
