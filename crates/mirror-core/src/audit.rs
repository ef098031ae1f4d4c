//! Append-only audit log of refresh orchestration events.
//!
//! Events are either kept in memory or persisted in redb. The persistent
//! table uses a 24-byte composite key:
//! ```text
//! [ sequence_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//! `sequence_ms` is the event's timestamp in milliseconds, bumped past the
//! last key in the table when needed, so a plain table scan yields events in
//! the order they were logged even within one millisecond.
//! Nothing in this module updates or removes an entry once written;
//! retention is left to whoever owns the database file.

use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MirrorError, Result};

/// Key: 24-byte composite (sequence_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded AuditEvent
const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("audit_events");

/// Details key carrying the session (refresh run) an event belongs to.
pub const SESSION_ID_KEY: &str = "session_id";

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl AuditEvent {
    pub fn session_id(&self) -> Option<&str> {
        self.details.get(SESSION_ID_KEY).and_then(Value::as_str)
    }
}

fn event_key(seq_ms: u64, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&seq_ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn last_sequence(table: &redb::Table<'_, &'static [u8], &'static [u8]>) -> Result<Option<u64>> {
    let Some((k, _)) = table.last().map_err(db_err)? else {
        return Ok(None);
    };
    let prefix: [u8; 8] = k
        .value()
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| MirrorError::AuditDb("malformed audit key".into()))?;
    Ok(Some(u64::from_be_bytes(prefix)))
}

fn db_err(e: impl std::fmt::Display) -> MirrorError {
    MirrorError::AuditDb(e.to_string())
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

enum Backend {
    Memory(Mutex<Vec<AuditEvent>>),
    Redb(Database),
}

pub struct AuditLog {
    backend: Backend,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backend {
            Backend::Memory(_) => "memory",
            Backend::Redb(_) => "redb",
        };
        f.debug_struct("AuditLog").field("backend", &kind).finish()
    }
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(Vec::new())),
        }
    }

    /// Open or create the redb database at `path`.
    ///
    /// redb holds an exclusive lock on the file while it is open; a database
    /// already open elsewhere yields [`MirrorError::AuditLogBusy`].
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => MirrorError::AuditLogBusy,
            other => db_err(other),
        })?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(EVENTS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self {
            backend: Backend::Redb(db),
        })
    }

    /// [`open`](Self::open), retrying with backoff while another process
    /// holds the database, for at most `wait`.
    pub fn open_waiting(path: &Path, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        let mut backoff = Duration::from_millis(25);
        loop {
            match Self::open(path) {
                Err(MirrorError::AuditLogBusy) if Instant::now() < deadline => {
                    thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
                    backoff = (backoff * 2).min(Duration::from_millis(400));
                }
                other => return other,
            }
        }
    }

    /// Append an event. `None` details are stored as `{}`.
    ///
    /// Audit writes never interrupt a refresh: a failed write is logged and
    /// the event is returned regardless.
    pub fn log_event(&self, event: &str, details: Option<Map<String, Value>>) -> AuditEvent {
        let entry = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event: event.to_string(),
            details: details.unwrap_or_default(),
        };
        if let Err(e) = self.append(&entry) {
            tracing::error!(event = %entry.event, error = %e, "failed to write audit event");
        }
        entry
    }

    fn append(&self, entry: &AuditEvent) -> Result<()> {
        match &self.backend {
            Backend::Memory(events) => {
                events
                    .lock()
                    .map_err(|_| MirrorError::AuditDb("audit log mutex poisoned".into()))?
                    .push(entry.clone());
                Ok(())
            }
            Backend::Redb(db) => {
                let value = serde_json::to_vec(entry)?;
                let wt = db.begin_write().map_err(db_err)?;
                {
                    let mut table = wt.open_table(EVENTS).map_err(db_err)?;
                    let mut seq_ms = entry.timestamp.timestamp_millis().max(0) as u64;
                    if let Some(prev) = last_sequence(&table)? {
                        seq_ms = seq_ms.max(prev + 1);
                    }
                    let key = event_key(seq_ms, entry.id);
                    table
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(db_err)?;
                }
                wt.commit().map_err(db_err)?;
                Ok(())
            }
        }
    }

    /// All entries in log order, or only those whose details carry
    /// `session_id`. Entries without a session id never match a filter.
    pub fn entries(&self, session_id: Option<&str>) -> Result<Vec<AuditEvent>> {
        let all = self.all()?;
        Ok(match session_id {
            None => all,
            Some(sid) => all
                .into_iter()
                .filter(|e| e.session_id() == Some(sid))
                .collect(),
        })
    }

    fn all(&self) -> Result<Vec<AuditEvent>> {
        match &self.backend {
            Backend::Memory(events) => Ok(events
                .lock()
                .map_err(|_| MirrorError::AuditDb("audit log mutex poisoned".into()))?
                .clone()),
            Backend::Redb(db) => {
                let rt = db.begin_read().map_err(db_err)?;
                let table = rt.open_table(EVENTS).map_err(db_err)?;
                let mut result = Vec::new();
                for entry in table.iter().map_err(db_err)? {
                    let (_, v) = entry.map_err(db_err)?;
                    let event: AuditEvent = serde_json::from_slice(v.value())?;
                    result.push(event);
                }
                Ok(result)
            }
        }
    }
}

/// Build a details map from `serde_json::json!({...})` output.
///
/// Non-object values are wrapped as `{"value": ...}`.
pub fn details(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
