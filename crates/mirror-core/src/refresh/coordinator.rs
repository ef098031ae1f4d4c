//! Seams to the collaborators the orchestrator drives but does not own.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

use super::types::RefreshCandidate;

/// Catalog of mirrored records and their local freshness.
pub trait CandidateStore {
    /// Records in `scope` that are eligible for a refresh check, most
    /// important first.
    fn get_refresh_candidates(&self, scope: &str) -> Result<Vec<RefreshCandidate>>;
}

/// Owner of the blue/green store pair.
///
/// The orchestrator only ever touches the store through these verbs. Calls
/// are synchronous and may block on I/O; timeouts are the implementor's
/// business.
pub trait UpdateCoordinator {
    /// Create (or refresh) the green copy from the live blue copy.
    fn prepare_green_database(&self) -> Result<bool>;

    /// Record ids that changed upstream since the live copy was built.
    /// This is the call that reaches the upstream API.
    fn detect_deltas(&self) -> Result<Vec<String>>;

    /// Write the given records from `endpoint` into green. Returns the
    /// number of rows affected.
    fn apply_updates(&self, endpoint: &str, record_ids: &[String]) -> Result<usize>;

    fn verify_integrity(&self) -> Result<IntegrityReport>;

    /// Atomically point readers at green.
    fn switch_to_green(&self) -> Result<bool>;

    /// Discard green and make sure readers stay on (or return to) blue.
    fn rollback_to_blue(&self) -> Result<bool>;

    fn get_status(&self) -> Result<CoordinatorStatus>;
}

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub passed: bool,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl IntegrityReport {
    pub fn passed(details: Map<String, Value>) -> Self {
        Self {
            passed: true,
            details,
        }
    }

    pub fn failed(details: Map<String, Value>) -> Self {
        Self {
            passed: false,
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPoolStatus {
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub active_db: String,
    #[serde(default)]
    pub connection_pool: Option<ConnectionPoolStatus>,
    #[serde(default)]
    pub table_sizes: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_refresh: Option<DateTime<Utc>>,
}

/// What `store_stats` reports. With blue-green disabled this serializes to
/// exactly `{"enabled": false}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_pool: Option<ConnectionPoolStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_sizes: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoreStats {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_status(status: CoordinatorStatus) -> Self {
        Self {
            enabled: true,
            active_db: Some(status.active_db),
            connection_pool: status.connection_pool,
            table_sizes: Some(status.table_sizes),
            last_refresh: status.last_refresh,
            error: None,
        }
    }

    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            enabled: true,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}
