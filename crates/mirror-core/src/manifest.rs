use crate::error::{MirrorError, Result};
use crate::paths;
use crate::refresh::{CandidateStore, RefreshCandidate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Scope value that selects every record regardless of endpoint.
pub const SCOPE_ALL: &str = "all";

// ---------------------------------------------------------------------------
// ManifestEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub record_id: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
}

impl ManifestEntry {
    fn to_candidate(&self) -> RefreshCandidate {
        RefreshCandidate {
            record_id: self.record_id.clone(),
            endpoint: self.endpoint.clone(),
            last_refresh: self.last_refresh,
            priority: self.priority,
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// The catalog of mirrored records, kept in `.mirror/manifest.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub records: Vec<ManifestEntry>,
}

fn default_version() -> u32 {
    1
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: default_version(),
            records: Vec::new(),
        }
    }
}

impl Manifest {
    /// Load the manifest. A missing file is an empty catalog.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::manifest_path(root);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::manifest_path(root), data.as_bytes())
    }

    pub fn add(&mut self, record_id: &str, endpoint: &str, priority: i32) -> Result<()> {
        paths::validate_record_id(record_id)?;
        paths::validate_record_id(endpoint)?;
        if self.records.iter().any(|r| r.record_id == record_id) {
            return Err(MirrorError::RecordExists(record_id.to_string()));
        }
        self.records.push(ManifestEntry {
            record_id: record_id.to_string(),
            endpoint: endpoint.to_string(),
            last_refresh: None,
            priority,
        });
        Ok(())
    }

    /// Stamp `at` on every listed record. Returns how many entries matched.
    pub fn mark_refreshed(&mut self, record_ids: &[String], at: DateTime<Utc>) -> usize {
        let ids: HashSet<&str> = record_ids.iter().map(String::as_str).collect();
        let mut updated = 0;
        for entry in self
            .records
            .iter_mut()
            .filter(|r| ids.contains(r.record_id.as_str()))
        {
            entry.last_refresh = Some(at);
            updated += 1;
        }
        updated
    }

    pub fn candidates(&self, scope: &str) -> Vec<RefreshCandidate> {
        let mut out: Vec<RefreshCandidate> = self
            .records
            .iter()
            .filter(|r| scope == SCOPE_ALL || r.endpoint == scope)
            .map(ManifestEntry::to_candidate)
            .collect();
        // Highest priority first; within a priority, never-refreshed (None)
        // sorts before any timestamp, then oldest first.
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.last_refresh.cmp(&b.last_refresh))
        });
        out
    }
}

impl CandidateStore for Manifest {
    fn get_refresh_candidates(&self, scope: &str) -> Result<Vec<RefreshCandidate>> {
        if scope.trim().is_empty() {
            return Err(MirrorError::CandidateStore("scope must not be empty".into()));
        }
        Ok(self.candidates(scope))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
