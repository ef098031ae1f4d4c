use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Candidates and deltas
// ---------------------------------------------------------------------------

/// A mirrored record that may be due for a refresh check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshCandidate {
    pub record_id: String,
    /// Upstream endpoint the record is fetched from.
    pub endpoint: String,
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
}

/// A candidate confirmed to have changed upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub record_id: String,
    pub endpoint: String,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conflict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// `apply_updates` reported no affected rows.
    UpdateFailed,
    /// `apply_updates` returned an error.
    Exception,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateFailed => "update_failed",
            Self::Exception => "exception",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delta that could not be applied. Reported, never resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub record_id: String,
    pub endpoint: String,
    pub reason: ConflictReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// RunPhase
// ---------------------------------------------------------------------------

/// Position of a refresh run in the blue-green sequence.
///
/// ```text
/// Start → Detecting → DryRun
///                   → Preparing → Applying → Verifying → Switching → Completed
/// ```
/// `Failed` is reachable from every non-terminal phase except `Applying`:
/// per-record apply failures become conflicts, and the run always goes on to
/// verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Start,
    Detecting,
    DryRun,
    Preparing,
    Applying,
    Verifying,
    Switching,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Start, Detecting)
                | (Start, Failed)
                | (Detecting, DryRun)
                | (Detecting, Preparing)
                | (Detecting, Failed)
                | (Preparing, Applying)
                | (Preparing, Failed)
                | (Applying, Verifying)
                | (Verifying, Switching)
                | (Verifying, Failed)
                | (Switching, Completed)
                | (Switching, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DryRun | Self::Completed | Self::Failed)
    }

    /// Phases after which the green copy may hold partial writes.
    pub fn requires_rollback_on_failure(self) -> bool {
        matches!(self, Self::Verifying | Self::Switching)
    }
}

// ---------------------------------------------------------------------------
// RunStatus / RunResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    DryRun,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of one `run_blue_green_refresh` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub schedule: String,
    pub scope: String,
    pub deltas_detected: usize,
    pub deltas_applied: usize,
    pub conflicts: Vec<Conflict>,
    pub switched_to_green: bool,
    /// Record ids that made it into green, for catalogs that track
    /// per-record freshness.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_records: Vec<String>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rollback_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        use RunPhase::*;
        let path = [
            Start, Detecting, Preparing, Applying, Verifying, Switching, Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn applying_cannot_fail_directly() {
        assert!(!RunPhase::Applying.can_advance_to(RunPhase::Failed));
        assert!(!RunPhase::Start.can_advance_to(RunPhase::Preparing));
        assert!(!RunPhase::DryRun.can_advance_to(RunPhase::Preparing));
    }

    #[test]
    fn rollback_only_after_green_written() {
        assert!(RunPhase::Verifying.requires_rollback_on_failure());
        assert!(RunPhase::Switching.requires_rollback_on_failure());
        assert!(!RunPhase::Preparing.requires_rollback_on_failure());
        assert!(!RunPhase::Detecting.requires_rollback_on_failure());
    }

    #[test]
    fn conflict_reason_serializes_snake_case() {
        let json = serde_json::to_value(ConflictReason::UpdateFailed).unwrap();
        assert_eq!(json, serde_json::json!("update_failed"));
        assert_eq!(RunStatus::DryRun.to_string(), "dry_run");
    }
}
