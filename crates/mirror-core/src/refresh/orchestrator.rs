//! Blue-green refresh control loop.
//!
//! One call to [`DataRefreshOrchestrator::run_blue_green_refresh`] walks a
//! single run through the phases in [`RunPhase`]. Readers never see green
//! until `switch_to_green` succeeds, and once `prepare_green_database` has
//! succeeded the run ends either `completed` or `failed` with exactly one
//! rollback attempt behind it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::audit::{self, AuditLog, SESSION_ID_KEY};
use crate::rate_limit::CrossProcessRateLimiter;
use crate::schedule::Schedule;

use super::coordinator::{CandidateStore, IntegrityReport, StoreStats, UpdateCoordinator};
use super::types::{
    Conflict, ConflictReason, DeltaRecord, RefreshCandidate, RunPhase, RunResult, RunStatus,
};

pub const EVENT_REFRESH_START: &str = "blue_green_refresh_start";
pub const EVENT_REFRESH_COMPLETE: &str = "blue_green_refresh_complete";
pub const EVENT_DELTAS_DETECTED: &str = "deltas_detected";
pub const EVENT_RATE_LIMIT_DENIED: &str = "rate_limit_denied";
pub const EVENT_GREEN_PREPARED: &str = "green_prepared";
pub const EVENT_CONFLICT_DETECTED: &str = "conflict_detected";
pub const EVENT_INTEGRITY_CHECKED: &str = "integrity_checked";
pub const EVENT_SWITCHED_TO_GREEN: &str = "switched_to_green";
pub const EVENT_ROLLBACK_COMPLETED: &str = "rollback_completed";
pub const EVENT_ROLLBACK_FAILED: &str = "rollback_failed";

// ---------------------------------------------------------------------------
// RefreshRun
// ---------------------------------------------------------------------------

/// Mutable record of one run while it is in flight.
struct RefreshRun {
    id: Uuid,
    schedule: String,
    scope: String,
    dry_run: bool,
    phase: RunPhase,
    deltas: Vec<DeltaRecord>,
    applied: Vec<String>,
    conflicts: Vec<Conflict>,
    switched_to_green: bool,
    rolled_back: bool,
    rollback_failed: bool,
    integrity: Option<Map<String, Value>>,
    error: Option<String>,
    started_at: DateTime<Utc>,
}

impl RefreshRun {
    fn start(schedule: &str, scope: &str, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule: schedule.to_string(),
            scope: scope.to_string(),
            dry_run,
            phase: RunPhase::Start,
            deltas: Vec::new(),
            applied: Vec::new(),
            conflicts: Vec::new(),
            switched_to_green: false,
            rolled_back: false,
            rollback_failed: false,
            integrity: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    fn advance(&mut self, next: RunPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal refresh transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::debug!(run_id = %self.id, from = ?self.phase, to = ?next, "refresh phase");
        self.phase = next;
    }

    fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!(run_id = %self.id, phase = ?self.phase, error = %error, "refresh run failed");
        self.error = Some(error);
        self.advance(RunPhase::Failed);
    }

    fn status(&self) -> RunStatus {
        match self.phase {
            RunPhase::DryRun => RunStatus::DryRun,
            RunPhase::Completed => RunStatus::Completed,
            _ => RunStatus::Failed,
        }
    }

    fn finish(self) -> RunResult {
        RunResult {
            run_id: self.id,
            status: self.status(),
            schedule: self.schedule,
            scope: self.scope,
            deltas_detected: self.deltas.len(),
            deltas_applied: self.applied.len(),
            conflicts: self.conflicts,
            switched_to_green: self.switched_to_green,
            applied_records: self.applied,
            rolled_back: self.rolled_back,
            rollback_failed: self.rollback_failed,
            integrity: self.integrity,
            error: self.error,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// DataRefreshOrchestrator
// ---------------------------------------------------------------------------

pub struct DataRefreshOrchestrator {
    candidates: Arc<dyn CandidateStore>,
    coordinator: Option<Arc<dyn UpdateCoordinator>>,
    rate_limiter: Option<CrossProcessRateLimiter>,
    acquire_timeout: Option<Duration>,
    audit: Arc<AuditLog>,
}

impl DataRefreshOrchestrator {
    /// An orchestrator with blue-green mode disabled until a coordinator is
    /// attached with [`with_coordinator`](Self::with_coordinator).
    pub fn new(candidates: Arc<dyn CandidateStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            candidates,
            coordinator: None,
            rate_limiter: None,
            acquire_timeout: None,
            audit,
        }
    }

    pub fn with_coordinator(mut self, coordinator: Arc<dyn UpdateCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Gate upstream calls during delta detection on `limiter`. `timeout`
    /// of `None` uses the limiter's default.
    pub fn with_rate_limiter(
        mut self,
        limiter: CrossProcessRateLimiter,
        timeout: Option<Duration>,
    ) -> Self {
        self.rate_limiter = Some(limiter);
        self.acquire_timeout = timeout;
        self
    }

    pub fn blue_green_enabled(&self) -> bool {
        self.coordinator.is_some()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn emit(&self, run_id: Uuid, event: &str, details: Value) {
        let mut details = audit::details(details);
        details.insert(SESSION_ID_KEY.to_string(), json!(run_id.to_string()));
        self.audit.log_event(event, Some(details));
    }

    /// Refresh every stale, upstream-changed record in `scope` through a
    /// green copy of the store.
    ///
    /// Never returns an error: every outcome, including failures, is
    /// reported in the [`RunResult`] and bracketed in the audit log by
    /// `blue_green_refresh_start` / `blue_green_refresh_complete`.
    pub fn run_blue_green_refresh(&self, schedule: &str, scope: &str, dry_run: bool) -> RunResult {
        let mut run = RefreshRun::start(schedule, scope, dry_run);
        tracing::info!(run_id = %run.id, schedule, scope, dry_run, "blue-green refresh starting");
        self.emit(
            run.id,
            EVENT_REFRESH_START,
            json!({ "schedule": schedule, "scope": scope, "dry_run": dry_run }),
        );

        self.drive(&mut run);

        let result = run.finish();
        self.emit(
            result.run_id,
            EVENT_REFRESH_COMPLETE,
            json!({
                "status": result.status,
                "deltas_detected": result.deltas_detected,
                "deltas_applied": result.deltas_applied,
                "conflicts": result.conflicts.len(),
                "switched_to_green": result.switched_to_green,
                "rolled_back": result.rolled_back,
                "error": result.error,
            }),
        );
        tracing::info!(
            run_id = %result.run_id,
            status = %result.status,
            deltas_detected = result.deltas_detected,
            deltas_applied = result.deltas_applied,
            conflicts = result.conflicts.len(),
            "blue-green refresh finished"
        );
        result
    }

    fn drive(&self, run: &mut RefreshRun) {
        let Some(coordinator) = self.coordinator.as_deref() else {
            return run.fail("blue-green refresh is disabled");
        };
        let schedule: Schedule = match run.schedule.parse() {
            Ok(s) => s,
            Err(e) => return run.fail(e.to_string()),
        };

        // -- Detect ----------------------------------------------------------
        run.advance(RunPhase::Detecting);
        let candidates = match self.candidates.get_refresh_candidates(&run.scope) {
            Ok(c) => c,
            Err(e) => return run.fail(format!("candidate selection failed: {e}")),
        };
        match self.detect_deltas(coordinator, &candidates, schedule, run.id) {
            Ok(deltas) => run.deltas = deltas,
            Err(e) => return run.fail(e),
        }
        self.emit(
            run.id,
            EVENT_DELTAS_DETECTED,
            json!({ "candidates": candidates.len(), "count": run.deltas.len() }),
        );

        if run.dry_run {
            return run.advance(RunPhase::DryRun);
        }

        // -- Prepare ---------------------------------------------------------
        run.advance(RunPhase::Preparing);
        match coordinator.prepare_green_database() {
            Ok(true) => {}
            Ok(false) => return run.fail("green database preparation failed"),
            Err(e) => return run.fail(format!("green database preparation failed: {e}")),
        }
        self.emit(run.id, EVENT_GREEN_PREPARED, json!({}));

        // -- Apply -----------------------------------------------------------
        run.advance(RunPhase::Applying);
        self.apply_deltas_to_green(coordinator, run);

        // -- Verify ----------------------------------------------------------
        run.advance(RunPhase::Verifying);
        let report = coordinator.verify_integrity().unwrap_or_else(|e| {
            IntegrityReport::failed(audit::details(json!({ "error": e.to_string() })))
        });
        self.emit(
            run.id,
            EVENT_INTEGRITY_CHECKED,
            json!({ "passed": report.passed, "details": report.details }),
        );
        run.integrity = Some(report.details.clone());
        if !report.passed {
            let detail = Value::Object(report.details);
            return self.rollback(
                coordinator,
                run,
                format!("integrity verification failed: {detail}"),
            );
        }

        // -- Switch ----------------------------------------------------------
        run.advance(RunPhase::Switching);
        match coordinator.switch_to_green() {
            Ok(true) => {}
            Ok(false) => {
                return self.rollback(coordinator, run, "switch to green reported failure".into())
            }
            Err(e) => {
                return self.rollback(coordinator, run, format!("switch to green failed: {e}"))
            }
        }
        run.switched_to_green = true;
        self.emit(run.id, EVENT_SWITCHED_TO_GREEN, json!({}));
        run.advance(RunPhase::Completed);
    }

    /// Stale candidates that the coordinator also reports as changed
    /// upstream. Stale-but-unchanged records are dropped here.
    fn detect_deltas(
        &self,
        coordinator: &dyn UpdateCoordinator,
        candidates: &[RefreshCandidate],
        schedule: Schedule,
        run_id: Uuid,
    ) -> std::result::Result<Vec<DeltaRecord>, String> {
        let now = Utc::now();
        let stale: Vec<&RefreshCandidate> = candidates
            .iter()
            .filter(|c| schedule.is_expired(c.last_refresh, now))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.acquire(self.acquire_timeout) {
                self.emit(
                    run_id,
                    EVENT_RATE_LIMIT_DENIED,
                    json!({ "requests_per_minute": limiter.requests_per_minute() }),
                );
                return Err("rate limit budget exhausted before timeout".to_string());
            }
        }

        let changed: HashSet<String> = coordinator
            .detect_deltas()
            .map_err(|e| format!("delta detection failed: {e}"))?
            .into_iter()
            .collect();

        let mut seen = HashSet::new();
        Ok(stale
            .into_iter()
            .filter(|c| changed.contains(&c.record_id) && seen.insert(c.record_id.clone()))
            .map(|c| DeltaRecord {
                record_id: c.record_id.clone(),
                endpoint: c.endpoint.clone(),
                detected_at: now,
            })
            .collect())
    }

    /// Apply each delta independently. A failing record becomes a conflict
    /// and the remaining records are still applied.
    fn apply_deltas_to_green(&self, coordinator: &dyn UpdateCoordinator, run: &mut RefreshRun) {
        for delta in &run.deltas {
            let ids = [delta.record_id.clone()];
            let conflict = match coordinator.apply_updates(&delta.endpoint, &ids) {
                Ok(rows) if rows > 0 => {
                    run.applied.push(delta.record_id.clone());
                    continue;
                }
                Ok(_) => Conflict {
                    record_id: delta.record_id.clone(),
                    endpoint: delta.endpoint.clone(),
                    reason: ConflictReason::UpdateFailed,
                    error: Some("apply_updates affected no rows".to_string()),
                },
                Err(e) => Conflict {
                    record_id: delta.record_id.clone(),
                    endpoint: delta.endpoint.clone(),
                    reason: ConflictReason::Exception,
                    error: Some(e.to_string()),
                },
            };
            tracing::warn!(
                run_id = %run.id,
                record_id = %conflict.record_id,
                reason = %conflict.reason,
                "delta could not be applied"
            );
            self.emit(
                run.id,
                EVENT_CONFLICT_DETECTED,
                json!({
                    "record_id": conflict.record_id,
                    "endpoint": conflict.endpoint,
                    "reason": conflict.reason,
                    "error": conflict.error,
                }),
            );
            run.conflicts.push(conflict);
        }
    }

    /// Fail the run and make the single rollback attempt. A failed rollback
    /// leaves the store in an unknown state and is reported loudly.
    fn rollback(&self, coordinator: &dyn UpdateCoordinator, run: &mut RefreshRun, reason: String) {
        debug_assert!(run.phase.requires_rollback_on_failure());
        let outcome = match coordinator.rollback_to_blue() {
            Ok(true) => Ok(()),
            Ok(false) => Err("rollback_to_blue reported failure".to_string()),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(()) => {
                run.rolled_back = true;
                self.emit(run.id, EVENT_ROLLBACK_COMPLETED, json!({ "reason": reason }));
                run.fail(reason);
            }
            Err(rollback_error) => {
                tracing::error!(
                    run_id = %run.id,
                    reason = %reason,
                    error = %rollback_error,
                    "rollback to blue failed; store may be inconsistent"
                );
                run.rollback_failed = true;
                self.emit(
                    run.id,
                    EVENT_ROLLBACK_FAILED,
                    json!({ "reason": reason, "error": rollback_error }),
                );
                run.fail(format!("{reason}; rollback failed: {rollback_error}"));
            }
        }
    }

    /// Status of the blue/green store pair.
    ///
    /// Disabled mode reports only `enabled: false`. Coordinator errors are
    /// captured in the result rather than returned.
    pub fn store_stats(&self) -> StoreStats {
        let Some(coordinator) = self.coordinator.as_deref() else {
            return StoreStats::disabled();
        };
        match coordinator.get_status() {
            Ok(status) => StoreStats::from_status(status),
            Err(e) => StoreStats::from_error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MirrorError, Result};
    use crate::refresh::coordinator::CoordinatorStatus;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // -- Fakes ---------------------------------------------------------------

    struct FixedCandidates(Vec<RefreshCandidate>);

    impl CandidateStore for FixedCandidates {
        fn get_refresh_candidates(&self, _scope: &str) -> Result<Vec<RefreshCandidate>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeCoordinator {
        calls: Mutex<Vec<String>>,
        changed: Vec<String>,
        prepare_ok: Option<bool>,
        zero_rows_for: Vec<String>,
        raise_for: Vec<String>,
        integrity_fails: bool,
        switch_raises: bool,
        rollback_fails: bool,
        status_raises: bool,
    }

    impl FakeCoordinator {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(call)).count()
        }
    }

    impl UpdateCoordinator for FakeCoordinator {
        fn prepare_green_database(&self) -> Result<bool> {
            self.record("prepare_green_database");
            Ok(self.prepare_ok.unwrap_or(true))
        }

        fn detect_deltas(&self) -> Result<Vec<String>> {
            self.record("detect_deltas");
            Ok(self.changed.clone())
        }

        fn apply_updates(&self, endpoint: &str, record_ids: &[String]) -> Result<usize> {
            self.record(&format!("apply_updates:{endpoint}:{}", record_ids.join(",")));
            let id = &record_ids[0];
            if self.raise_for.contains(id) {
                return Err(MirrorError::Coordinator(format!("deadlock on {id}")));
            }
            if self.zero_rows_for.contains(id) {
                return Ok(0);
            }
            Ok(record_ids.len())
        }

        fn verify_integrity(&self) -> Result<IntegrityReport> {
            self.record("verify_integrity");
            if self.integrity_fails {
                Ok(IntegrityReport::failed(audit::details(
                    json!({ "orphaned_rows": 4 }),
                )))
            } else {
                Ok(IntegrityReport::passed(Map::new()))
            }
        }

        fn switch_to_green(&self) -> Result<bool> {
            self.record("switch_to_green");
            if self.switch_raises {
                return Err(MirrorError::Coordinator("connection reset".into()));
            }
            Ok(true)
        }

        fn rollback_to_blue(&self) -> Result<bool> {
            self.record("rollback_to_blue");
            Ok(!self.rollback_fails)
        }

        fn get_status(&self) -> Result<CoordinatorStatus> {
            self.record("get_status");
            if self.status_raises {
                return Err(MirrorError::Coordinator("pool exhausted".into()));
            }
            Ok(CoordinatorStatus {
                active_db: "blue".into(),
                connection_pool: None,
                table_sizes: BTreeMap::from([("patents".to_string(), 12)]),
                last_refresh: None,
            })
        }
    }

    fn stale(id: &str) -> RefreshCandidate {
        RefreshCandidate {
            record_id: id.to_string(),
            endpoint: "patents".to_string(),
            last_refresh: Some(Utc::now() - chrono::Duration::days(3)),
            priority: 0,
        }
    }

    fn fresh(id: &str) -> RefreshCandidate {
        RefreshCandidate {
            last_refresh: Some(Utc::now()),
            ..stale(id)
        }
    }

    fn orchestrator(
        candidates: Vec<RefreshCandidate>,
        coordinator: &Arc<FakeCoordinator>,
    ) -> DataRefreshOrchestrator {
        DataRefreshOrchestrator::new(
            Arc::new(FixedCandidates(candidates)),
            Arc::new(AuditLog::in_memory()),
        )
        .with_coordinator(Arc::clone(coordinator) as Arc<dyn UpdateCoordinator>)
    }

    fn events(orch: &DataRefreshOrchestrator) -> Vec<String> {
        orch.audit()
            .entries(None)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect()
    }

    // -- Scenarios -----------------------------------------------------------

    #[test]
    fn no_candidates_completes_with_only_blue_green_calls() {
        let coord = Arc::new(FakeCoordinator::default());
        let orch = orchestrator(vec![], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.deltas_detected, 0);
        assert!(result.switched_to_green);
        assert_eq!(
            coord.calls(),
            vec!["prepare_green_database", "verify_integrity", "switch_to_green"]
        );
    }

    #[test]
    fn stale_but_unchanged_record_is_not_a_delta() {
        let coord = Arc::new(FakeCoordinator::default());
        let orch = orchestrator(vec![stale("P000001")], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.deltas_detected, 0);
        assert_eq!(coord.count("detect_deltas"), 1);
        assert_eq!(coord.count("apply_updates"), 0);
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[test]
    fn changed_but_fresh_record_is_not_a_delta() {
        let coord = Arc::new(FakeCoordinator {
            changed: vec!["P000001".into()],
            ..Default::default()
        });
        let orch = orchestrator(vec![fresh("P000001")], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.deltas_detected, 0);
        assert_eq!(coord.count("detect_deltas"), 0, "nothing stale, no upstream call");
    }

    #[test]
    fn zero_rows_is_update_failed_conflict() {
        let coord = Arc::new(FakeCoordinator {
            changed: vec!["P000001".into()],
            zero_rows_for: vec!["P000001".into()],
            ..Default::default()
        });
        let orch = orchestrator(vec![stale("P000001")], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].record_id, "P000001");
        assert_eq!(result.conflicts[0].reason, ConflictReason::UpdateFailed);
        assert_eq!(result.deltas_applied, 0);
    }

    #[test]
    fn one_raising_apply_does_not_abort_the_batch() {
        let coord = Arc::new(FakeCoordinator {
            changed: vec!["P1".into(), "P2".into(), "P3".into()],
            raise_for: vec!["P2".into()],
            ..Default::default()
        });
        let orch = orchestrator(vec![stale("P1"), stale("P2"), stale("P3")], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.deltas_detected, 3);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].reason, ConflictReason::Exception);
        assert!(result.conflicts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("deadlock on P2"));
        assert_eq!(result.deltas_applied, 2);
        assert_eq!(result.applied_records, vec!["P1", "P3"]);
        assert_eq!(coord.count("apply_updates"), 3);
        assert_eq!(coord.count("verify_integrity"), 1);
        assert!(events(&orch).contains(&EVENT_CONFLICT_DETECTED.to_string()));
    }

    #[test]
    fn dry_run_never_writes() {
        let coord = Arc::new(FakeCoordinator {
            changed: vec!["P1".into(), "P2".into()],
            ..Default::default()
        });
        let orch = orchestrator(vec![stale("P1"), stale("P2")], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", true);

        assert_eq!(result.status, RunStatus::DryRun);
        assert_eq!(result.deltas_detected, 2);
        assert_eq!(coord.calls(), vec!["detect_deltas"]);
        assert!(!result.switched_to_green);
    }

    #[test]
    fn failed_integrity_rolls_back_once() {
        let coord = Arc::new(FakeCoordinator {
            integrity_fails: true,
            ..Default::default()
        });
        let orch = orchestrator(vec![], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(coord.count("rollback_to_blue"), 1);
        assert_eq!(coord.count("switch_to_green"), 0);
        assert!(result.rolled_back);
        assert!(result.error.as_deref().unwrap().contains("orphaned_rows"));
        assert!(!result.switched_to_green);
    }

    #[test]
    fn raising_switch_rolls_back_once() {
        let coord = Arc::new(FakeCoordinator {
            switch_raises: true,
            ..Default::default()
        });
        let orch = orchestrator(vec![], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(coord.count("rollback_to_blue"), 1);
        assert!(result.error.as_deref().unwrap().contains("connection reset"));
        assert!(!result.switched_to_green);
    }

    #[test]
    fn failed_prepare_skips_rollback() {
        let coord = Arc::new(FakeCoordinator {
            changed: vec!["P1".into()],
            prepare_ok: Some(false),
            ..Default::default()
        });
        let orch = orchestrator(vec![stale("P1")], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(coord.count("rollback_to_blue"), 0);
        assert_eq!(coord.count("apply_updates"), 0);
    }

    #[test]
    fn failed_rollback_is_reported() {
        let coord = Arc::new(FakeCoordinator {
            integrity_fails: true,
            rollback_fails: true,
            ..Default::default()
        });
        let orch = orchestrator(vec![], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.rollback_failed);
        assert!(!result.rolled_back);
        assert_eq!(coord.count("rollback_to_blue"), 1);
        assert!(result.error.as_deref().unwrap().contains("rollback failed"));
        assert!(events(&orch).contains(&EVENT_ROLLBACK_FAILED.to_string()));
    }

    #[test]
    fn every_run_is_bracketed_in_the_audit_log() {
        let coord = Arc::new(FakeCoordinator {
            switch_raises: true,
            ..Default::default()
        });
        let orch = orchestrator(vec![], &coord);

        let result = orch.run_blue_green_refresh("daily", "all", false);
        let session = result.run_id.to_string();
        let entries = orch.audit().entries(Some(&session)).unwrap();

        assert_eq!(entries.first().unwrap().event, EVENT_REFRESH_START);
        assert_eq!(entries.last().unwrap().event, EVENT_REFRESH_COMPLETE);
        assert_eq!(entries.last().unwrap().details["status"], json!("failed"));
    }

    #[test]
    fn invalid_schedule_fails_before_touching_the_store() {
        let coord = Arc::new(FakeCoordinator::default());
        let orch = orchestrator(vec![stale("P1")], &coord);

        let result = orch.run_blue_green_refresh("whenever", "all", false);

        assert_eq!(result.status, RunStatus::Failed);
        assert!(coord.calls().is_empty());
        let events = events(&orch);
        assert_eq!(events, vec![EVENT_REFRESH_START, EVENT_REFRESH_COMPLETE]);
    }

    #[test]
    fn disabled_blue_green_run_fails_cleanly() {
        let orch = DataRefreshOrchestrator::new(
            Arc::new(FixedCandidates(vec![stale("P1")])),
            Arc::new(AuditLog::in_memory()),
        );
        let result = orch.run_blue_green_refresh("daily", "all", false);
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("disabled"));
    }

    #[test]
    fn exhausted_rate_limit_fails_before_prepare() {
        let dir = TempDir::new().unwrap();
        let limiter = CrossProcessRateLimiter::new(dir.path(), 1);
        assert!(limiter.acquire(Some(Duration::ZERO)));

        let coord = Arc::new(FakeCoordinator {
            changed: vec!["P1".into()],
            ..Default::default()
        });
        let orch = orchestrator(vec![stale("P1")], &coord)
            .with_rate_limiter(limiter, Some(Duration::from_millis(20)));

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("rate limit"));
        assert!(coord.calls().is_empty());
        assert!(events(&orch).contains(&EVENT_RATE_LIMIT_DENIED.to_string()));
    }

    #[test]
    fn detection_consumes_rate_limit_budget() {
        let dir = TempDir::new().unwrap();
        let limiter = CrossProcessRateLimiter::new(dir.path(), 5);
        let coord = Arc::new(FakeCoordinator {
            changed: vec!["P1".into()],
            ..Default::default()
        });
        let orch = orchestrator(vec![stale("P1")], &coord)
            .with_rate_limiter(limiter.clone(), Some(Duration::ZERO));

        let result = orch.run_blue_green_refresh("daily", "all", false);

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(limiter.status().requests_last_minute, 1);
    }

    // -- Stats ---------------------------------------------------------------

    #[test]
    fn stats_when_disabled_is_exactly_enabled_false() {
        let orch = DataRefreshOrchestrator::new(
            Arc::new(FixedCandidates(vec![])),
            Arc::new(AuditLog::in_memory()),
        );
        let stats = serde_json::to_value(orch.store_stats()).unwrap();
        assert_eq!(stats, json!({ "enabled": false }));
    }

    #[test]
    fn stats_surface_coordinator_status() {
        let coord = Arc::new(FakeCoordinator::default());
        let orch = orchestrator(vec![], &coord);
        let stats = orch.store_stats();
        assert!(stats.enabled);
        assert_eq!(stats.active_db.as_deref(), Some("blue"));
        assert_eq!(stats.table_sizes.unwrap()["patents"], 12);
        assert_eq!(coord.count("get_status"), 1);
    }

    #[test]
    fn stats_capture_coordinator_errors() {
        let coord = Arc::new(FakeCoordinator {
            status_raises: true,
            ..Default::default()
        });
        let orch = orchestrator(vec![], &coord);
        let stats = serde_json::to_value(orch.store_stats()).unwrap();
        assert_eq!(
            stats,
            json!({ "enabled": true, "error": "coordinator error: pool exhausted" })
        );
    }
}
