//! Cross-process sliding-window rate limiter.
//!
//! Any number of independent refresh workers share one request budget
//! against the upstream API through a state file guarded by an exclusive
//! advisory lock (see [`state`]). No shared memory, no coordinating server.
//!
//! At most `requests_per_minute` acquisitions are granted in any trailing
//! window across every process that points at the same shared directory.

pub mod state;

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::paths;

pub use state::{RateLimitState, SharedStateFile, StateRead};

/// Sleep between attempts while another process holds the lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lower bound on the back-off when the window is full.
const MIN_WINDOW_WAIT: Duration = Duration::from_millis(10);

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const MAX_ACQUIRE_WAIT: Duration = Duration::from_secs(365 * 86_400);

/// How long `record_request` polls for the lock before giving up.
const RECORD_LOCK_WAIT: Duration = Duration::from_millis(100);

const UTILIZATION_WARNING_PERCENT: f64 = 80.0;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub requests_last_minute: usize,
    pub requests_per_minute: u32,
    pub utilization_percent: f64,
    pub available: usize,
    pub oldest_request_age_seconds: Option<f64>,
    pub newest_request_age_seconds: Option<f64>,
    pub window_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthStatus,
    pub warnings: Vec<String>,
}

enum Attempt {
    Granted,
    WindowFull(Duration),
    Contended,
}

// ---------------------------------------------------------------------------
// CrossProcessRateLimiter
// ---------------------------------------------------------------------------

/// Per-process handle onto the shared rate limit state.
#[derive(Debug, Clone)]
pub struct CrossProcessRateLimiter {
    shared: SharedStateFile,
    requests_per_minute: u32,
    window: Duration,
    default_timeout: Duration,
}

impl CrossProcessRateLimiter {
    pub fn new(shared_dir: impl AsRef<Path>, requests_per_minute: u32) -> Self {
        Self {
            shared: SharedStateFile::new(shared_dir),
            requests_per_minute,
            window: Duration::from_secs(60),
            default_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Build a limiter from config, resolving `shared_dir` against `root`.
    pub fn from_config(root: &Path, cfg: &RateLimitConfig) -> Self {
        Self::new(paths::resolve(root, &cfg.shared_dir), cfg.requests_per_minute)
            .with_window(cfg.window())
            .with_default_timeout(cfg.acquire_timeout())
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn shared(&self) -> &SharedStateFile {
        &self.shared
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn window_secs(&self) -> f64 {
        self.window.as_secs_f64()
    }

    /// Wait for a slot in the shared budget.
    ///
    /// Returns `false` if no slot opened up before `timeout` (or the
    /// configured default) elapsed. Never returns an error: lock and I/O
    /// failures are retried until the deadline.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        let deadline = start
            .checked_add(timeout.unwrap_or(self.default_timeout))
            .unwrap_or_else(|| start + MAX_ACQUIRE_WAIT);
        loop {
            let wait = match self.try_acquire_once() {
                Ok(Attempt::Granted) => return true,
                Ok(Attempt::WindowFull(wait)) => wait.max(MIN_WINDOW_WAIT),
                Ok(Attempt::Contended) => LOCK_POLL_INTERVAL,
                Err(e) => {
                    tracing::warn!(
                        path = %self.shared.lock_path().display(),
                        error = %e,
                        "rate limit lock unavailable; retrying"
                    );
                    LOCK_POLL_INTERVAL
                }
            };
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    requests_per_minute = self.requests_per_minute,
                    "rate limit acquire timed out"
                );
                return false;
            }
            thread::sleep(wait.min(deadline - now));
        }
    }

    fn try_acquire_once(&self) -> std::io::Result<Attempt> {
        let Some(lock) = self.shared.try_lock()? else {
            return Ok(Attempt::Contended);
        };
        let now = now_secs();
        let mut state = self.shared.load(&lock);
        self.prune(&mut state, now);

        if state.len() < self.requests_per_minute as usize {
            state.push(now);
            self.persist(&lock, &mut state, now);
            return Ok(Attempt::Granted);
        }

        let oldest = state.oldest().unwrap_or(now);
        let wait = Duration::try_from_secs_f64((oldest + self.window_secs() - now).max(0.0))
            .unwrap_or(self.window)
            .min(self.window);
        Ok(Attempt::WindowFull(wait))
    }

    /// Prune `state` for `now`, warning about timestamps no clock skew can
    /// explain. Those would otherwise hold the budget shut for every process.
    fn prune(&self, state: &mut RateLimitState, now: f64) {
        let discarded = state.discard_future(now);
        if discarded > 0 {
            tracing::warn!(
                path = %self.shared.state_path().display(),
                discarded,
                "rate limit state holds future timestamps; discarding them"
            );
        }
        state.prune(now, self.window_secs());
    }

    /// Record a request made outside `acquire`, e.g. by a caller that paces
    /// itself. Never rejects and never waits longer than a brief lock poll;
    /// may exceed the budget.
    pub fn record_request(&self) {
        let deadline = Instant::now() + RECORD_LOCK_WAIT;
        let lock = loop {
            match self.shared.try_lock() {
                Ok(Some(lock)) => break lock,
                Ok(None) if Instant::now() < deadline => thread::sleep(LOCK_POLL_INTERVAL),
                Ok(None) => {
                    tracing::warn!("rate limit lock busy; request not recorded");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "rate limit lock unavailable; request not recorded");
                    return;
                }
            }
        };
        let now = now_secs();
        let mut state = self.shared.load(&lock);
        self.prune(&mut state, now);
        state.push(now);
        self.persist(&lock, &mut state, now);
    }

    fn persist(&self, lock: &crate::io::FileLock, state: &mut RateLimitState, now: f64) {
        state.requests_per_minute = Some(self.requests_per_minute);
        state.last_updated = Some(now);
        state.last_writer_pid = Some(std::process::id());
        if let Err(e) = self.shared.store(lock, state) {
            tracing::warn!(
                path = %self.shared.state_path().display(),
                error = %e,
                "failed to persist rate limit state; request not recorded"
            );
        }
    }

    /// Current window occupancy. Read-only: pruning happens on a copy and is
    /// never written back.
    pub fn status(&self) -> RateLimitStatus {
        let state = match self.shared.lock() {
            Ok(lock) => self.shared.load(&lock),
            Err(e) => {
                tracing::warn!(error = %e, "rate limit lock unavailable; reading state unlocked");
                match self.shared.read_unlocked() {
                    StateRead::Loaded(state) => state,
                    _ => RateLimitState::default(),
                }
            }
        };
        self.summarize(state, now_secs())
    }

    fn summarize(&self, mut state: RateLimitState, now: f64) -> RateLimitStatus {
        self.prune(&mut state, now);
        let count = state.len();
        let utilization_percent = if self.requests_per_minute == 0 {
            if count == 0 {
                0.0
            } else {
                100.0
            }
        } else {
            count as f64 / self.requests_per_minute as f64 * 100.0
        };
        RateLimitStatus {
            requests_last_minute: count,
            requests_per_minute: self.requests_per_minute,
            utilization_percent,
            available: (self.requests_per_minute as usize).saturating_sub(count),
            oldest_request_age_seconds: state.oldest().map(|ts| (now - ts).max(0.0)),
            newest_request_age_seconds: state.newest().map(|ts| (now - ts).max(0.0)),
            window_seconds: self.window_secs(),
        }
    }

    /// Clear the shared request history for every cooperating process.
    pub fn reset(&self) -> Result<()> {
        let lock = self.shared.lock()?;
        let state = RateLimitState {
            requests_per_minute: Some(self.requests_per_minute),
            last_updated: Some(now_secs()),
            last_writer_pid: Some(std::process::id()),
            ..Default::default()
        };
        self.shared.store(&lock, &state)?;
        tracing::info!(path = %self.shared.state_path().display(), "rate limit state reset");
        Ok(())
    }

    pub fn health_check(&self) -> HealthReport {
        let mut warnings = Vec::new();
        let mut status = HealthStatus::Healthy;

        if !self.shared.dir().is_dir() {
            warnings.push(format!(
                "shared directory {} does not exist yet; it is created on first use",
                self.shared.dir().display()
            ));
        }

        let state = match self.shared.read_unlocked() {
            StateRead::Loaded(state) => Some(state),
            StateRead::Missing => None,
            StateRead::Corrupt(reason) => {
                status = HealthStatus::Warning;
                warnings.push(format!(
                    "state file {} is corrupted ({reason}); it will be reset on next acquire",
                    self.shared.state_path().display()
                ));
                None
            }
            StateRead::Unreadable(e) => {
                status = HealthStatus::Unhealthy;
                warnings.push(format!(
                    "state file {} is not readable: {e}",
                    self.shared.state_path().display()
                ));
                None
            }
        };

        if self.shared.dir().is_dir() {
            // Opened without `create`: a missing lock file is made on first use.
            match std::fs::OpenOptions::new()
                .append(true)
                .open(self.shared.lock_path())
            {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    status = HealthStatus::Unhealthy;
                    warnings.push(format!(
                        "lock file {} cannot be opened: {e}",
                        self.shared.lock_path().display()
                    ));
                }
            }
        }

        if self.requests_per_minute == 0 {
            status = HealthStatus::Unhealthy;
            warnings.push("requests_per_minute is 0; no request can be admitted".to_string());
        }

        let summary = self.summarize(state.unwrap_or_default(), now_secs());
        if summary.utilization_percent > UTILIZATION_WARNING_PERCENT {
            if status == HealthStatus::Healthy {
                status = HealthStatus::Warning;
            }
            warnings.push(format!(
                "utilization at {:.1}% ({}/{} in the last {}s)",
                summary.utilization_percent,
                summary.requests_last_minute,
                summary.requests_per_minute,
                summary.window_seconds
            ));
        }

        HealthReport {
            healthy: status != HealthStatus::Unhealthy,
            status,
            warnings,
        }
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
