//! File-resident rate limit state shared by cooperating processes.
//!
//! Two files live in the shared directory:
//!
//! ```text
//! rate_limit_state.json   { "timestamps": [f64, ...], ...metadata }
//! rate_limit_state.lock   empty; flock(LOCK_EX) target
//! ```
//!
//! Every read-modify-write of the JSON file happens while holding an
//! exclusive advisory lock on the lock file. The JSON file itself is only
//! ever replaced via temp-file-then-rename, so a reader that bypasses the
//! lock still never sees a torn write.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::io::FileLock;
use crate::paths;

/// How far ahead of the local clock a peer's timestamp may be before it is
/// treated as garbage.
pub const MAX_CLOCK_SKEW_SECS: f64 = 5.0;

// ---------------------------------------------------------------------------
// RateLimitState
// ---------------------------------------------------------------------------

/// Request history within the sliding window, as persisted on disk.
///
/// Timestamps are Unix seconds with fractional part, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    #[serde(default)]
    pub timestamps: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_writer_pid: Option<u32>,
}

impl RateLimitState {
    /// Drop every timestamp that has left the window ending at `now`, and
    /// any from further in the future than clock skew explains. Returns how
    /// many were removed.
    pub fn prune(&mut self, now: f64, window_secs: f64) -> usize {
        let future = self.discard_future(now);
        let before = self.timestamps.len();
        self.timestamps.retain(|ts| now - ts < window_secs);
        future + before - self.timestamps.len()
    }

    /// Drop timestamps more than [`MAX_CLOCK_SKEW_SECS`] ahead of `now`.
    pub fn discard_future(&mut self, now: f64) -> usize {
        let before = self.timestamps.len();
        self.timestamps.retain(|ts| *ts <= now + MAX_CLOCK_SKEW_SECS);
        before - self.timestamps.len()
    }

    pub fn push(&mut self, now: f64) {
        // Clocks of cooperating processes may disagree slightly; keep the
        // list ordered so `oldest` stays cheap and accurate.
        let idx = self.timestamps.partition_point(|ts| *ts <= now);
        self.timestamps.insert(idx, now);
    }

    pub fn oldest(&self) -> Option<f64> {
        self.timestamps.first().copied()
    }

    pub fn newest(&self) -> Option<f64> {
        self.timestamps.last().copied()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// StateRead
// ---------------------------------------------------------------------------

/// Outcome of reading the state file, before any degrade-to-empty policy.
#[derive(Debug)]
pub enum StateRead {
    Missing,
    Loaded(RateLimitState),
    Corrupt(String),
    Unreadable(io::Error),
}

// ---------------------------------------------------------------------------
// SharedStateFile
// ---------------------------------------------------------------------------

/// The state file + lock file pair at a shared directory.
#[derive(Debug, Clone)]
pub struct SharedStateFile {
    dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl SharedStateFile {
    pub fn new(shared_dir: impl AsRef<Path>) -> Self {
        let dir = shared_dir.as_ref().to_path_buf();
        Self {
            state_path: paths::rate_limit_state_path(&dir),
            lock_path: paths::rate_limit_lock_path(&dir),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Take the exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` when another process currently holds it.
    pub fn try_lock(&self) -> io::Result<Option<FileLock>> {
        FileLock::try_exclusive(&self.lock_path)
    }

    /// Take the exclusive lock, blocking until it is available.
    pub fn lock(&self) -> io::Result<FileLock> {
        FileLock::exclusive(&self.lock_path)
    }

    /// Read the state file. Callers are expected to hold the lock.
    pub fn read(&self, _lock: &FileLock) -> StateRead {
        self.read_unlocked()
    }

    pub(crate) fn read_unlocked(&self) -> StateRead {
        let data = match std::fs::read(&self.state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return StateRead::Missing,
            Err(e) => return StateRead::Unreadable(e),
        };
        match serde_json::from_slice::<RateLimitState>(&data) {
            Ok(state) if state.timestamps.iter().all(|ts| ts.is_finite()) => {
                StateRead::Loaded(state)
            }
            Ok(_) => StateRead::Corrupt("non-finite timestamp".to_string()),
            Err(e) => StateRead::Corrupt(e.to_string()),
        }
    }

    /// Read the state, treating anything but a clean parse as empty.
    ///
    /// A corrupted or unreadable file must not wedge every cooperating
    /// process, so it is reset instead of surfaced.
    pub fn load(&self, lock: &FileLock) -> RateLimitState {
        match self.read(lock) {
            StateRead::Loaded(state) => state,
            StateRead::Missing => RateLimitState::default(),
            StateRead::Corrupt(reason) => {
                tracing::warn!(
                    path = %self.state_path.display(),
                    reason = %reason,
                    "rate limit state corrupted; resetting"
                );
                RateLimitState::default()
            }
            StateRead::Unreadable(e) => {
                tracing::warn!(
                    path = %self.state_path.display(),
                    error = %e,
                    "rate limit state unreadable; treating as empty"
                );
                RateLimitState::default()
            }
        }
    }

    /// Persist `state` atomically. Callers are expected to hold the lock.
    pub fn store(&self, _lock: &FileLock, state: &RateLimitState) -> crate::Result<()> {
        let data = serde_json::to_vec_pretty(state)?;
        crate::io::atomic_write(&self.state_path, &data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
