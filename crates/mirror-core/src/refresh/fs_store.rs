//! Directory-backed blue/green store.
//!
//! Layout under the store directory:
//!
//! ```text
//! store/
//!   active.json               { "active_db": "blue" | "green", ... }
//!   blue/<endpoint>/<id>.json
//!   green/<endpoint>/<id>.json
//! ```
//!
//! Readers resolve `active.json` and read only from the slot it names.
//! Staging always happens in the other slot, and the cutover is a single
//! atomic rewrite of `active.json`. A writer holds an exclusive lock on
//! `store/.lock` from prepare until switch or rollback, so only one process
//! stages at a time. Upstream records are read from an export
//! directory with the same `<endpoint>/<id>.json` shape.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::audit;
use crate::error::{MirrorError, Result};
use crate::io::{self, FileLock};
use crate::paths;

use super::coordinator::{CoordinatorStatus, IntegrityReport, UpdateCoordinator};

const RECORD_EXT: &str = "json";
const STORE_LOCK_FILE: &str = ".lock";

// ---------------------------------------------------------------------------
// Slot / ActivePointer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Blue,
    Green,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePointer {
    pub active_db: Slot,
    #[serde(default)]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub switched_at: Option<DateTime<Utc>>,
}

impl Default for ActivePointer {
    fn default() -> Self {
        Self {
            active_db: Slot::Blue,
            last_refresh: None,
            switched_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DirectoryCoordinator
// ---------------------------------------------------------------------------

/// A staging pass in progress: the slot that was live at prepare time and
/// the store lock held until the pass ends.
struct Staging {
    live: Slot,
    lock: FileLock,
}

pub struct DirectoryCoordinator {
    store_dir: PathBuf,
    upstream_dir: PathBuf,
    /// `Some` between a successful prepare and the end of the run.
    staging: Mutex<Option<Staging>>,
}

impl DirectoryCoordinator {
    pub fn new(store_dir: impl Into<PathBuf>, upstream_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            upstream_dir: upstream_dir.into(),
            staging: Mutex::new(None),
        }
    }

    /// Create the live slot and pointer if they do not exist yet.
    pub fn init(&self) -> Result<()> {
        io::ensure_dir(&self.slot_dir(Slot::Blue))?;
        let pointer = serde_json::to_vec_pretty(&ActivePointer::default())?;
        io::write_if_missing(&self.pointer_path(), &pointer)?;
        Ok(())
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.store_dir.join(paths::ACTIVE_POINTER_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.store_dir.join(STORE_LOCK_FILE)
    }

    pub fn slot_dir(&self, slot: Slot) -> PathBuf {
        self.store_dir.join(slot.as_str())
    }

    pub fn read_pointer(&self) -> Result<ActivePointer> {
        match std::fs::read(self.pointer_path()) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ActivePointer::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_pointer(&self, pointer: &ActivePointer) -> Result<()> {
        let data = serde_json::to_vec_pretty(pointer)?;
        io::atomic_write(&self.pointer_path(), &data)
    }

    /// Path of the live copy of a record, as a reader would resolve it.
    pub fn live_record_path(&self, endpoint: &str, record_id: &str) -> Result<PathBuf> {
        let live = self.read_pointer()?.active_db;
        Ok(record_path(&self.slot_dir(live), endpoint, record_id))
    }

    fn staging_state(&self) -> Result<MutexGuard<'_, Option<Staging>>> {
        self.staging
            .lock()
            .map_err(|_| MirrorError::Coordinator("coordinator state poisoned".into()))
    }

    fn prepared(&self) -> Result<Option<Slot>> {
        Ok(self.staging_state()?.as_ref().map(|s| s.live))
    }

    /// End the staging pass and release the store lock.
    fn finish_staging(&self) -> Result<()> {
        self.staging_state()?.take();
        Ok(())
    }

    fn staging_dir(&self) -> Result<PathBuf> {
        let live = self
            .prepared()?
            .ok_or_else(|| MirrorError::Coordinator("green database has not been prepared".into()))?;
        Ok(self.slot_dir(live.other()))
    }
}

fn record_path(slot_dir: &Path, endpoint: &str, record_id: &str) -> PathBuf {
    slot_dir
        .join(endpoint)
        .join(format!("{record_id}.{RECORD_EXT}"))
}

/// `(endpoint, record_id, path)` for every record under `dir`.
fn list_records(dir: &Path) -> Result<Vec<(String, String, PathBuf)>> {
    let mut records = Vec::new();
    if !dir.is_dir() {
        return Ok(records);
    }
    for endpoint in std::fs::read_dir(dir)? {
        let endpoint = endpoint?;
        if !endpoint.file_type()?.is_dir() {
            continue;
        }
        let endpoint_name = endpoint.file_name().to_string_lossy().into_owned();
        for file in std::fs::read_dir(endpoint.path())? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                records.push((endpoint_name.clone(), stem.to_string(), path.clone()));
            }
        }
    }
    records.sort();
    Ok(records)
}

fn digest_file(path: &Path) -> Result<Option<[u8; 32]>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(Sha256::digest(&data).into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl UpdateCoordinator for DirectoryCoordinator {
    fn prepare_green_database(&self) -> Result<bool> {
        let mut state = self.staging_state()?;
        let lock = match state.take() {
            Some(previous) => previous.lock,
            None => match FileLock::try_exclusive(&self.lock_path())? {
                Some(lock) => lock,
                None => {
                    tracing::warn!(
                        lock = %self.lock_path().display(),
                        "another process is staging into this store"
                    );
                    return Ok(false);
                }
            },
        };
        let live = self.read_pointer()?.active_db;
        let staging = self.slot_dir(live.other());
        io::remove_dir_if_exists(&staging)?;
        io::copy_dir(&self.slot_dir(live), &staging)?;
        *state = Some(Staging { live, lock });
        tracing::info!(live = live.as_str(), staging = %staging.display(), "green copy prepared");
        Ok(true)
    }

    fn detect_deltas(&self) -> Result<Vec<String>> {
        if !self.upstream_dir.is_dir() {
            return Err(MirrorError::Coordinator(format!(
                "upstream export not found at {}",
                self.upstream_dir.display()
            )));
        }
        let live_dir = self.slot_dir(self.read_pointer()?.active_db);
        let mut changed = Vec::new();
        for (endpoint, record_id, upstream_path) in list_records(&self.upstream_dir)? {
            let upstream = digest_file(&upstream_path)?;
            let live = digest_file(&record_path(&live_dir, &endpoint, &record_id))?;
            if upstream != live {
                changed.push(record_id);
            }
        }
        Ok(changed)
    }

    fn apply_updates(&self, endpoint: &str, record_ids: &[String]) -> Result<usize> {
        paths::validate_record_id(endpoint)?;
        let staging = self.staging_dir()?;
        let mut applied = 0;
        for record_id in record_ids {
            paths::validate_record_id(record_id)?;
            let source = record_path(&self.upstream_dir, endpoint, record_id);
            let data = match std::fs::read(&source) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            io::atomic_write(&record_path(&staging, endpoint, record_id), &data)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn verify_integrity(&self) -> Result<IntegrityReport> {
        let staging = self.staging_dir()?;
        let live_dir = self.slot_dir(self.read_pointer()?.active_db);

        let staged = list_records(&staging)?;
        let live_count = list_records(&live_dir)?.len();
        let invalid: Vec<String> = staged
            .iter()
            .filter(|(_, _, path)| {
                std::fs::read(path)
                    .ok()
                    .and_then(|data| serde_json::from_slice::<serde_json::Value>(&data).ok())
                    .is_none()
            })
            .map(|(endpoint, id, _)| format!("{endpoint}/{id}"))
            .collect();

        let details = audit::details(json!({
            "staging_records": staged.len(),
            "live_records": live_count,
            "invalid_records": invalid,
        }));
        if invalid.is_empty() && staged.len() >= live_count {
            Ok(IntegrityReport::passed(details))
        } else {
            Ok(IntegrityReport::failed(details))
        }
    }

    fn switch_to_green(&self) -> Result<bool> {
        let live = self
            .prepared()?
            .ok_or_else(|| MirrorError::Coordinator("green database has not been prepared".into()))?;
        let now = Utc::now();
        self.write_pointer(&ActivePointer {
            active_db: live.other(),
            last_refresh: Some(now),
            switched_at: Some(now),
        })?;
        self.finish_staging()?;
        tracing::info!(active = live.other().as_str(), "switched readers to green");
        Ok(true)
    }

    fn rollback_to_blue(&self) -> Result<bool> {
        let Some(live) = self.prepared()? else {
            // Nothing was staged; readers are already on the live slot.
            return Ok(true);
        };
        let mut pointer = self.read_pointer()?;
        if pointer.active_db != live {
            pointer.active_db = live;
            pointer.switched_at = Some(Utc::now());
            self.write_pointer(&pointer)?;
        }
        io::remove_dir_if_exists(&self.slot_dir(live.other()))?;
        self.finish_staging()?;
        tracing::info!(active = live.as_str(), "rolled back to previous copy");
        Ok(true)
    }

    fn get_status(&self) -> Result<CoordinatorStatus> {
        let pointer = self.read_pointer()?;
        let mut table_sizes = BTreeMap::new();
        for (endpoint, _, _) in list_records(&self.slot_dir(pointer.active_db))? {
            *table_sizes.entry(endpoint).or_insert(0u64) += 1;
        }
        Ok(CoordinatorStatus {
            active_db: pointer.active_db.as_str().to_string(),
            connection_pool: None,
            table_sizes,
            last_refresh: pointer.last_refresh,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        upstream: PathBuf,
        coord: DirectoryCoordinator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream");
        std::fs::create_dir_all(&upstream).unwrap();
        let coord = DirectoryCoordinator::new(dir.path().join("store"), &upstream);
        coord.init().unwrap();
        Fixture {
            _dir: dir,
            upstream,
            coord,
        }
    }

    fn put(dir: &Path, endpoint: &str, id: &str, body: &str) {
        let path = record_path(dir, endpoint, id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn detect_reports_new_and_changed_records() {
        let f = fixture();
        put(&f.coord.slot_dir(Slot::Blue), "patents", "P1", r#"{"v":1}"#);
        put(&f.coord.slot_dir(Slot::Blue), "patents", "P2", r#"{"v":1}"#);
        put(&f.upstream, "patents", "P1", r#"{"v":1}"#);
        put(&f.upstream, "patents", "P2", r#"{"v":2}"#);
        put(&f.upstream, "patents", "P3", r#"{"v":1}"#);

        assert_eq!(f.coord.detect_deltas().unwrap(), vec!["P2", "P3"]);
    }

    #[test]
    fn full_cycle_switches_readers() {
        let f = fixture();
        put(&f.coord.slot_dir(Slot::Blue), "patents", "P1", r#"{"v":1}"#);
        put(&f.upstream, "patents", "P1", r#"{"v":2}"#);

        assert!(f.coord.prepare_green_database().unwrap());
        assert_eq!(
            f.coord.apply_updates("patents", &["P1".to_string()]).unwrap(),
            1
        );
        // Readers still see blue until the switch.
        let live = f.coord.live_record_path("patents", "P1").unwrap();
        assert_eq!(std::fs::read_to_string(&live).unwrap(), r#"{"v":1}"#);

        assert!(f.coord.verify_integrity().unwrap().passed);
        assert!(f.coord.switch_to_green().unwrap());

        let live = f.coord.live_record_path("patents", "P1").unwrap();
        assert_eq!(std::fs::read_to_string(&live).unwrap(), r#"{"v":2}"#);
        let status = f.coord.get_status().unwrap();
        assert_eq!(status.active_db, "green");
        assert_eq!(status.table_sizes["patents"], 1);
        assert!(status.last_refresh.is_some());
        assert!(f.coord.detect_deltas().unwrap().is_empty());
    }

    #[test]
    fn apply_of_missing_upstream_record_affects_nothing() {
        let f = fixture();
        f.coord.prepare_green_database().unwrap();
        assert_eq!(
            f.coord.apply_updates("patents", &["P9".to_string()]).unwrap(),
            0
        );
    }

    #[test]
    fn apply_before_prepare_is_an_error() {
        let f = fixture();
        put(&f.upstream, "patents", "P1", "{}");
        assert!(f.coord.apply_updates("patents", &["P1".to_string()]).is_err());
    }

    #[test]
    fn apply_rejects_path_like_ids() {
        let f = fixture();
        f.coord.prepare_green_database().unwrap();
        assert!(f
            .coord
            .apply_updates("patents", &["../escape".to_string()])
            .is_err());
    }

    #[test]
    fn invalid_staged_record_fails_integrity() {
        let f = fixture();
        put(&f.upstream, "patents", "P1", "{not json");
        f.coord.prepare_green_database().unwrap();
        f.coord.apply_updates("patents", &["P1".to_string()]).unwrap();

        let report = f.coord.verify_integrity().unwrap();
        assert!(!report.passed);
        assert_eq!(report.details["invalid_records"], json!(["patents/P1"]));
    }

    #[test]
    fn rollback_discards_green_and_keeps_blue() {
        let f = fixture();
        put(&f.coord.slot_dir(Slot::Blue), "patents", "P1", r#"{"v":1}"#);
        put(&f.upstream, "patents", "P1", r#"{"v":2}"#);
        f.coord.prepare_green_database().unwrap();
        f.coord.apply_updates("patents", &["P1".to_string()]).unwrap();

        assert!(f.coord.rollback_to_blue().unwrap());

        assert!(!f.coord.slot_dir(Slot::Green).exists());
        assert_eq!(f.coord.read_pointer().unwrap().active_db, Slot::Blue);
        let live = f.coord.live_record_path("patents", "P1").unwrap();
        assert_eq!(std::fs::read_to_string(&live).unwrap(), r#"{"v":1}"#);
    }

    #[test]
    fn second_cycle_stages_into_blue() {
        let f = fixture();
        put(&f.upstream, "patents", "P1", r#"{"v":1}"#);
        f.coord.prepare_green_database().unwrap();
        f.coord.apply_updates("patents", &["P1".to_string()]).unwrap();
        f.coord.switch_to_green().unwrap();

        put(&f.upstream, "patents", "P1", r#"{"v":2}"#);
        f.coord.prepare_green_database().unwrap();
        f.coord.apply_updates("patents", &["P1".to_string()]).unwrap();
        f.coord.switch_to_green().unwrap();

        assert_eq!(f.coord.read_pointer().unwrap().active_db, Slot::Blue);
        let live = f.coord.live_record_path("patents", "P1").unwrap();
        assert_eq!(std::fs::read_to_string(&live).unwrap(), r#"{"v":2}"#);
    }

    #[test]
    fn second_writer_cannot_prepare_while_staging_is_open() {
        let f = fixture();
        let other = DirectoryCoordinator::new(f.coord.store_dir.clone(), &f.upstream);
        put(&f.upstream, "patents", "P1", r#"{"v":1}"#);

        assert!(f.coord.prepare_green_database().unwrap());
        assert_eq!(
            f.coord.apply_updates("patents", &["P1".to_string()]).unwrap(),
            1
        );
        assert!(!other.prepare_green_database().unwrap());
        assert!(f.coord.verify_integrity().unwrap().passed);
        assert!(f.coord.switch_to_green().unwrap());

        // The first writer's record survived and is live.
        let live = f.coord.live_record_path("patents", "P1").unwrap();
        assert!(live.exists());
        // The lock is released once the pass ends.
        assert!(other.prepare_green_database().unwrap());
        assert!(other.rollback_to_blue().unwrap());
    }

    #[test]
    fn rollback_releases_store_lock() {
        let f = fixture();
        let other = DirectoryCoordinator::new(f.coord.store_dir.clone(), &f.upstream);
        f.coord.prepare_green_database().unwrap();
        f.coord.rollback_to_blue().unwrap();
        assert!(other.prepare_green_database().unwrap());
    }

    #[test]
    fn missing_upstream_export_is_an_error() {
        let dir = TempDir::new().unwrap();
        let coord = DirectoryCoordinator::new(dir.path().join("store"), dir.path().join("none"));
        assert!(coord.detect_deltas().is_err());
    }
}
