use crate::error::{MirrorError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const MIRROR_DIR: &str = ".mirror";
pub const RATE_LIMIT_DIR: &str = ".mirror/ratelimit";
pub const STORE_DIR: &str = ".mirror/store";

pub const CONFIG_FILE: &str = ".mirror/config.yaml";
pub const MANIFEST_FILE: &str = ".mirror/manifest.yaml";
pub const AUDIT_DB_FILE: &str = ".mirror/audit.db";

pub const RATE_LIMIT_STATE_FILE: &str = "rate_limit_state.json";
pub const RATE_LIMIT_LOCK_FILE: &str = "rate_limit_state.lock";
pub const ACTIVE_POINTER_FILE: &str = "active.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn mirror_dir(root: &Path) -> PathBuf {
    root.join(MIRROR_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

pub fn audit_db_path(root: &Path) -> PathBuf {
    root.join(AUDIT_DB_FILE)
}

pub fn store_dir(root: &Path) -> PathBuf {
    root.join(STORE_DIR)
}

pub fn rate_limit_state_path(shared_dir: &Path) -> PathBuf {
    shared_dir.join(RATE_LIMIT_STATE_FILE)
}

pub fn rate_limit_lock_path(shared_dir: &Path) -> PathBuf {
    shared_dir.join(RATE_LIMIT_LOCK_FILE)
}

/// Resolve a configured path against the project root. Absolute paths pass
/// through unchanged.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

// ---------------------------------------------------------------------------
// Record id validation
// ---------------------------------------------------------------------------

static RECORD_ID_RE: OnceLock<Regex> = OnceLock::new();

fn record_id_re() -> &'static Regex {
    RECORD_ID_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("record id pattern is valid")
    })
}

/// Record ids double as file names in the directory store, so they must not
/// contain path separators or start with a dot.
pub fn validate_record_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 128 || !record_id_re().is_match(id) {
        return Err(MirrorError::InvalidRecordId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_record_ids() {
        for id in ["P000001", "US-2024.001", "a", "reg_42"] {
            validate_record_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_record_ids() {
        for id in ["", ".hidden", "../escape", "has space", "a/b"] {
            assert!(validate_record_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.mirror/config.yaml")
        );
        assert_eq!(
            rate_limit_state_path(&root.join(RATE_LIMIT_DIR)),
            PathBuf::from("/tmp/proj/.mirror/ratelimit/rate_limit_state.json")
        );
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            resolve(root, Path::new("/var/shared")),
            PathBuf::from("/var/shared")
        );
        assert_eq!(
            resolve(root, Path::new("upstream")),
            PathBuf::from("/tmp/proj/upstream")
        );
    }
}
