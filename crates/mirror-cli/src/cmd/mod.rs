pub mod audit;
pub mod config;
pub mod init;
pub mod manifest;
pub mod rate_limit;
pub mod refresh;
pub mod stats;

use anyhow::Context;
use mirror_core::{
    audit::AuditLog,
    config::{Config, WarnLevel},
    paths,
    rate_limit::CrossProcessRateLimiter,
    refresh::{CandidateStore, DataRefreshOrchestrator, DirectoryCoordinator},
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for another process (usually a running refresh) to
/// release the audit database.
const AUDIT_OPEN_WAIT: Duration = Duration::from_secs(3);

/// Load the config and refuse to continue when `validate()` reports errors.
pub fn load_valid_config(root: &Path) -> anyhow::Result<Config> {
    let config = Config::load(root).context("failed to load config")?;
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|w| w.level == WarnLevel::Error)
        .map(|w| w.message)
        .collect();
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }
    Ok(config)
}

/// Limiter for this project, with `--rate-limit-dir` taking precedence over
/// the configured shared directory.
pub fn rate_limiter(
    root: &Path,
    config: &Config,
    shared_dir: Option<&Path>,
) -> CrossProcessRateLimiter {
    let mut cfg = config.rate_limit.clone();
    if let Some(dir) = shared_dir {
        cfg.shared_dir = dir.to_path_buf();
    }
    CrossProcessRateLimiter::from_config(root, &cfg)
}

pub fn open_audit_log(root: &Path) -> anyhow::Result<Arc<AuditLog>> {
    let path = paths::audit_db_path(root);
    let log = AuditLog::open_waiting(&path, AUDIT_OPEN_WAIT)
        .with_context(|| format!("failed to open audit log {}", path.display()))?;
    Ok(Arc::new(log))
}

pub fn coordinator(root: &Path, config: &Config) -> DirectoryCoordinator {
    DirectoryCoordinator::new(
        paths::store_dir(root),
        paths::resolve(root, &config.refresh.upstream_dir),
    )
}

/// Orchestrator wired to the on-disk store, or with blue-green disabled when
/// the config says so.
pub fn orchestrator(
    root: &Path,
    config: &Config,
    candidates: Arc<dyn CandidateStore>,
    audit: Arc<AuditLog>,
) -> anyhow::Result<DataRefreshOrchestrator> {
    let orchestrator = DataRefreshOrchestrator::new(candidates, audit);
    if !config.refresh.blue_green_enabled {
        return Ok(orchestrator);
    }
    let coordinator = coordinator(root, config);
    coordinator
        .init()
        .context("failed to initialize blue/green store")?;
    Ok(orchestrator.with_coordinator(Arc::new(coordinator)))
}
