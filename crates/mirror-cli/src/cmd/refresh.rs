use crate::output::{print_json, print_table};
use anyhow::Context;
use mirror_core::{
    manifest::Manifest,
    refresh::{RunResult, RunStatus},
};
use std::path::Path;
use std::sync::Arc;

pub fn run(
    root: &Path,
    schedule: Option<&str>,
    scope: Option<&str>,
    dry_run: bool,
    rate_limit_dir: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_valid_config(root)?;
    let mut manifest = Manifest::load(root).context("failed to load manifest")?;

    let schedule = schedule.unwrap_or(&config.refresh.default_schedule);
    let scope = scope.unwrap_or(&config.refresh.default_scope);

    let limiter = super::rate_limiter(root, &config, rate_limit_dir);
    let audit = super::open_audit_log(root)?;
    let orchestrator = super::orchestrator(root, &config, Arc::new(manifest.clone()), audit)?
        .with_rate_limiter(limiter, Some(config.rate_limit.acquire_timeout()));

    let result = orchestrator.run_blue_green_refresh(schedule, scope, dry_run);

    if result.status == RunStatus::Completed && !result.applied_records.is_empty() {
        manifest.mark_refreshed(&result.applied_records, result.finished_at);
        manifest.save(root).context("failed to update manifest")?;
    }

    if json {
        print_json(&result)?;
    } else {
        print_summary(&result);
    }

    if result.status == RunStatus::Failed {
        anyhow::bail!(
            "refresh {} failed: {}",
            result.run_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_summary(result: &RunResult) {
    println!("Run:        {}", result.run_id);
    println!("Status:     {}", result.status);
    println!("Schedule:   {}  Scope: {}", result.schedule, result.scope);
    println!(
        "Deltas:     {} detected, {} applied",
        result.deltas_detected, result.deltas_applied
    );
    println!("Switched:   {}", result.switched_to_green);
    if result.rolled_back {
        println!("Rolled back to the previous copy.");
    }
    if result.rollback_failed {
        println!("Rollback FAILED: the store needs manual attention.");
    }
    if !result.conflicts.is_empty() {
        println!();
        let rows = result
            .conflicts
            .iter()
            .map(|c| {
                vec![
                    c.record_id.clone(),
                    c.endpoint.clone(),
                    c.reason.to_string(),
                    c.error.clone().unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["RECORD", "ENDPOINT", "REASON", "ERROR"], rows);
    }
}
