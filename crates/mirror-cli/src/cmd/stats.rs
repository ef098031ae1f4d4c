use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use mirror_core::{audit::AuditLog, config::Config, manifest::Manifest};
use std::path::Path;
use std::sync::Arc;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let manifest = Manifest::load(root).context("failed to load manifest")?;
    // Reporting logs no events, so stats stay readable while a refresh holds
    // the audit database.
    let audit = Arc::new(AuditLog::in_memory());
    let stats = super::orchestrator(root, &config, Arc::new(manifest), audit)?.store_stats();

    if json {
        return print_json(&stats);
    }

    if !stats.enabled {
        println!("Blue-green refresh is disabled.");
        return Ok(());
    }
    if let Some(error) = &stats.error {
        println!("Store status unavailable: {error}");
        return Ok(());
    }
    println!("Active copy:  {}", or_dash(stats.active_db.as_deref()));
    println!("Last refresh: {}", or_dash(stats.last_refresh));
    if let Some(tables) = &stats.table_sizes {
        println!();
        let rows = tables
            .iter()
            .map(|(endpoint, n)| vec![endpoint.clone(), n.to_string()])
            .collect();
        print_table(&["ENDPOINT", "RECORDS"], rows);
    }
    Ok(())
}
