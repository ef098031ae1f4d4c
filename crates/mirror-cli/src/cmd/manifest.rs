use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use mirror_core::manifest::Manifest;
use std::path::Path;

#[derive(Subcommand)]
pub enum ManifestSubcommand {
    /// List mirrored records, most important first
    List,

    /// Add a record to the catalog
    Add {
        record_id: String,
        /// Upstream endpoint the record is fetched from
        #[arg(long)]
        endpoint: String,
        /// Higher values are refreshed first
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        priority: i32,
    },
}

pub fn run(root: &Path, subcmd: ManifestSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ManifestSubcommand::List => list(root, json),
        ManifestSubcommand::Add {
            record_id,
            endpoint,
            priority,
        } => add(root, &record_id, &endpoint, priority, json),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(root).context("failed to load manifest")?;
    let candidates = manifest.candidates(mirror_core::manifest::SCOPE_ALL);

    if json {
        return print_json(&candidates);
    }
    if candidates.is_empty() {
        println!("No records in manifest.");
        return Ok(());
    }
    let rows = candidates
        .into_iter()
        .map(|c| {
            vec![
                c.record_id,
                c.endpoint,
                c.priority.to_string(),
                or_dash(c.last_refresh),
            ]
        })
        .collect();
    print_table(&["RECORD", "ENDPOINT", "PRIORITY", "LAST REFRESH"], rows);
    Ok(())
}

fn add(root: &Path, record_id: &str, endpoint: &str, priority: i32, json: bool) -> anyhow::Result<()> {
    let mut manifest = Manifest::load(root).context("failed to load manifest")?;
    manifest.add(record_id, endpoint, priority)?;
    manifest.save(root).context("failed to write manifest")?;

    if json {
        print_json(&serde_json::json!({
            "record_id": record_id,
            "endpoint": endpoint,
            "priority": priority,
        }))?;
    } else {
        println!("Added {record_id} ({endpoint}).");
    }
    Ok(())
}
