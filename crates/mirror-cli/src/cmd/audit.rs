use crate::output::{print_json, print_table};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum AuditSubcommand {
    /// List audit events in the order they were logged
    List {
        /// Only events from this refresh run
        #[arg(long)]
        session: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: AuditSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        AuditSubcommand::List { session } => list(root, session.as_deref(), json),
    }
}

fn list(root: &Path, session: Option<&str>, json: bool) -> anyhow::Result<()> {
    let log = super::open_audit_log(root)?;
    let entries = log.entries(session)?;

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No audit events.");
        return Ok(());
    }

    let rows = entries
        .iter()
        .map(|e| {
            let mut rest = e.details.clone();
            rest.remove(mirror_core::audit::SESSION_ID_KEY);
            vec![
                e.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                e.session_id().unwrap_or("-").to_string(),
                e.event.clone(),
                serde_json::Value::Object(rest).to_string(),
            ]
        })
        .collect();
    print_table(&["TIME", "SESSION", "EVENT", "DETAILS"], rows);
    Ok(())
}
