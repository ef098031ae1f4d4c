use crate::output::{or_dash, print_json};
use anyhow::{anyhow, Context};
use clap::Subcommand;
use mirror_core::rate_limit::HealthStatus;
use std::path::Path;
use std::time::Duration;

#[derive(Subcommand)]
pub enum RateLimitSubcommand {
    /// Show current usage of the shared budget
    Status,

    /// Clear the shared request history
    Reset,

    /// Check that the shared state is usable
    Health,

    /// Take one slot from the budget, waiting if necessary
    Acquire {
        /// Seconds to wait for a slot (default: rate_limit.acquire_timeout_secs)
        #[arg(long)]
        timeout: Option<f64>,
    },
}

pub fn run(
    root: &Path,
    subcmd: RateLimitSubcommand,
    shared_dir: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_valid_config(root)?;
    let limiter = super::rate_limiter(root, &config, shared_dir);

    match subcmd {
        RateLimitSubcommand::Status => {
            let status = limiter.status();
            if json {
                return print_json(&status);
            }
            println!(
                "Requests:    {}/{} in the last {:.0}s ({:.1}%)",
                status.requests_last_minute,
                status.requests_per_minute,
                status.window_seconds,
                status.utilization_percent
            );
            println!("Available:   {}", status.available);
            println!(
                "Oldest age:  {}",
                or_dash(status.oldest_request_age_seconds.map(|s| format!("{s:.1}s")))
            );
            println!(
                "Newest age:  {}",
                or_dash(status.newest_request_age_seconds.map(|s| format!("{s:.1}s")))
            );
            Ok(())
        }
        RateLimitSubcommand::Reset => {
            limiter.reset().context("failed to reset rate limit state")?;
            if json {
                print_json(&serde_json::json!({ "reset": true }))
            } else {
                println!("Rate limit state cleared.");
                Ok(())
            }
        }
        RateLimitSubcommand::Health => {
            let report = limiter.health_check();
            if json {
                print_json(&report)?;
            } else {
                let label = match report.status {
                    HealthStatus::Healthy => "healthy",
                    HealthStatus::Warning => "warning",
                    HealthStatus::Unhealthy => "unhealthy",
                };
                println!("Rate limiter: {label}");
                for w in &report.warnings {
                    println!("  - {w}");
                }
            }
            if !report.healthy {
                anyhow::bail!("rate limiter is unhealthy");
            }
            Ok(())
        }
        RateLimitSubcommand::Acquire { timeout } => {
            let timeout = timeout
                .map(|secs| {
                    Duration::try_from_secs_f64(secs).map_err(|_| anyhow!("invalid timeout: {secs}"))
                })
                .transpose()?;
            let granted = limiter.acquire(timeout);
            if json {
                print_json(&serde_json::json!({ "granted": granted }))?;
            } else if granted {
                println!("Slot acquired.");
            }
            if !granted {
                anyhow::bail!("timed out waiting for a rate limit slot");
            }
            Ok(())
        }
    }
}
