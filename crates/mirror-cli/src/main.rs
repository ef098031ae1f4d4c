mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    audit::AuditSubcommand, config::ConfigSubcommand, manifest::ManifestSubcommand,
    rate_limit::RateLimitSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mirror",
    about = "Refresh a local mirror of regulatory datasets through a blue/green store",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .mirror/)
    #[arg(long, global = true, env = "MIRROR_ROOT")]
    root: Option<PathBuf>,

    /// Shared rate limit directory (overrides rate_limit.shared_dir)
    #[arg(long, global = true, env = "MIRROR_RATE_LIMIT_DIR")]
    rate_limit_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the mirror in the current project
    Init,

    /// Refresh stale records that changed upstream
    Refresh {
        /// Refresh schedule: hourly, daily, weekly, monthly or <n>[smhd]
        #[arg(long)]
        schedule: Option<String>,
        /// Endpoint to refresh, or "all"
        #[arg(long)]
        scope: Option<String>,
        /// Detect deltas only; never touch the store
        #[arg(long)]
        dry_run: bool,
    },

    /// Show blue/green store statistics
    Stats,

    /// Inspect or manage the shared upstream request budget
    RateLimit {
        #[command(subcommand)]
        subcommand: RateLimitSubcommand,
    },

    /// Read the refresh audit log
    Audit {
        #[command(subcommand)]
        subcommand: AuditSubcommand,
    },

    /// Manage the catalog of mirrored records
    Manifest {
        #[command(subcommand)]
        subcommand: ManifestSubcommand,
    },

    /// Validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Refresh { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let rate_limit_dir = cli.rate_limit_dir.as_deref();

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Refresh {
            schedule,
            scope,
            dry_run,
        } => cmd::refresh::run(
            &root,
            schedule.as_deref(),
            scope.as_deref(),
            dry_run,
            rate_limit_dir,
            cli.json,
        ),
        Commands::Stats => cmd::stats::run(&root, cli.json),
        Commands::RateLimit { subcommand } => {
            cmd::rate_limit::run(&root, subcommand, rate_limit_dir, cli.json)
        }
        Commands::Audit { subcommand } => cmd::audit::run(&root, subcommand, cli.json),
        Commands::Manifest { subcommand } => cmd::manifest::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
