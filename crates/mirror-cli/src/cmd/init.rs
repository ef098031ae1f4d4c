use anyhow::Context;
use mirror_core::{audit::AuditLog, config::Config, io, manifest::Manifest, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing mirror in: {}", root.display());

    for dir in [paths::MIRROR_DIR, paths::RATE_LIMIT_DIR, paths::STORE_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config = if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
        Config::load(root).context("failed to load config")?
    } else {
        let cfg = Config::default();
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
        cfg
    };

    if paths::manifest_path(root).exists() {
        println!("  exists:  {}", paths::MANIFEST_FILE);
    } else {
        Manifest::default()
            .save(root)
            .context("failed to write manifest.yaml")?;
        println!("  created: {}", paths::MANIFEST_FILE);
    }

    super::coordinator(root, &config)
        .init()
        .context("failed to initialize blue/green store")?;

    let upstream = paths::resolve(root, &config.refresh.upstream_dir);
    if !upstream.exists() {
        io::ensure_dir(&upstream)
            .with_context(|| format!("failed to create {}", upstream.display()))?;
        println!("  created: {}", upstream.display());
    }

    AuditLog::open(&paths::audit_db_path(root)).context("failed to create audit log")?;

    println!("Mirror initialized.");
    Ok(())
}
