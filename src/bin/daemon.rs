//! photark daemon: background archive maintenance.
//!
//! Watches the hot and warm roots for sidecar edits and runs periodic tier
//! maintenance passes. The CLI shares the same SQLite database.
//!
//! ```bash
//! photark-daemon              # run in foreground
//! photark-daemon --once       # one maintenance pass and exit
//! ```

use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

use photark::config::Config;
use photark::store::Database;
use photark::sync::Synchronizer;
use photark::tier::{Tier, TierManager};

struct DaemonArgs {
    once: bool,
    interval_override: Option<u64>,
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = DaemonArgs { once: false, interval_override: None };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" => parsed.once = true,
            "--interval" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse() {
                        Ok(secs) => parsed.interval_override = Some(secs),
                        Err(_) => {
                            eprintln!("Error: --interval requires seconds");
                            std::process::exit(1);
                        }
                    }
                    i += 1;
                } else {
                    eprintln!("Error: --interval requires seconds");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("photark-daemon [--once] [--interval SECS]");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    parsed
}

fn main() -> Result<()> {
    let args = parse_args();

    photark::logging::init(None)?;
    info!("photark daemon starting");

    let config = Config::load()?;
    config.validate()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    db.initialize()?;

    let roots = config.tier_roots();
    let policy = config.reconcile_policy();
    let manager = TierManager::new(db.clone(), roots.clone(), config.tier_policy());

    if args.once {
        let report = manager.run_maintenance()?;
        info!(
            to_warm = report.demoted_to_warm,
            to_cold = report.demoted_to_cold,
            failed = report.failed,
            "single maintenance pass done"
        );
        return Ok(());
    }

    // Sidecar watchers on the editable tiers. Cold payloads are not watched;
    // edits there only surface after a fetch promotes them.
    let sync = Arc::new(Synchronizer::new(db, policy, roots.clone()));
    for tier in [Tier::Hot, Tier::Warm] {
        let root = roots.root(tier).clone();
        if let Err(e) = sync.spawn_watcher(root) {
            error!(tier = %tier, error = %e, "failed to start sidecar watcher");
        }
    }

    let interval = args
        .interval_override
        .unwrap_or(config.tier.maintenance_interval_secs);
    info!(interval_secs = interval, "maintenance loop running");

    loop {
        match manager.run_maintenance() {
            Ok(report) => {
                if report.failed > 0 {
                    error!(failed = report.failed, "maintenance pass had failures");
                }
            }
            Err(e) => error!(error = %e, "maintenance pass failed"),
        }
        thread::sleep(Duration::from_secs(interval));
    }
}
