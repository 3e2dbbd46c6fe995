use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;

use photark::config::Config;
use photark::identity::ExactFingerprint;
use photark::ingest::{IngestOptions, Ingestor};
use photark::similarity::SimilarityIndex;
use photark::store::Database;
use photark::sync::Synchronizer;
use photark::tier::{TierManager, TierPolicy, TierRoots};

enum Command {
    Import { path: PathBuf, source: String },
    Demote,
    Fetch { fingerprint: String },
    Sync { path: PathBuf },
    Status,
}

fn parse_args() -> Option<Command> {
    let args: Vec<String> = std::env::args().collect();

    let mut command = None;
    let mut source = "manual".to_string();
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("photark {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--source" | "-s" => {
                if i + 1 < args.len() {
                    source = args[i + 1].clone();
                    i += 1;
                } else {
                    eprintln!("Error: --source requires a source id");
                    std::process::exit(1);
                }
            }
            "import" | "demote" | "fetch" | "sync" | "status" if command.is_none() => {
                command = Some(args[i].clone());
            }
            other if !other.starts_with('-') => {
                positional.push(other.to_string());
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    match command.as_deref() {
        Some("import") => positional.first().map(|p| Command::Import {
            path: PathBuf::from(p),
            source,
        }),
        Some("demote") => Some(Command::Demote),
        Some("fetch") => positional.first().map(|fp| Command::Fetch {
            fingerprint: fp.clone(),
        }),
        Some("sync") => positional.first().map(|p| Command::Sync {
            path: PathBuf::from(p),
        }),
        Some("status") => Some(Command::Status),
        _ => None,
    }
}

fn print_help() {
    println!(
        r#"photark - provenance-first photo and video archive

USAGE:
    photark <COMMAND> [OPTIONS]

COMMANDS:
    import PATH --source ID   Ingest a file or directory from a source
    demote                    Run one tier maintenance pass
    fetch FINGERPRINT         Resolve a payload path, promoting from cold
    sync PATH                 Apply one sidecar file as an external edit
    status                    Report record counts per storage tier

OPTIONS:
    --source, -s ID     Source id for imports (default: manual)
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PHOTARK_LOG         Log level (trace, debug, info, warn, error)
"#
    );
}

fn main() -> Result<()> {
    let Some(command) = parse_args() else {
        print_help();
        std::process::exit(1);
    };

    photark::logging::init(None)?;

    let config = Config::load()?;
    config.validate()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    db.initialize()?;

    let roots = config.tier_roots();
    let policy = config.reconcile_policy();
    let sync = Arc::new(Synchronizer::new(db.clone(), policy.clone(), roots.clone()));

    match command {
        Command::Import { path, source } => {
            if !path.exists() {
                bail!("path does not exist: {}", path.display());
            }
            let index = Arc::new(SimilarityIndex::rebuild_from(&db)?);
            let ingestor = Ingestor::new(
                db,
                index,
                sync,
                policy,
                roots,
                IngestOptions::from_config(&config),
            );
            if path.is_dir() {
                let report = ingestor.batch_ingest(&path, &source)?;
                println!(
                    "stored {} duplicates {} skipped {} failed {}",
                    report.stored,
                    report.duplicates,
                    report.skipped,
                    report.failed.len()
                );
                for (file, error) in &report.failed {
                    eprintln!("failed: {}: {error}", file.display());
                }
            } else {
                let outcome = ingestor.ingest_file(&path, &source)?;
                println!("{outcome:?}");
            }
        }
        Command::Demote => {
            let manager = tier_manager(db, roots, config.tier_policy());
            let report = manager.run_maintenance()?;
            println!(
                "demoted {} to warm, {} to cold, {} failed",
                report.demoted_to_warm, report.demoted_to_cold, report.failed
            );
        }
        Command::Fetch { fingerprint } => {
            let fp: ExactFingerprint = fingerprint.parse()?;
            let manager = tier_manager(db, roots, config.tier_policy());
            let path = manager.fetch(&fp)?;
            println!("{}", path.display());
        }
        Command::Sync { path } => {
            let outcome = sync.on_external_change(&path)?;
            println!("{outcome:?}");
        }
        Command::Status => {
            for tier in ["hot", "warm", "cold"] {
                let records = db.records_in_tier(tier)?;
                let bytes: i64 = records.iter().map(|r| r.size_bytes).sum();
                println!("{tier}: {} records, {bytes} bytes", records.len());
            }
        }
    }

    Ok(())
}

fn tier_manager(db: Arc<Database>, roots: TierRoots, policy: TierPolicy) -> TierManager {
    TierManager::new(db, roots, policy)
}
