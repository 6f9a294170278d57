//! formulary-sync: operator tool for migrating, backfilling and syncing the catalog.
//!
//! Configuration comes from the environment (see `CatalogConfig`); a `.env`
//! file in the working directory is loaded first.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use formulary_db::{
    log_pool_metrics, CatalogConfig, Database, EntityKind, Handle, ImportPayload, MigrationPhase,
};

#[derive(Parser)]
#[command(name = "formulary-sync")]
#[command(author, version, about = "Handle-keyed sync tooling for the formulary catalog")]
#[command(propagate_version = true)]
struct Cli {
    /// Skip the migration advisory lock (overrides FORMULARY_MIGRATION_LOCK)
    #[arg(long, global = true)]
    no_lock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate {
        /// additive, tightening or all
        #[arg(short, long, default_value = "all")]
        phase: MigrationPhase,
    },

    /// Populate missing topics and handles
    Backfill,

    /// Additive migrations, primary repair, backfill, then tightening
    Bootstrap,

    /// Reconcile a handle-keyed JSON payload into the catalog
    Import {
        /// Payload file
        file: PathBuf,
    },

    /// Export catalog rows as a handle-keyed JSON payload
    Export {
        /// Entity kinds to export (default: all)
        #[arg(short, long, num_args = 1..)]
        kind: Vec<EntityKind>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resolve a handle to its local surrogate key
    Resolve {
        kind: EntityKind,
        handle: String,
    },

    /// Reset a failed migration step so the next run retries it
    ResetStep {
        name: String,
    },

    /// Show the migration ledger
    Ledger,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   RUST_LOG    - standard env filter (default: "formulary_db=info,formulary_core=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "formulary_db=info,formulary_core=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_file {
        Some(ref path) => {
            let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
            let file_name = Path::new(path)
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("formulary-sync.log");
            let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            if log_format == "json" {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(non_blocking),
                    )
                    .init();
            } else {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(non_blocking)
                            .with_ansi(false),
                    )
                    .init();
            }
            Some(guard)
        }
        None => {
            // Reports go to stdout; logs stay on stderr.
            if log_format == "json" {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stderr),
                    )
                    .init();
            } else {
                registry
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .init();
            }
            None
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = CatalogConfig::from_env().context("loading configuration")?;
    let lock = config.migration_lock && !cli.no_lock;
    let db = Database::from_config(&config)
        .await
        .context("connecting to the database")?;
    info!(
        subsystem = "cli",
        component = "sync",
        migration_lock = lock,
        "Connected"
    );
    log_pool_metrics(db.pool());

    match cli.command {
        Commands::Migrate { phase } => {
            print_json(&db.migrate(phase, lock).await?)?;
        }
        Commands::Backfill => {
            let topics = config.load_topic_map()?;
            print_json(&db.backfill(&topics).await?)?;
        }
        Commands::Bootstrap => {
            let topics = config.load_topic_map()?;
            print_json(&db.bootstrap(&topics, lock).await?)?;
        }
        Commands::Import { file } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let payload = ImportPayload::from_json(&json)?;
            let topics = config.load_topic_map()?;
            let report = db.import(&payload, &topics).await;
            print_json(&report)?;
            if !report.is_clean() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Export { kind, output } => {
            let result = db.export(&kind).await?;
            let json = result.payload.to_json_pretty()?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", json),
            }
            for (kind, count) in &result.omitted {
                eprintln!("{} {} row(s) without a handle left out", count, kind);
            }
        }
        Commands::Resolve { kind, handle } => {
            let handle = Handle::parse(&handle)?;
            match db.resolve(kind, &handle).await? {
                Some(key) => println!("{}", key),
                None => {
                    eprintln!("No {} with handle '{}'", kind, handle);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::ResetStep { name } => {
            if db.reset_step(&name).await? {
                println!("Step '{}' reset to pending", name);
            } else {
                eprintln!("Step '{}' is not failed", name);
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Ledger => {
            print_json(&db.migrations.ledger().await?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
