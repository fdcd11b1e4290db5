// Gipfelbuch CLI - reconcile climbing data into the entity store

mod exit_codes;
mod reconcile;
mod status;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use gipfelbuch_config::Settings;
use gipfelbuch_store::{SqliteStore, StoreError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use exit_codes::{EXIT_RUNTIME, EXIT_SUCCESS};

#[derive(Parser)]
#[command(name = "gipfelbuch")]
#[command(about = "Reconcile climbing data (regions, summits, routes, climbers, ascents) into one store")]
#[command(long_version = long_version())]
#[command(version)]
#[command(subcommand_required = false)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Config-driven reconciliation of source files into the store
    Reconcile {
        #[command(subcommand)]
        command: reconcile::ReconcileCommands,
    },

    /// Show document counts and last-change timestamps per collection
    #[command(after_help = "\
Examples:
  gipfelbuch status
  gipfelbuch status --db ./gipfelbuch.sqlite --json")]
    Status {
        /// Store database (default: from settings)
        #[arg(long, env = "GIPFELBUCH_DB")]
        db: Option<PathBuf>,

        /// Output JSON to stdout instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_COMMIT_HASH"), ")",
        "\ntarget:  ", env!("TARGET"),
    )
}

/// Route `log` records from the library crates to stderr. `RUST_LOG` wins
/// over the settings file.
fn init_logging(settings: &Settings) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = Settings::load();
    init_logging(&settings);

    let result = match cli.command {
        None => {
            // No subcommand = show help
            eprintln!("Usage: gipfelbuch <command> [options]");
            eprintln!("       gipfelbuch --help for more information");
            Ok(())
        }
        Some(Commands::Reconcile { command }) => reconcile::cmd_reconcile(command, &settings),
        Some(Commands::Status { db, json }) => status::cmd_status(db, json, &settings),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// `--db` if given, else the settings file's database path.
pub fn database_path(db: Option<PathBuf>, settings: &Settings) -> PathBuf {
    db.unwrap_or_else(|| settings.effective_database_path())
}

pub fn open_store(path: &Path) -> Result<SqliteStore, CliError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            CliError::new(EXIT_RUNTIME, format!("cannot create {}: {e}", parent.display()))
        })?;
    }
    SqliteStore::open(path).map_err(|e: StoreError| {
        CliError::new(EXIT_RUNTIME, format!("{}: {e}", path.display()))
            .with_hint("check the --db path or store.databasePath in settings.json")
    })
}
