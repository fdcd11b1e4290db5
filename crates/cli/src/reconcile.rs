//! `gipfelbuch reconcile`: config-driven reconciliation.

use std::path::{Path, PathBuf};

use clap::{Subcommand, ValueEnum};
use gipfelbuch_config::Settings;
use gipfelbuch_reconcile::load::load_input;
use gipfelbuch_reconcile::summary::render_table;
use gipfelbuch_reconcile::{MergeMode, ReconcileConfig, RunReport};

use crate::exit_codes::{
    reconcile_exit_code, EXIT_ERROR, EXIT_INVALID_CONFIG, EXIT_RECORDS_FAILED, EXIT_RUNTIME,
};
use crate::{database_path, open_store, CliError};

#[derive(Subcommand)]
pub enum ReconcileCommands {
    /// Run reconciliation from a TOML config file
    #[command(after_help = "\
Examples:
  gipfelbuch reconcile run sandstein.toml
  gipfelbuch reconcile run sandstein.toml --mode insert
  gipfelbuch reconcile run sandstein.toml --json
  gipfelbuch reconcile run sandstein.toml --output report.json --strict")]
    Run {
        /// Path to the reconcile TOML config
        config: PathBuf,

        /// Store database (default: from settings)
        #[arg(long, env = "GIPFELBUCH_DB")]
        db: Option<PathBuf>,

        /// Override the config's merge mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Output JSON to stdout instead of the summary table
        #[arg(long)]
        json: bool,

        /// Write JSON report to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Exit non-zero when any record failed
        #[arg(long)]
        strict: bool,
    },

    /// Validate a reconcile config without running
    #[command(after_help = "\
Examples:
  gipfelbuch reconcile validate sandstein.toml")]
    Validate {
        /// Path to the reconcile TOML config
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Insert,
    Replace,
    Update,
}

impl From<ModeArg> for MergeMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Insert => MergeMode::Insert,
            ModeArg::Replace => MergeMode::Replace,
            ModeArg::Update => MergeMode::Update,
        }
    }
}

pub fn cmd_reconcile(cmd: ReconcileCommands, settings: &Settings) -> Result<(), CliError> {
    match cmd {
        ReconcileCommands::Run { config, db, mode, json, output, strict } => {
            cmd_reconcile_run(config, database_path(db, settings), mode, json, output, strict)
        }
        ReconcileCommands::Validate { config } => cmd_reconcile_validate(config),
    }
}

fn read_config(config_path: &Path) -> Result<ReconcileConfig, CliError> {
    let config_str = std::fs::read_to_string(config_path).map_err(|e| {
        CliError::new(EXIT_INVALID_CONFIG, format!("cannot read config {}: {e}", config_path.display()))
    })?;
    ReconcileConfig::from_toml(&config_str)
        .map_err(|e| CliError::new(reconcile_exit_code(&e), e.to_string()))
}

fn cmd_reconcile_run(
    config_path: PathBuf,
    db_path: PathBuf,
    mode: Option<ModeArg>,
    json_output: bool,
    output_file: Option<PathBuf>,
    strict: bool,
) -> Result<(), CliError> {
    let mut config = read_config(&config_path)?;
    if let Some(mode) = mode {
        config.mode = mode.into();
    }

    // Resolve file paths relative to config file's directory
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let input = load_input(&config, base_dir)
        .map_err(|e| CliError::new(reconcile_exit_code(&e), e.to_string()))?;

    let mut store = open_store(&db_path)?;
    log::info!("reconciling '{}' into {} (mode {})", config.name, db_path.display(), config.mode);

    let report = gipfelbuch_reconcile::run(&config, &input, &mut store)
        .map_err(|e| CliError::new(reconcile_exit_code(&e), e.to_string()))?;

    // Output
    let json_str = serde_json::to_string_pretty(&report)
        .map_err(|e| CliError::new(EXIT_ERROR, format!("JSON serialization error: {e}")))?;

    if let Some(ref path) = output_file {
        std::fs::write(path, &json_str)
            .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }

    if json_output {
        println!("{json_str}");
    } else {
        print!("{}", render_table(&report));
    }

    // Human summary to stderr
    eprintln!("{}: {}", report.meta.config_name, report.totals);
    print_failures(&report);

    if strict && report.totals.failed > 0 {
        return Err(CliError::new(
            EXIT_RECORDS_FAILED,
            format!("{} records failed", report.totals.failed),
        ));
    }
    Ok(())
}

fn print_failures(report: &RunReport) {
    for collection in &report.collections {
        for source in &collection.sources {
            for failure in &source.failures {
                eprintln!(
                    "  failed {} <- {} #{} '{}': {}",
                    collection.collection, source.source, failure.index, failure.key, failure.message
                );
            }
        }
    }
}

fn cmd_reconcile_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config = read_config(&config_path)?;

    let sources: usize = gipfelbuch_store::Collection::ORDERED
        .iter()
        .map(|c| config.collections.for_collection(*c).len())
        .sum();
    eprintln!(
        "valid: '{}' (mode {}, {} sources feeding {} collection entries)",
        config.name,
        config.mode,
        config.sources.len(),
        sources,
    );
    Ok(())
}
