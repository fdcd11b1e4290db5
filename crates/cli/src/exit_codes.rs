//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract; import jobs rely on them.
//!
//! | Code | Meaning                                              |
//! |------|------------------------------------------------------|
//! | 0    | Success                                              |
//! | 1    | General error (unspecified)                          |
//! | 2    | CLI usage error (bad args, reported by clap)         |
//! | 3    | Reconcile config missing, unparsable or invalid      |
//! | 4    | Store unavailable, source unreadable, output failure |
//! | 5    | Some records failed (only with `--strict`)           |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into the relevant command's error handling

use gipfelbuch_reconcile::ReconcileError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

// 2 (usage error) is emitted by clap itself on bad arguments.

/// Config file unreadable, not TOML, or fails validation.
pub const EXIT_INVALID_CONFIG: u8 = 3;

/// The run could not proceed: store unreachable, a source file is missing or
/// malformed, or the report could not be written.
pub const EXIT_RUNTIME: u8 = 4;

/// The run completed but at least one record failed, and `--strict` was set.
pub const EXIT_RECORDS_FAILED: u8 = 5;

/// Map a reconcile error to its exit code.
pub fn reconcile_exit_code(err: &ReconcileError) -> u8 {
    match err {
        ReconcileError::ConfigParse(_)
        | ReconcileError::ConfigValidation(_)
        | ReconcileError::UnknownSource { .. } => EXIT_INVALID_CONFIG,
        ReconcileError::SourceLoad { .. } | ReconcileError::Store(_) | ReconcileError::Io(_) => EXIT_RUNTIME,
    }
}
