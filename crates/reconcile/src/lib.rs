//! `gipfelbuch-reconcile`: merges climbing records from several sources
//! into the entity store.
//!
//! The engine receives pre-loaded records (see [`load`] for the file
//! loaders), resolves natural-key references to document ids, and writes
//! through an [`EntityStore`](gipfelbuch_store::EntityStore) according to the
//! configured merge mode. No CLI dependencies.

pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod gps;
pub mod load;
pub mod merge;
pub mod model;
pub mod resolve;
pub mod summary;

pub use config::{MergeMode, ReconcileConfig};
pub use engine::{run, run_with_clock};
pub use error::{ApplyError, ReconcileError, RecordError};
pub use model::{CollectionReport, OperationCounts, Outcome, ReconcileInput, RunReport};
