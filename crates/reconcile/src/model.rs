use std::collections::HashMap;

use chrono::{DateTime, Utc};
use gipfelbuch_store::Collection;
use serde::Serialize;
use serde_json::Value;

use crate::config::MergeMode;
use crate::error::RecordError;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Pre-loaded, loosely-typed records grouped by source name.
///
/// References to other entities are natural-key strings; the engine resolves
/// them against the store.
#[derive(Debug, Default)]
pub struct ReconcileInput {
    pub records: HashMap<String, Vec<Value>>,
}

impl ReconcileInput {
    pub fn with_source(mut self, name: impl Into<String>, records: Vec<Value>) -> Self {
        self.records.insert(name.into(), records);
        self
    }
}

// ---------------------------------------------------------------------------
// Per-record outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Inserted,
    Updated,
    Replaced,
    /// The engine deliberately declined to write.
    Skipped,
    /// The engine could not apply the record.
    Failed,
}

impl Outcome {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Replaced)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inserted => write!(f, "inserted"),
            Self::Updated => write!(f, "updated"),
            Self::Replaced => write!(f, "replaced"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    pub inserted: usize,
    pub updated: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl OperationCounts {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Inserted => self.inserted += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Replaced => self.replaced += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    pub fn add(&mut self, other: &OperationCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.replaced += other.replaced;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    /// Records that actually landed in the store.
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.replaced
    }

    pub fn total(&self) -> usize {
        self.writes() + self.skipped + self.failed
    }
}

impl std::fmt::Display for OperationCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} inserted, {} updated, {} replaced, {} skipped, {} failed",
            self.inserted, self.updated, self.replaced, self.skipped, self.failed
        )
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Records,
    GpsLocation,
}

/// A record the engine could not apply, with the key it was logged under.
#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub index: usize,
    pub key: String,
    pub category: &'static str,
    pub message: String,
}

impl RecordFailure {
    pub fn new(index: usize, key: impl Into<String>, err: &RecordError) -> Self {
        Self {
            index,
            key: key.into(),
            category: err.category(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub kind: SourceKind,
    pub counts: OperationCounts,
    /// Referenced regions/climbers created on the fly for this source.
    pub created_references: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RecordFailure>,
}

impl SourceReport {
    pub fn new(source: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            source: source.into(),
            kind,
            counts: OperationCounts::default(),
            created_references: 0,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub collection: Collection,
    pub sources: Vec<SourceReport>,
    pub totals: OperationCounts,
    /// Documents created in this collection because another collection
    /// referenced them.
    pub created_by_reference: usize,
    /// Whether this run advanced the collection's LastChange.
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl CollectionReport {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            sources: Vec::new(),
            totals: OperationCounts::default(),
            created_by_reference: 0,
            changed: false,
            last_modified: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub meta: RunMeta,
    pub collections: Vec<CollectionReport>,
    pub totals: OperationCounts,
}

impl RunReport {
    pub fn collection(&self, collection: Collection) -> Option<&CollectionReport> {
        self.collections.iter().find(|c| c.collection == collection)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub config_name: String,
    pub mode: MergeMode,
    pub engine_version: String,
    pub run_at: String,
}
