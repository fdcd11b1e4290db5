use std::collections::HashMap;

use gipfelbuch_store::Collection;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    pub name: String,
    #[serde(default)]
    pub mode: MergeMode,
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub references: ReferencePolicy,
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    #[serde(default)]
    pub collections: CollectionSources,
}

// ---------------------------------------------------------------------------
// Merge mode
// ---------------------------------------------------------------------------

/// How a candidate is written when a document with its natural key exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Only write new documents; existing ones are never touched.
    Insert,
    /// Overwrite existing documents wholesale.
    Replace,
    /// Merge field by field, writing only when something changed.
    #[default]
    Update,
}

impl std::fmt::Display for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Replace => write!(f, "replace"),
            Self::Update => write!(f, "update"),
        }
    }
}

// ---------------------------------------------------------------------------
// GPS thresholds
// ---------------------------------------------------------------------------

/// Distances in meters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GpsConfig {
    /// Largest move that is still applied to a stored position.
    #[serde(default = "default_change_distance")]
    pub change_distance_threshold: f64,
    /// Accepted moves at least this large are logged.
    #[serde(default = "default_log_distance")]
    pub log_distance_threshold: f64,
}

fn default_change_distance() -> f64 {
    100.0
}

fn default_log_distance() -> f64 {
    20.0
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            change_distance_threshold: default_change_distance(),
            log_distance_threshold: default_log_distance(),
        }
    }
}

// ---------------------------------------------------------------------------
// Missing reference policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReference {
    /// Reject the referencing record.
    #[default]
    Reject,
    /// Create the referenced entity from its natural key, then continue.
    Create,
}

/// Upsert-on-missing is only expressible for top-of-hierarchy entities;
/// summits and routes always need their parents and are always rejected.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferencePolicy {
    #[serde(default)]
    pub region: MissingReference,
    #[serde(default)]
    pub climber: MissingReference,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub file: String,
    #[serde(default)]
    pub format: SourceFormat,
    /// Swap `gpsPosition.lat` and `gpsPosition.lng` while loading.
    #[serde(default)]
    pub swap_coordinates: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    #[default]
    Json,
    #[serde(rename = "geojson")]
    GeoJson,
}

/// One entry in a collection's source list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SourceRef {
    /// Ordinary source: records of the collection's entity kind.
    Named(String),
    /// Position-only merge into existing summits.
    Gps(GpsSourceRef),
}

impl SourceRef {
    /// Name of the loaded record set this entry reads from.
    pub fn data_source(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Gps(gps) => &gps.dependency,
        }
    }

    pub fn is_gps(&self) -> bool {
        matches!(self, Self::Gps(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GpsSourceRef {
    #[serde(rename = "type")]
    pub kind: GpsSourceKind,
    pub dependency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum GpsSourceKind {
    #[serde(rename = "gpsLocation")]
    GpsLocation,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionSources {
    #[serde(default)]
    pub regions: Vec<SourceRef>,
    #[serde(default)]
    pub summits: Vec<SourceRef>,
    #[serde(default)]
    pub routes: Vec<SourceRef>,
    #[serde(default)]
    pub climbers: Vec<SourceRef>,
    #[serde(default)]
    pub ascents: Vec<SourceRef>,
}

impl CollectionSources {
    pub fn for_collection(&self, collection: Collection) -> &[SourceRef] {
        match collection {
            Collection::Regions => &self.regions,
            Collection::Summits => &self.summits,
            Collection::Routes => &self.routes,
            Collection::Climbers => &self.climbers,
            Collection::Ascents => &self.ascents,
        }
    }

    /// Sources in processing order: ordinary sources as listed, then GPS
    /// merges, which need the collection's documents to exist already.
    pub fn ordered(&self, collection: Collection) -> Vec<&SourceRef> {
        let refs = self.for_collection(collection);
        refs.iter()
            .filter(|r| !r.is_gps())
            .chain(refs.iter().filter(|r| r.is_gps()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconcileConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconcileError> {
        let config: ReconcileConfig =
            toml::from_str(input).map_err(|e| ReconcileError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        let gps = &self.gps;
        for (label, value) in [
            ("change_distance_threshold", gps.change_distance_threshold),
            ("log_distance_threshold", gps.log_distance_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ReconcileError::ConfigValidation(format!(
                    "gps.{label} must be a non-negative number of meters, got {value}"
                )));
            }
        }
        if gps.log_distance_threshold > gps.change_distance_threshold {
            return Err(ReconcileError::ConfigValidation(format!(
                "gps.log_distance_threshold ({}) exceeds gps.change_distance_threshold ({})",
                gps.log_distance_threshold, gps.change_distance_threshold
            )));
        }

        let mut any = false;
        for collection in Collection::ORDERED {
            for source in self.collections.for_collection(collection) {
                any = true;
                if source.is_gps() && collection != Collection::Summits {
                    return Err(ReconcileError::ConfigValidation(format!(
                        "collection '{collection}': gpsLocation sources are only allowed for summits"
                    )));
                }
                let name = source.data_source();
                if !self.sources.contains_key(name) {
                    return Err(ReconcileError::ConfigValidation(format!(
                        "collection '{collection}': source '{name}' is not defined in [sources]"
                    )));
                }
            }
        }
        if !any {
            return Err(ReconcileError::ConfigValidation(
                "at least one collection needs a source".into(),
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
