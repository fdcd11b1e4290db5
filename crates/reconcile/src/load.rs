//! Source loaders: exported files in, loosely-typed records out.

use std::path::Path;

use serde_json::{Map, Value};

use crate::config::{ReconcileConfig, SourceConfig, SourceFormat};
use crate::error::ReconcileError;
use crate::gps::{GpsPosition, POSITION_FIELD};
use crate::model::ReconcileInput;

/// Parse one source's file contents into records.
pub fn load_records(
    source_name: &str,
    data: &str,
    config: &SourceConfig,
) -> Result<Vec<Value>, ReconcileError> {
    let load_err = |reason: String| ReconcileError::SourceLoad {
        source: source_name.to_string(),
        reason,
    };

    let parsed: Value =
        serde_json::from_str(data).map_err(|e| load_err(format!("invalid JSON: {e}")))?;

    let mut records = match config.format {
        SourceFormat::Json => match parsed {
            Value::Array(items) => items,
            _ => return Err(load_err("expected a top-level array of records".into())),
        },
        SourceFormat::GeoJson => geojson_records(&parsed).map_err(load_err)?,
    };

    if config.swap_coordinates {
        for record in &mut records {
            swap_position(record);
        }
    }
    Ok(records)
}

/// Read and parse every source the config defines. Paths are relative to
/// `base_dir`.
pub fn load_input(config: &ReconcileConfig, base_dir: &Path) -> Result<ReconcileInput, ReconcileError> {
    let mut input = ReconcileInput::default();
    for (name, source) in &config.sources {
        let path = base_dir.join(&source.file);
        let data = std::fs::read_to_string(&path)
            .map_err(|e| ReconcileError::Io(format!("cannot read {}: {e}", path.display())))?;
        let records = load_records(name, &data, source)?;
        log::debug!("source '{name}': {} records from {}", records.len(), path.display());
        input.records.insert(name.clone(), records);
    }
    Ok(input)
}

fn geojson_records(parsed: &Value) -> Result<Vec<Value>, String> {
    if parsed.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err("expected a GeoJSON FeatureCollection".into());
    }
    let features = parsed
        .get("features")
        .and_then(Value::as_array)
        .ok_or("FeatureCollection has no 'features' array")?;

    let mut records = Vec::with_capacity(features.len());
    for (i, feature) in features.iter().enumerate() {
        let geometry = feature.get("geometry");
        if geometry.and_then(|g| g.get("type")).and_then(Value::as_str) != Some("Point") {
            log::debug!("feature {i}: not a Point, skipped");
            continue;
        }
        let coords = geometry
            .and_then(|g| g.get("coordinates"))
            .and_then(Value::as_array)
            .ok_or_else(|| format!("feature {i}: Point without coordinates"))?;
        let (lng, lat) = match (coords.first().and_then(Value::as_f64), coords.get(1).and_then(Value::as_f64)) {
            (Some(lng), Some(lat)) => (lng, lat),
            _ => return Err(format!("feature {i}: coordinates must be [lng, lat]")),
        };

        let mut record = match feature.get("properties") {
            Some(Value::Object(props)) => props.clone(),
            _ => Map::new(),
        };
        record.insert(POSITION_FIELD.to_string(), GpsPosition::new(lat, lng).to_value());
        records.push(Value::Object(record));
    }
    Ok(records)
}

fn swap_position(record: &mut Value) {
    let Some(fields) = record.as_object_mut() else {
        return;
    };
    // Malformed positions are left for the shape check to report.
    if let Ok(Some(position)) = GpsPosition::from_value(fields.get(POSITION_FIELD)) {
        fields.insert(POSITION_FIELD.to_string(), position.swapped().to_value());
    }
}
