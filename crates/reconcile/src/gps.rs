use serde_json::{json, Value};

use crate::config::GpsConfig;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Field holding a summit's position.
pub const POSITION_FIELD: &str = "gpsPosition";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsPosition {
    pub lat: f64,
    pub lng: f64,
}

impl GpsPosition {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Read a `{lat, lng}` object.
    ///
    /// Absent values, `null`, and objects with a null/missing coordinate all
    /// mean "no position". Anything else that is not a pair of numbers is a
    /// shape error.
    pub fn from_value(value: Option<&Value>) -> Result<Option<Self>, String> {
        let obj = match value {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Object(obj)) => obj,
            Some(other) => return Err(format!("gpsPosition must be an object, got {other}")),
        };

        let coord = |name: &str| -> Result<Option<f64>, String> {
            match obj.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => v
                    .as_f64()
                    .filter(|f| f.is_finite())
                    .map(Some)
                    .ok_or_else(|| format!("gpsPosition.{name} must be a number, got {v}")),
            }
        };

        match (coord("lat")?, coord("lng")?) {
            (Some(lat), Some(lng)) => Ok(Some(Self { lat, lng })),
            _ => Ok(None),
        }
    }

    pub fn to_value(self) -> Value {
        json!({ "lat": self.lat, "lng": self.lng })
    }

    /// The same point with latitude and longitude exchanged.
    pub fn swapped(self) -> Self {
        Self { lat: self.lng, lng: self.lat }
    }
}

/// Great-circle distance in meters (haversine).
pub fn haversine_distance(a: GpsPosition, b: GpsPosition) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpsDecision {
    /// Overwrite the stored position. `distance` is `None` when nothing was stored.
    Accept { distance: Option<f64> },
    /// Accepted, but far enough to be logged as a correction.
    Corrected { distance: f64 },
    /// Candidate equals the stored position; nothing to write.
    Unchanged,
    /// Candidate is implausibly far from the stored position; keep it.
    Reject { distance: f64 },
}

impl GpsDecision {
    pub fn accepted(&self) -> bool {
        matches!(self, Self::Accept { .. } | Self::Corrected { .. })
    }
}

/// Distance gate for summit positions.
#[derive(Debug, Clone, Copy)]
pub struct GpsMergePolicy {
    pub change_distance_threshold: f64,
    pub log_distance_threshold: f64,
}

impl GpsMergePolicy {
    pub fn from_config(config: &GpsConfig) -> Self {
        Self {
            change_distance_threshold: config.change_distance_threshold,
            log_distance_threshold: config.log_distance_threshold,
        }
    }

    /// Decide whether `candidate` may replace `existing` for the summit
    /// identified by `label`. Both thresholds are inclusive.
    pub fn decide(
        &self,
        label: &str,
        existing: Option<GpsPosition>,
        candidate: GpsPosition,
    ) -> GpsDecision {
        let Some(existing) = existing else {
            return GpsDecision::Accept { distance: None };
        };
        if existing == candidate {
            return GpsDecision::Unchanged;
        }

        let distance = haversine_distance(existing, candidate);
        if distance > self.change_distance_threshold {
            log::warn!(
                "summit '{label}': ignoring position update, moved {distance:.1} m (limit {:.1} m)",
                self.change_distance_threshold
            );
            return GpsDecision::Reject { distance };
        }

        if distance >= self.log_distance_threshold {
            log::info!(
                "summit '{label}': position corrected by {distance:.1} m ({}, {}) -> ({}, {})",
                existing.lat,
                existing.lng,
                candidate.lat,
                candidate.lng
            );
            return GpsDecision::Corrected { distance };
        }
        GpsDecision::Accept { distance: Some(distance) }
    }
}
