//! Maneuver labeling engine for recorded vehicle trajectories.
//!
//! The crate turns a normalized trajectory table (ego plus tracked objects)
//! and a lane-boundary table into per-entity maneuver intervals that a
//! scenario serializer can render as timed or position-triggered actions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod calibrate;
pub mod filter;
pub mod frame;
pub mod intervals;
pub mod labeling;
pub mod lateral;
pub mod longitudinal;
pub mod signal;
pub mod table;

pub use calibrate::{calibrate_thresholds, reconstruct_speed, CalibrationResult, EntityThreshold};
pub use filter::{retain_relevant_objects, ObjectFilter};
pub use frame::{convert_heading, CoordinateFrame, EquirectangularFrame, PlanarFrame, Position};
pub use intervals::{
    expand_intervals, extract_lateral, extract_longitudinal, LaneChangeDirection,
    ManeuverInterval, ManeuverKind,
};
pub use labeling::{
    label_maneuvers, EntityLabels, InitialState, JsonScenarioSerializer, LabelingOutput,
    RenderOptions, ScenarioSerializer, Thresholds, TriggerStyle,
};
pub use lateral::{detect_lane_changes, LateralMasks};
pub use longitudinal::{detect_longitudinal, detect_longitudinal_from_acceleration, LongitudinalMasks};
pub use signal::smoothed_acceleration;
pub use table::{EntityColumns, EntityRole, EntitySeries, LaneBoundary, LaneTable, TrajectoryTable};

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("invalid input shape: {0}")]
    InvalidShape(String),
    #[error("series length mismatch for {what}: expected {expected}, got {actual}")]
    LengthMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("unknown object class code: {0}")]
    UnknownClass(i64),
    #[error("unknown maneuver kind at serializer boundary: {0}")]
    UnknownManeuver(String),
    #[error("failed to serialize labeling output: {0}")]
    Serialization(String),
}

/// Tunables shared by every stage of the pipeline.
///
/// Speeds are taken as recorded (km/h in the reference data); dividing by
/// `speed_unit_factor` yields the base unit (m/s) that accelerations,
/// target speeds and rates are expressed in.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabelingConfig {
    pub sample_interval_s: f64,
    pub speed_unit_factor: f64,
    pub acceleration_threshold: f64,
    pub min_run_length: f64,
    pub start_speed_ceiling: f64,
    pub smoothing_window: usize,
    pub smoothing_shift: usize,
    pub candidate_thresholds: Vec<f64>,
    pub mismatch_penalty: f64,
    pub class_seed: u64,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            sample_interval_s: 0.1,
            speed_unit_factor: 3.6,
            acceleration_threshold: 0.2,
            min_run_length: 2.0,
            start_speed_ceiling: 20.0,
            smoothing_window: 5,
            smoothing_shift: 2,
            candidate_thresholds: vec![0.05, 0.10, 0.15, 0.20, 0.25, 0.30],
            mismatch_penalty: 999.0,
            class_seed: 0,
        }
    }
}

impl LabelingConfig {
    pub fn validate(&self) -> Result<(), LabelError> {
        if !(self.sample_interval_s > 0.0) {
            return Err(LabelError::InvalidParameter(format!(
                "sample_interval_s must be > 0, got {}",
                self.sample_interval_s
            )));
        }
        if !(self.speed_unit_factor > 0.0) {
            return Err(LabelError::InvalidParameter(format!(
                "speed_unit_factor must be > 0, got {}",
                self.speed_unit_factor
            )));
        }
        if !(self.acceleration_threshold >= 0.0) {
            return Err(LabelError::InvalidParameter(format!(
                "acceleration_threshold must be >= 0, got {}",
                self.acceleration_threshold
            )));
        }
        if self.smoothing_window == 0 {
            return Err(LabelError::InvalidParameter(
                "smoothing_window must be at least 1".into(),
            ));
        }
        if self.candidate_thresholds.is_empty() {
            return Err(LabelError::InvalidParameter(
                "candidate_thresholds must not be empty".into(),
            ));
        }
        if self.candidate_thresholds.iter().any(|t| !t.is_finite()) {
            return Err(LabelError::InvalidParameter(
                "candidate_thresholds must be finite".into(),
            ));
        }
        Ok(())
    }

    /// Converts a recorded speed into the base unit.
    pub fn to_base_speed(&self, recorded: f64) -> f64 {
        recorded / self.speed_unit_factor
    }

    /// Duration in seconds of `samples` sample intervals.
    pub fn samples_to_seconds(&self, samples: usize) -> f64 {
        samples as f64 * self.sample_interval_s
    }

    /// SHA-256 of the serialized configuration, stamped into labeling output.
    pub fn fingerprint(&self) -> Result<String, LabelError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| LabelError::Serialization(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
