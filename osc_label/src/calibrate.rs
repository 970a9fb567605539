//! Per-entity acceleration threshold search.
//!
//! Each candidate threshold is scored by replaying the longitudinal pipeline,
//! rebuilding a speed trace from the extracted intervals alone and comparing
//! it with the observed trace.

use ndarray::Array1;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::frame::CoordinateFrame;
use crate::intervals::{extract_longitudinal, ManeuverInterval, ManeuverKind};
use crate::longitudinal::detect_longitudinal;
use crate::table::{EntityRole, EntitySeries, TrajectoryTable};
use crate::{LabelError, LabelingConfig};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntityThreshold {
    pub role: EntityRole,
    pub threshold: f64,
    pub rmse: f64,
    /// `(candidate, rmse)` in grid order.
    pub scores: Vec<(f64, f64)>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CalibrationResult {
    /// Ego first, then objects in table order.
    pub thresholds: Vec<EntityThreshold>,
}

impl CalibrationResult {
    pub fn values(&self) -> Vec<f64> {
        self.thresholds.iter().map(|t| t.threshold).collect()
    }
}

fn speed_model_sign(iv: &ManeuverInterval, prev_target: f64) -> Option<f64> {
    match iv.kind {
        ManeuverKind::Accelerate => Some(1.0),
        ManeuverKind::Decelerate => Some(-1.0),
        ManeuverKind::Standstill => Some(0.0),
        ManeuverKind::KeepVelocity if iv.target_speed >= prev_target => Some(1.0),
        ManeuverKind::KeepVelocity => Some(-1.0),
        _ => None,
    }
}

/// Rebuilds a speed trace (recorded units) from longitudinal intervals.
///
/// Only accelerate, decelerate, keep-velocity and standstill records take
/// part. Each applies its rate as a constant acceleration, signed by kind
/// (keep-velocity follows the direction of its target speed relative to the
/// previous record). A record overlapping its predecessor only contributes
/// the samples past the predecessor's end.
pub fn reconstruct_speed(
    intervals: &[ManeuverInterval],
    init_speed: f64,
    cfg: &LabelingConfig,
) -> Vec<f64> {
    let mut acceleration: Vec<f64> = Vec::new();
    let mut prev: Option<&ManeuverInterval> = None;
    for iv in intervals {
        let prev_target = match prev {
            Some(p) => p.target_speed,
            None => cfg.to_base_speed(init_speed),
        };
        let Some(sign) = speed_model_sign(iv, prev_target) else {
            continue;
        };
        let len = match prev {
            Some(p) if p.end_index >= iv.start_index => iv.end_index.saturating_sub(p.end_index),
            _ => iv.samples(),
        };
        acceleration.extend(std::iter::repeat(iv.rate * sign).take(len));
        prev = Some(iv);
    }

    let step = cfg.sample_interval_s * cfg.speed_unit_factor;
    let mut v = init_speed;
    acceleration
        .iter()
        .map(|a| {
            let current = v;
            v += a * step;
            current
        })
        .collect()
}

/// Root-mean-square error between the two traces, tolerating one extra
/// trailing sample on either side.
fn score(model: &[f64], observed: &[f64]) -> Option<f64> {
    let n = match model.len().abs_diff(observed.len()) {
        0 | 1 => model.len().min(observed.len()),
        _ => return None,
    };
    if n == 0 {
        return None;
    }
    let a = Array1::from_vec(model[..n].to_vec());
    let b = Array1::from_vec(observed[..n].to_vec());
    let diff = a - b;
    let mse = diff.mapv(|d| d * d).mean()?;
    let rmse = mse.sqrt();
    rmse.is_finite().then_some(rmse)
}

fn score_candidate(
    entity: &EntitySeries,
    observed: &[f64],
    threshold: f64,
    frame: &dyn CoordinateFrame,
    cfg: &LabelingConfig,
) -> f64 {
    let masks = detect_longitudinal(&entity.speed, threshold, cfg);
    let intervals = extract_longitudinal(&masks, &entity.speed, &entity.positions(), frame, cfg);
    let model = match observed.first() {
        Some(init) => reconstruct_speed(&intervals, *init, cfg),
        None => Vec::new(),
    };
    match score(&model, observed) {
        Some(rmse) => rmse,
        None => {
            warn!(
                "{}: threshold {:.2} scored with penalty (model {} samples, observed {})",
                entity.role,
                threshold,
                model.len(),
                observed.len()
            );
            cfg.mismatch_penalty
        }
    }
}

fn calibrate_entity(
    entity: &EntitySeries,
    frame: &dyn CoordinateFrame,
    cfg: &LabelingConfig,
) -> EntityThreshold {
    let observed = entity.observed_speed();
    let scores: Vec<(f64, f64)> = cfg
        .candidate_thresholds
        .iter()
        .map(|&t| (t, score_candidate(entity, &observed, t, frame, cfg)))
        .collect();
    let (threshold, rmse) = scores
        .iter()
        .copied()
        .min_by_key(|(_, rmse)| OrderedFloat(*rmse))
        .unwrap_or((cfg.acceleration_threshold, cfg.mismatch_penalty));
    debug!("{}: threshold {:.2} (rmse {:.4})", entity.role, threshold, rmse);
    EntityThreshold {
        role: entity.role,
        threshold,
        rmse,
        scores,
    }
}

/// Chooses one threshold per entity from `cfg.candidate_thresholds`.
///
/// Entities are scored in parallel; within an entity the grid is scanned in
/// order and the first minimum wins.
pub fn calibrate_thresholds(
    table: &TrajectoryTable,
    frame: &dyn CoordinateFrame,
    cfg: &LabelingConfig,
) -> Result<CalibrationResult, LabelError> {
    cfg.validate()?;
    let entities: Vec<&EntitySeries> = table.entities().collect();
    let thresholds: Vec<EntityThreshold> = entities
        .par_iter()
        .map(|entity| calibrate_entity(entity, frame, cfg))
        .collect();
    info!(
        "Calibrated {} entities over {} candidates",
        thresholds.len(),
        cfg.candidate_thresholds.len()
    );
    Ok(CalibrationResult { thresholds })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PlanarFrame;
    use crate::table::EntityColumns;

    fn interval(start: usize, end: usize, kind: ManeuverKind, target: f64, rate: f64) -> ManeuverInterval {
        ManeuverInterval {
            start_index: start,
            end_index: end,
            kind,
            trigger: None,
            target_speed: target,
            rate,
        }
    }

    fn entity(role: EntityRole, speed: &[f64]) -> EntitySeries {
        let n = speed.len();
        let columns = match role {
            EntityRole::Ego => EntityColumns::ego(),
            EntityRole::Object(i) => EntityColumns::object(&i.to_string()),
        };
        EntitySeries::new(
            role,
            columns,
            (0..n).map(|i| Some(i as f64)).collect(),
            vec![Some(0.0); n],
            speed.iter().copied().map(Some).collect(),
        )
        .unwrap()
    }

    #[test]
    fn reconstruction_integrates_signed_rates() {
        let cfg = LabelingConfig::default();
        let intervals = vec![
            interval(0, 2, ManeuverKind::Accelerate, 5.0, 10.0),
            interval(3, 4, ManeuverKind::Decelerate, 2.0, 5.0),
            interval(3, 4, ManeuverKind::Start, 2.0, 99.0),
        ];
        let speed = reconstruct_speed(&intervals, 0.0, &cfg);
        assert_eq!(speed.len(), 5);
        // +10 m/s² = +3.6 km/h per sample, then -5 m/s² = -1.8 km/h.
        let expected = [0.0, 3.6, 7.2, 10.8, 9.0];
        for (a, b) in speed.iter().zip(expected) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn keep_velocity_sign_follows_previous_target() {
        let cfg = LabelingConfig::default();
        let intervals = vec![
            interval(0, 1, ManeuverKind::KeepVelocity, 9.0, 1.0),
            interval(2, 3, ManeuverKind::KeepVelocity, 8.0, 1.0),
        ];
        // Initial 36 km/h = 10 m/s, first target 9 < 10 -> negative.
        let speed = reconstruct_speed(&intervals, 36.0, &cfg);
        assert!(speed[1] < speed[0]);
        assert!(speed[3] < speed[2]);
    }

    #[test]
    fn overlapping_records_only_add_the_tail() {
        let cfg = LabelingConfig::default();
        let intervals = vec![
            interval(0, 4, ManeuverKind::Accelerate, 1.0, 0.0),
            interval(3, 6, ManeuverKind::Decelerate, 0.0, 0.0),
        ];
        assert_eq!(reconstruct_speed(&intervals, 1.0, &cfg).len(), 7);
    }

    #[test]
    fn score_tolerates_one_sample_and_penalises_more() {
        assert_eq!(score(&[1.0, 2.0, 3.0], &[1.0, 2.0]), Some(0.0));
        assert_eq!(score(&[1.0, 2.0], &[1.0, 4.0, 9.0]), Some((2.0f64).sqrt()));
        assert_eq!(score(&[1.0], &[1.0, 2.0, 3.0]), None);
        assert_eq!(score(&[], &[]), None);
    }

    #[test]
    fn constant_speed_is_reconstructed_exactly() {
        let cfg = LabelingConfig::default();
        let ego = entity(EntityRole::Ego, &[40.0; 20]);
        let result = calibrate_entity(&ego, &PlanarFrame::default(), &cfg);
        assert_eq!(result.scores.len(), 6);
        assert!(result.rmse < 1e-9);
        // Every candidate fits; the first one in grid order wins.
        assert_eq!(result.threshold, 0.05);
    }

    #[test]
    fn entity_without_speed_gets_penalty() {
        let cfg = LabelingConfig::default();
        let mut ego = entity(EntityRole::Ego, &[0.0; 4]);
        ego.speed = vec![None; 4];
        let result = calibrate_entity(&ego, &PlanarFrame::default(), &cfg);
        assert_eq!(result.rmse, cfg.mismatch_penalty);
        assert_eq!(result.threshold, cfg.candidate_thresholds[0]);
    }

    #[test]
    fn calibration_is_deterministic() {
        let cfg = LabelingConfig::default();
        let mut ramp: Vec<f64> = vec![30.0; 10];
        ramp.extend((1..=15).map(|i| 30.0 + 0.05 * i as f64 * i as f64));
        ramp.extend(vec![41.25; 10]);
        let ego = entity(EntityRole::Ego, &ramp);
        let obj = entity(EntityRole::Object(0), &[20.0; 35]);
        let table = TrajectoryTable::new(ego, vec![obj]).unwrap();
        let frame = PlanarFrame::default();
        let first = calibrate_thresholds(&table, &frame, &cfg).unwrap();
        for _ in 0..3 {
            assert_eq!(calibrate_thresholds(&table, &frame, &cfg).unwrap(), first);
        }
        assert_eq!(first.thresholds.len(), 2);
        assert_eq!(first.thresholds[1].role, EntityRole::Object(0));
        assert!(cfg.candidate_thresholds.contains(&first.values()[0]));
    }
}
