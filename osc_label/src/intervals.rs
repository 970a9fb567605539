//! Compression of per-timestep masks into maneuver intervals.

use std::fmt;

use geo::Coord;
use serde::{Deserialize, Serialize};

use crate::frame::{CoordinateFrame, Position};
use crate::lateral::LateralMasks;
use crate::longitudinal::LongitudinalMasks;
use crate::{LabelError, LabelingConfig};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ManeuverKind {
    Accelerate,
    Decelerate,
    KeepVelocity,
    Standstill,
    Start,
    Stop,
    Reversing,
    LaneChangeLeft,
    LaneChangeRight,
}

impl ManeuverKind {
    /// Longitudinal kinds in extraction order.
    pub const LONGITUDINAL: [ManeuverKind; 7] = [
        ManeuverKind::Standstill,
        ManeuverKind::Accelerate,
        ManeuverKind::KeepVelocity,
        ManeuverKind::Decelerate,
        ManeuverKind::Start,
        ManeuverKind::Stop,
        ManeuverKind::Reversing,
    ];

    /// Lane-change kinds, left first.
    pub const LATERAL: [ManeuverKind; 2] =
        [ManeuverKind::LaneChangeLeft, ManeuverKind::LaneChangeRight];

    pub fn label(&self) -> &'static str {
        match self {
            ManeuverKind::Accelerate => "accelerate",
            ManeuverKind::Decelerate => "decelerate",
            ManeuverKind::KeepVelocity => "keep_velocity",
            ManeuverKind::Standstill => "standstill",
            ManeuverKind::Start => "start",
            ManeuverKind::Stop => "stop",
            ManeuverKind::Reversing => "reversing",
            ManeuverKind::LaneChangeLeft => "lane_change_left",
            ManeuverKind::LaneChangeRight => "lane_change_right",
        }
    }

    /// Kinds that drive the speed model between rest periods.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            ManeuverKind::Accelerate | ManeuverKind::Decelerate | ManeuverKind::KeepVelocity
        )
    }

    pub fn is_lateral(&self) -> bool {
        matches!(self, ManeuverKind::LaneChangeLeft | ManeuverKind::LaneChangeRight)
    }
}

impl fmt::Display for ManeuverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaneChangeDirection {
    Left,
    Right,
}

impl TryFrom<ManeuverKind> for LaneChangeDirection {
    type Error = LabelError;

    fn try_from(kind: ManeuverKind) -> Result<Self, Self::Error> {
        match kind {
            ManeuverKind::LaneChangeLeft => Ok(LaneChangeDirection::Left),
            ManeuverKind::LaneChangeRight => Ok(LaneChangeDirection::Right),
            other => Err(LabelError::UnknownManeuver(other.label().to_string())),
        }
    }
}

/// One contiguous run of a mask, `start_index..=end_index`.
///
/// Longitudinal records carry the base-unit speed at `end_index` and the
/// mean acceleration magnitude; lane changes carry their duration in seconds
/// as `rate` and a zero target speed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManeuverInterval {
    pub start_index: usize,
    pub end_index: usize,
    pub kind: ManeuverKind,
    pub trigger: Option<Position>,
    pub target_speed: f64,
    pub rate: f64,
}

impl ManeuverInterval {
    pub fn samples(&self) -> usize {
        self.end_index + 1 - self.start_index
    }
}

/// Recorded speed at `index`, falling back to the nearest present sample
/// (earlier first), else zero.
fn speed_near(speed: &[Option<f64>], index: usize) -> f64 {
    let at = |i: usize| speed.get(i).copied().flatten();
    if let Some(v) = at(index) {
        return v;
    }
    let earlier = (0..index.min(speed.len())).rev().find_map(at);
    earlier
        .or_else(|| (index + 1..speed.len()).find_map(at))
        .unwrap_or(0.0)
}

fn trigger_at(
    positions: &[Option<Coord<f64>>],
    index: usize,
    frame: &dyn CoordinateFrame,
) -> Option<Position> {
    positions
        .get(index)
        .copied()
        .flatten()
        .map(|p| frame.to_output(p))
}

struct Extractor<'a> {
    speed: &'a [Option<f64>],
    positions: &'a [Option<Coord<f64>>],
    frame: &'a dyn CoordinateFrame,
    cfg: &'a LabelingConfig,
    out: Vec<ManeuverInterval>,
}

impl<'a> Extractor<'a> {
    fn open(&mut self, kind: ManeuverKind, index: usize) -> usize {
        self.out.push(ManeuverInterval {
            start_index: index,
            end_index: index,
            kind,
            trigger: trigger_at(self.positions, index, self.frame),
            target_speed: 0.0,
            rate: 0.0,
        });
        self.out.len() - 1
    }

    /// Closes a longitudinal record whose last sample is `end`.
    fn close_longitudinal(&mut self, slot: usize, end: usize) {
        let cfg = self.cfg;
        let start = self.out[slot].start_index;
        let v_start = cfg.to_base_speed(speed_near(self.speed, start));
        let v_end = cfg.to_base_speed(speed_near(self.speed, end));
        let record = &mut self.out[slot];
        record.end_index = end;
        record.target_speed = v_end;
        record.rate = (v_end - v_start).abs() / cfg.samples_to_seconds(end + 1 - start);
    }

    fn close_lateral(&mut self, slot: usize, end: usize) {
        let record = &mut self.out[slot];
        record.end_index = end;
        record.rate = self.cfg.samples_to_seconds(end + 1 - record.start_index);
    }
}

/// Longitudinal intervals of one entity, ordered by opening time.
///
/// While a standstill is open no other kind may open; once it closes, any
/// kind whose mask is still set opens afresh. Opening a standstill forces
/// to zero the target speed of the most recently closed accelerate,
/// decelerate or keep-velocity record, and of every record closing on the
/// sample before it. Records still open at the end close on the last sample.
pub fn extract_longitudinal(
    masks: &LongitudinalMasks,
    speed: &[Option<f64>],
    positions: &[Option<Coord<f64>>],
    frame: &dyn CoordinateFrame,
    cfg: &LabelingConfig,
) -> Vec<ManeuverInterval> {
    let n = masks.len();
    let mut ex = Extractor {
        speed,
        positions,
        frame,
        cfg,
        out: Vec::new(),
    };
    let kinds = ManeuverKind::LONGITUDINAL;
    let mut open: [Option<usize>; 7] = [None; 7];
    let mut last_motion: Option<usize> = None;
    let mut closed_now: Vec<usize> = Vec::new();

    for i in 0..n {
        closed_now.clear();
        for (k, kind) in kinds.iter().enumerate() {
            let on = masks.get(*kind).is_some_and(|m| m[i]);
            if let (false, Some(slot)) = (on, open[k]) {
                ex.close_longitudinal(slot, i - 1);
                open[k] = None;
                closed_now.push(slot);
                if kind.is_motion() {
                    last_motion = Some(slot);
                }
            }
        }
        for (k, kind) in kinds.iter().enumerate() {
            let on = masks.get(*kind).is_some_and(|m| m[i]);
            if !on || open[k].is_some() {
                continue;
            }
            let standstill_open = open[0].is_some();
            if *kind == ManeuverKind::Standstill {
                for &slot in last_motion.iter().chain(closed_now.iter()) {
                    ex.out[slot].target_speed = 0.0;
                }
            } else if standstill_open {
                continue;
            }
            open[k] = Some(ex.open(*kind, i));
        }
    }

    for slot in open.into_iter().flatten() {
        ex.close_longitudinal(slot, n - 1);
    }
    ex.out
}

/// Lane-change intervals of one entity; open records close on the last
/// sample.
pub fn extract_lateral(
    masks: &LateralMasks,
    positions: &[Option<Coord<f64>>],
    frame: &dyn CoordinateFrame,
    cfg: &LabelingConfig,
) -> Vec<ManeuverInterval> {
    let n = masks.left.len();
    let mut ex = Extractor {
        speed: &[],
        positions,
        frame,
        cfg,
        out: Vec::new(),
    };
    let series = [&masks.left, &masks.right];
    let mut open: [Option<usize>; 2] = [None; 2];

    for i in 0..n {
        for (k, (kind, mask)) in ManeuverKind::LATERAL.iter().zip(series).enumerate() {
            let on = mask.get(i).copied().unwrap_or(false);
            match (on, open[k]) {
                (true, None) => open[k] = Some(ex.open(*kind, i)),
                (false, Some(slot)) => {
                    ex.close_lateral(slot, i - 1);
                    open[k] = None;
                }
                _ => {}
            }
        }
    }
    for slot in open.into_iter().flatten() {
        ex.close_lateral(slot, n - 1);
    }
    ex.out
}

/// Boolean mask of length `len` set on every sample covered by an interval
/// of `kind`.
pub fn expand_intervals(intervals: &[ManeuverInterval], kind: ManeuverKind, len: usize) -> Vec<bool> {
    let mut mask = vec![false; len];
    for iv in intervals.iter().filter(|iv| iv.kind == kind) {
        let end = (iv.end_index + 1).min(len);
        let start = iv.start_index.min(end);
        mask[start..end].iter_mut().for_each(|m| *m = true);
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PlanarFrame;
    use crate::longitudinal::{detect_longitudinal, detect_longitudinal_from_acceleration};

    fn mask(bits: &[u8]) -> Vec<bool> {
        bits.iter().map(|b| *b == 1).collect()
    }

    fn track(n: usize) -> Vec<Option<Coord<f64>>> {
        (0..n).map(|i| Some(Coord { x: i as f64, y: 0.0 })).collect()
    }

    fn empty_masks(n: usize) -> LongitudinalMasks {
        detect_longitudinal(&vec![None; n], 0.2, &LabelingConfig::default())
    }

    #[test]
    fn closes_on_falling_edge_with_target_and_rate() {
        let cfg = LabelingConfig::default();
        let mut masks = empty_masks(6);
        masks.accelerate = mask(&[0, 1, 1, 1, 0, 0]);
        let speed: Vec<Option<f64>> = [0.0, 36.0, 72.0, 108.0, 108.0, 108.0]
            .iter()
            .copied()
            .map(Some)
            .collect();
        let out = extract_longitudinal(&masks, &speed, &track(6), &PlanarFrame::default(), &cfg);
        assert_eq!(out.len(), 1);
        let iv = &out[0];
        assert_eq!((iv.start_index, iv.end_index), (1, 3));
        assert!((iv.target_speed - 30.0).abs() < 1e-9);
        // 10 m/s -> 30 m/s across three samples of 0.1 s.
        assert!((iv.rate - 20.0 / 0.3).abs() < 1e-9);
        assert_eq!(iv.trigger, Some(Position { x: 0.0, y: 1.0 }));
    }

    #[test]
    fn standstill_suppresses_and_zeroes_previous_target() {
        let cfg = LabelingConfig::default();
        let mut masks = empty_masks(8);
        masks.decelerate = mask(&[1, 1, 1, 0, 0, 0, 0, 0]);
        masks.standstill = mask(&[0, 0, 0, 1, 1, 0, 0, 0]);
        masks.start = mask(&[0, 0, 1, 1, 1, 1, 0, 0]);
        let speed = vec![Some(7.2), Some(3.6), Some(1.8), Some(0.0), Some(0.0), Some(3.6), Some(7.2), Some(7.2)];
        let out = extract_longitudinal(&masks, &speed, &track(8), &PlanarFrame::default(), &cfg);
        let kinds: Vec<ManeuverKind> = out.iter().map(|iv| iv.kind).collect();
        assert_eq!(
            kinds,
            vec![ManeuverKind::Decelerate, ManeuverKind::Start, ManeuverKind::Standstill]
        );
        // Decelerate ended at 1.8 km/h but is forced to rest.
        assert_eq!(out[0].target_speed, 0.0);
        assert_eq!((out[2].start_index, out[2].end_index), (3, 4));
    }

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn standstill_zeroes_deceleration_closing_beside_stop() {
        let cfg = LabelingConfig::default();
        let speed = some(&[30.0, 15.0, 10.0, 5.0, 0.0, 0.0]);
        let acc = some(&[-5.0, -5.0, -5.0, -5.0, 0.0, 0.0]);
        let masks = detect_longitudinal_from_acceleration(&acc, &speed, 0.2, &cfg);
        let out = extract_longitudinal(&masks, &speed, &track(6), &PlanarFrame::default(), &cfg);
        let spans: Vec<(ManeuverKind, usize, usize)> =
            out.iter().map(|iv| (iv.kind, iv.start_index, iv.end_index)).collect();
        assert_eq!(
            spans,
            vec![
                (ManeuverKind::Decelerate, 0, 3),
                (ManeuverKind::Stop, 1, 3),
                (ManeuverKind::Standstill, 4, 5),
            ]
        );
        assert_eq!(out[0].target_speed, 0.0);
        assert_eq!(out[1].target_speed, 0.0);
    }

    #[test]
    fn standstill_zeroes_last_motion_record_closed_earlier() {
        let cfg = LabelingConfig::default();
        let mut masks = empty_masks(6);
        masks.decelerate = mask(&[1, 1, 1, 0, 0, 0]);
        masks.stop = mask(&[0, 1, 1, 1, 0, 0]);
        masks.standstill = mask(&[0, 0, 0, 0, 1, 1]);
        let speed = some(&[30.0, 15.0, 10.0, 5.0, 0.0, 0.0]);
        let out = extract_longitudinal(&masks, &speed, &track(6), &PlanarFrame::default(), &cfg);
        assert_eq!(out[0].kind, ManeuverKind::Decelerate);
        assert_eq!(out[0].end_index, 2);
        assert_eq!(out[0].target_speed, 0.0);
        assert_eq!(out[1].kind, ManeuverKind::Stop);
        assert_eq!(out[1].target_speed, 0.0);
    }

    #[test]
    fn mask_still_set_after_standstill_opens_fresh() {
        let cfg = LabelingConfig::default();
        let mut masks = empty_masks(6);
        masks.standstill = mask(&[1, 1, 0, 0, 0, 0]);
        masks.start = mask(&[0, 1, 1, 1, 0, 0]);
        let speed = vec![Some(0.0), Some(0.0), Some(3.6), Some(7.2), Some(10.8), Some(10.8)];
        let out = extract_longitudinal(&masks, &speed, &track(6), &PlanarFrame::default(), &cfg);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].kind, ManeuverKind::Start);
        assert_eq!((out[1].start_index, out[1].end_index), (2, 3));
    }

    #[test]
    fn longitudinal_round_trip_reproduces_detector_masks() {
        let cfg = LabelingConfig::default();
        let mut speed = Vec::new();
        for v in [30.0, 30.0, 30.0, 30.0, 30.0, 30.0] {
            speed.push(Some(v));
        }
        for i in 1..=8 {
            speed.push(Some(30.0 + 4.0 * i as f64));
        }
        for _ in 0..6 {
            speed.push(Some(62.0));
        }
        for i in 1..=6 {
            speed.push(Some(62.0 - 5.0 * i as f64));
        }
        let masks = detect_longitudinal(&speed, 0.2, &cfg);
        let n = speed.len();
        let out = extract_longitudinal(&masks, &speed, &track(n), &PlanarFrame::default(), &cfg);
        for kind in [
            ManeuverKind::Accelerate,
            ManeuverKind::Decelerate,
            ManeuverKind::KeepVelocity,
            ManeuverKind::Reversing,
        ] {
            let original = masks.get(kind).unwrap_or(&[]);
            assert_eq!(expand_intervals(&out, kind, n), original, "{kind}");
        }
        assert!(masks.accelerate.iter().any(|m| *m));
        assert!(masks.decelerate.iter().any(|m| *m));
    }

    #[test]
    fn ramp_from_rest_round_trips_outside_the_standstill() {
        let cfg = LabelingConfig::default();
        let speed = some(&[0.0, 0.0, 3.6, 7.2, 10.8, 10.8, 10.8, 10.8]);
        let acc = some(&[5.0, 5.0, 5.0, 5.0, 0.0, 0.0, 0.0, 0.0]);
        let masks = detect_longitudinal_from_acceleration(&acc, &speed, 0.2, &cfg);
        assert_eq!(masks.accelerate, mask(&[1, 1, 1, 1, 0, 0, 0, 0]));
        assert_eq!(masks.start, mask(&[1, 1, 1, 1, 1, 1, 1, 0]));
        let out = extract_longitudinal(&masks, &speed, &track(8), &PlanarFrame::default(), &cfg);

        for kind in [ManeuverKind::Standstill, ManeuverKind::KeepVelocity] {
            assert_eq!(expand_intervals(&out, kind, 8), masks.get(kind).unwrap_or(&[]), "{kind}");
        }
        // Samples at rest belong to the standstill; the rest of each mask survives.
        for kind in [ManeuverKind::Accelerate, ManeuverKind::Start] {
            let moving: Vec<bool> = masks
                .get(kind)
                .unwrap_or(&[])
                .iter()
                .zip(&masks.standstill)
                .map(|(m, rest)| *m && !*rest)
                .collect();
            assert_ne!(moving, masks.get(kind).unwrap_or(&[]), "{kind}");
            assert_eq!(expand_intervals(&out, kind, 8), moving, "{kind}");
        }
    }

    #[test]
    fn lateral_round_trip_and_end_closure() {
        let cfg = LabelingConfig::default();
        let masks = LateralMasks {
            left: mask(&[0, 1, 1, 0, 0, 1, 1]),
            right: mask(&[1, 0, 0, 0, 1, 0, 0]),
        };
        let out = extract_lateral(&masks, &track(7), &PlanarFrame::default(), &cfg);
        assert_eq!(expand_intervals(&out, ManeuverKind::LaneChangeLeft, 7), masks.left);
        assert_eq!(expand_intervals(&out, ManeuverKind::LaneChangeRight, 7), masks.right);
        let last = out
            .iter()
            .find(|iv| iv.kind == ManeuverKind::LaneChangeLeft && iv.start_index == 5)
            .unwrap();
        assert_eq!(last.end_index, 6);
        assert!((last.rate - 0.2).abs() < 1e-12);
    }

    #[test]
    fn absent_position_leaves_trigger_empty() {
        let cfg = LabelingConfig::default();
        let masks = LateralMasks {
            left: mask(&[1, 1]),
            right: mask(&[0, 0]),
        };
        let out = extract_lateral(&masks, &[None, None], &PlanarFrame::default(), &cfg);
        assert_eq!(out.len(), 1);
        assert!(out[0].trigger.is_none());
    }

    #[test]
    fn missing_speed_uses_nearest_sample() {
        let speed = vec![None, Some(3.0), None, None, Some(9.0)];
        assert_eq!(speed_near(&speed, 0), 3.0);
        assert_eq!(speed_near(&speed, 3), 3.0);
        assert_eq!(speed_near(&speed, 4), 9.0);
        assert_eq!(speed_near(&[None, None], 1), 0.0);
    }

    #[test]
    fn only_lane_changes_map_to_directions() {
        assert_eq!(
            LaneChangeDirection::try_from(ManeuverKind::LaneChangeRight).unwrap(),
            LaneChangeDirection::Right
        );
        assert!(matches!(
            LaneChangeDirection::try_from(ManeuverKind::Stop),
            Err(LabelError::UnknownManeuver(_))
        ));
    }
}
