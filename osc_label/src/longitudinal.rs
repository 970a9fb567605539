//! Longitudinal maneuver masks from acceleration and speed.
//!
//! Accelerate, decelerate and keep-velocity are run-length gated: a run is
//! stamped only once it ends (or the series ends) and is long enough. Runs
//! that fall short are parked in a buffer shared by the three kinds, and the
//! next qualifying run of any kind absorbs the parked samples. Reversing and
//! standstill are instantaneous; start and stop are overlays driven by speed.

use std::ops::Range;

use crate::intervals::ManeuverKind;
use crate::signal::smoothed_acceleration;
use crate::LabelingConfig;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LongitudinalMasks {
    pub accelerate: Vec<bool>,
    pub decelerate: Vec<bool>,
    pub keep_velocity: Vec<bool>,
    pub standstill: Vec<bool>,
    pub start: Vec<bool>,
    pub stop: Vec<bool>,
    pub reversing: Vec<bool>,
}

impl LongitudinalMasks {
    fn zeros(n: usize) -> Self {
        Self {
            accelerate: vec![false; n],
            decelerate: vec![false; n],
            keep_velocity: vec![false; n],
            standstill: vec![false; n],
            start: vec![false; n],
            stop: vec![false; n],
            reversing: vec![false; n],
        }
    }

    pub fn len(&self) -> usize {
        self.accelerate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accelerate.is_empty()
    }

    /// Mask for a longitudinal kind; `None` for lane changes.
    pub fn get(&self, kind: ManeuverKind) -> Option<&[bool]> {
        let mask = match kind {
            ManeuverKind::Accelerate => &self.accelerate,
            ManeuverKind::Decelerate => &self.decelerate,
            ManeuverKind::KeepVelocity => &self.keep_velocity,
            ManeuverKind::Standstill => &self.standstill,
            ManeuverKind::Start => &self.start,
            ManeuverKind::Stop => &self.stop,
            ManeuverKind::Reversing => &self.reversing,
            ManeuverKind::LaneChangeLeft | ManeuverKind::LaneChangeRight => return None,
        };
        Some(mask)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum RunState {
    #[default]
    Idle,
    Active {
        len: usize,
    },
}

/// Run-length gate for one threshold-driven kind.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RunTracker {
    state: RunState,
}

impl RunTracker {
    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state, RunState::Active { .. })
    }

    /// Feeds the condition at `index`. Returns the span to stamp when a
    /// qualifying run ends on this sample.
    pub(crate) fn step(
        &mut self,
        condition: bool,
        index: usize,
        min_len: f64,
        buffer: &mut usize,
    ) -> Option<Range<usize>> {
        if condition {
            self.state = match self.state {
                RunState::Idle => RunState::Active { len: 1 },
                RunState::Active { len } => RunState::Active { len: len + 1 },
            };
            return None;
        }

        let len = match std::mem::take(&mut self.state) {
            RunState::Idle => 0,
            RunState::Active { len } => len,
        };
        if len > 0 && len as f64 >= min_len {
            let total = len + *buffer;
            *buffer = 0;
            Some(index.saturating_sub(total)..index)
        } else {
            *buffer += len;
            None
        }
    }

    /// Span of a run still open at the end of an `n`-sample series.
    pub(crate) fn flush(&self, n: usize, buffer: usize) -> Option<Range<usize>> {
        match self.state {
            RunState::Active { len } => Some(n.saturating_sub(len + buffer)..n),
            RunState::Idle => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum StartState {
    #[default]
    Idle,
    /// Speed is zero; the next positive sample begins a start.
    Armed,
    Counting(usize),
}

/// Start overlay: from rest until the speed ceiling, a deceleration, or rest.
#[derive(Clone, Copy, Debug, Default)]
struct StartTracker {
    state: StartState,
}

impl StartTracker {
    fn step(
        &mut self,
        speed: Option<f64>,
        index: usize,
        ceiling: f64,
        decelerating: bool,
    ) -> Option<Range<usize>> {
        let v = speed?;
        if v == 0.0 {
            self.state = StartState::Armed;
            return None;
        }
        if v < 0.0 {
            return None;
        }
        let count = match self.state {
            StartState::Idle => return None,
            StartState::Armed => 2,
            StartState::Counting(c) => c + 1,
        };
        self.state = if v > ceiling || decelerating {
            StartState::Idle
        } else {
            StartState::Counting(count)
        };
        Some(index.saturating_sub(count)..index)
    }
}

/// Stop overlay: a slow roll that ends at rest, cancelled by propulsion.
#[derive(Clone, Copy, Debug, Default)]
struct StopTracker {
    count: usize,
}

impl StopTracker {
    fn step(
        &mut self,
        speed: Option<f64>,
        index: usize,
        ceiling: f64,
        propelled: bool,
    ) -> Option<Range<usize>> {
        let mut stamp = None;
        if self.count > 0 && speed == Some(0.0) {
            stamp = Some(index.saturating_sub(self.count)..index);
            self.count = 0;
        }
        match speed {
            Some(v) if v > 0.0 && v < ceiling => self.count += 1,
            _ => self.count = 0,
        }
        if propelled {
            self.count = 0;
        }
        stamp
    }
}

fn stamp(mask: &mut [bool], span: Option<Range<usize>>) {
    if let Some(span) = span {
        let end = span.end.min(mask.len());
        let start = span.start.min(end);
        mask[start..end].iter_mut().for_each(|m| *m = true);
    }
}

/// Labels every timestep of one entity.
///
/// `acceleration` is the conditioner output (base units / s²); `speed` is in
/// recorded units, as is `cfg.start_speed_ceiling`.
pub fn detect_longitudinal_from_acceleration(
    acceleration: &[Option<f64>],
    speed: &[Option<f64>],
    threshold: f64,
    cfg: &LabelingConfig,
) -> LongitudinalMasks {
    let n = speed.len().min(acceleration.len());
    let mut masks = LongitudinalMasks::zeros(n);
    let min_len = cfg.min_run_length;
    let ceiling = cfg.start_speed_ceiling;

    let mut accelerate = RunTracker::default();
    let mut decelerate = RunTracker::default();
    let mut keep = RunTracker::default();
    let mut buffer = 0usize;
    let mut start = StartTracker::default();
    let mut stop = StopTracker::default();

    for i in 0..n {
        let acc = acceleration[i];
        let v = speed[i];

        let span = accelerate.step(acc.is_some_and(|a| a > threshold), i, min_len, &mut buffer);
        stamp(&mut masks.accelerate, span);

        let span = decelerate.step(acc.is_some_and(|a| a < -threshold), i, min_len, &mut buffer);
        stamp(&mut masks.decelerate, span);

        let steady = acc.is_some_and(|a| a.abs() < threshold) && v != Some(0.0);
        let span = keep.step(steady, i, min_len, &mut buffer);
        stamp(&mut masks.keep_velocity, span);

        if v.is_some_and(|s| s < 0.0) {
            masks.reversing[i] = true;
        }
        if v == Some(0.0) {
            masks.standstill[i] = true;
        }

        let span = start.step(v, i, ceiling, decelerate.is_active());
        stamp(&mut masks.start, span);

        let propelled = accelerate.is_active() || keep.is_active();
        let span = stop.step(v, i, ceiling, propelled);
        stamp(&mut masks.stop, span);
    }

    stamp(&mut masks.accelerate, accelerate.flush(n, buffer));
    stamp(&mut masks.decelerate, decelerate.flush(n, buffer));
    stamp(&mut masks.keep_velocity, keep.flush(n, buffer));

    masks
}

/// Conditions `speed` and labels it in one call.
pub fn detect_longitudinal(
    speed: &[Option<f64>],
    threshold: f64,
    cfg: &LabelingConfig,
) -> LongitudinalMasks {
    let acceleration = smoothed_acceleration(speed, cfg);
    detect_longitudinal_from_acceleration(&acceleration, speed, threshold, cfg)
}
