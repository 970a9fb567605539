//! Optional pruning of tracked objects that carry no useful behavior.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::table::{EntityRole, EntitySeries, TrajectoryTable};
use crate::{LabelError, LabelingConfig};

/// Thresholds for dropping objects before labeling.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObjectFilter {
    /// Objects with fewer present positions are dropped.
    pub min_samples: usize,
    /// Objects shorter than this that shadow the ego's speed are dropped.
    pub short_track_samples: usize,
    /// Sum of squared speed differences (recorded units) under which a short
    /// object counts as shadowing the ego.
    pub max_ego_speed_deviation: f64,
    /// Largest plausible sample-to-sample acceleration, base units / s².
    pub max_acceleration: f64,
}

impl Default for ObjectFilter {
    fn default() -> Self {
        Self {
            min_samples: 8,
            short_track_samples: 50,
            max_ego_speed_deviation: 50.0,
            max_acceleration: 250.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DropReason {
    TooFewSamples,
    ShadowsEgo,
    ImplausibleJump,
}

/// First contiguous run of present positions, inclusive bounds.
fn first_run(obj: &EntitySeries) -> Option<(usize, usize)> {
    let first = (0..obj.len()).find(|&i| obj.position(i).is_some())?;
    let last = (first + 1..obj.len())
        .find(|&i| obj.position(i).is_none())
        .map(|i| i - 1)
        .unwrap_or(obj.len() - 1);
    Some((first, last))
}

fn drop_reason(
    obj: &EntitySeries,
    ego: &EntitySeries,
    filter: &ObjectFilter,
    cfg: &LabelingConfig,
) -> Option<DropReason> {
    let present = obj.present_count();
    if present < filter.min_samples {
        return Some(DropReason::TooFewSamples);
    }
    let (first, last) = first_run(obj)?;

    let deviation: f64 = (first..=last)
        .filter_map(|i| Some(ego.speed[i]? - obj.speed[i]?))
        .map(|d| d * d)
        .sum();
    if deviation < filter.max_ego_speed_deviation && present < filter.short_track_samples {
        return Some(DropReason::ShadowsEgo);
    }

    let jump = (first..last).any(|i| match (obj.speed[i], obj.speed[i + 1]) {
        (Some(a), Some(b)) => {
            cfg.to_base_speed((b - a).abs()) / cfg.sample_interval_s > filter.max_acceleration
        }
        _ => false,
    });
    jump.then_some(DropReason::ImplausibleJump)
}

/// Returns a copy of `table` without irrelevant objects, and how many were
/// removed. Surviving objects are renumbered in their original order.
pub fn retain_relevant_objects(
    table: &TrajectoryTable,
    filter: &ObjectFilter,
    cfg: &LabelingConfig,
) -> Result<(TrajectoryTable, usize), LabelError> {
    cfg.validate()?;
    let mut kept = Vec::with_capacity(table.objects.len());
    for obj in &table.objects {
        if let Some(reason) = drop_reason(obj, &table.ego, filter, cfg) {
            warn!("Dropping {} ({}): {:?}", obj.role, obj.columns.lat, reason);
            continue;
        }
        let mut obj = obj.clone();
        obj.role = EntityRole::Object(kept.len());
        kept.push(obj);
    }
    let removed = table.objects.len() - kept.len();
    info!("Object filter kept {} of {}", kept.len(), table.objects.len());
    let filtered = TrajectoryTable::new(table.ego.clone(), kept)?;
    Ok((filtered, removed))
}
