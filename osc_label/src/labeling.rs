//! Per-entity labeling pipeline and the handoff to scenario serializers.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibrate::CalibrationResult;
use crate::frame::{convert_heading, CoordinateFrame, Position};
use crate::intervals::{
    extract_lateral, extract_longitudinal, LaneChangeDirection, ManeuverInterval, ManeuverKind,
};
use crate::lateral::{detect_lane_changes, LateralMasks};
use crate::longitudinal::{detect_longitudinal, LongitudinalMasks};
use crate::table::{EntityColumns, EntityRole, EntitySeries, LaneTable, TrajectoryTable};
use crate::{LabelError, LabelingConfig};

/// Catalog entries per object class code.
const CLASS_CATALOG: &[(i64, &[&str])] = &[
    (0, &["UnknownClass1"]),
    (3, &["PedestrianClass1"]),
    (5, &["BicycleClass1"]),
    (6, &["MotorbikeClass1"]),
    (7, &["CarClass1"]),
    (8, &["VanClass1"]),
    (9, &["TruckClass1"]),
    (11, &["AnimalClass1"]),
];

/// Acceleration threshold source for a labeling run.
#[derive(Clone, Debug, PartialEq)]
pub enum Thresholds {
    Fixed(f64),
    /// One value per entity, ego first.
    PerEntity(Vec<f64>),
}

impl Thresholds {
    fn for_entity(&self, role: EntityRole) -> f64 {
        match self {
            Thresholds::Fixed(t) => *t,
            Thresholds::PerEntity(values) => values[role.ordinal()],
        }
    }

    fn check(&self, entities: usize) -> Result<(), LabelError> {
        let values: &[f64] = match self {
            Thresholds::Fixed(t) => std::slice::from_ref(t),
            Thresholds::PerEntity(values) => {
                if values.len() != entities {
                    return Err(LabelError::LengthMismatch {
                        what: "per-entity thresholds".into(),
                        expected: entities,
                        actual: values.len(),
                    });
                }
                values
            }
        };
        if let Some(bad) = values.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
            return Err(LabelError::InvalidParameter(format!(
                "acceleration threshold must be finite and >= 0, got {bad}"
            )));
        }
        Ok(())
    }
}

impl From<&CalibrationResult> for Thresholds {
    fn from(result: &CalibrationResult) -> Self {
        Thresholds::PerEntity(result.values())
    }
}

/// Entity state at its first present sample, in the output frame.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct InitialState {
    pub x: f64,
    pub y: f64,
    /// Base units.
    pub speed: f64,
    /// Radians, east, counter-clockwise.
    pub heading: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EntityLabels {
    pub role: EntityRole,
    pub columns: EntityColumns,
    pub threshold: f64,
    /// `None` when the entity never has position and speed on one sample.
    pub initial_state: Option<InitialState>,
    pub class_label: Option<String>,
    pub longitudinal: Vec<ManeuverInterval>,
    pub lateral: Vec<ManeuverInterval>,
    #[serde(skip)]
    pub longitudinal_masks: LongitudinalMasks,
    #[serde(skip)]
    pub lateral_masks: LateralMasks,
}

#[derive(Clone, Debug, Serialize)]
pub struct LabelingOutput {
    pub sample_interval_s: f64,
    pub config_fingerprint: String,
    pub ego: EntityLabels,
    pub objects: Vec<EntityLabels>,
}

impl LabelingOutput {
    /// Ego first, then objects.
    pub fn entities(&self) -> impl Iterator<Item = &EntityLabels> {
        std::iter::once(&self.ego).chain(self.objects.iter())
    }
}

/// Most frequent present class code; ties go to the smallest code.
fn dominant_class(codes: &[Option<i64>]) -> Option<i64> {
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for code in codes.iter().flatten() {
        *counts.entry(*code).or_default() += 1;
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(i64, usize)>, (code, n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((code, n)),
        })
        .map(|(code, _)| code)
}

fn class_label(obj: &EntitySeries, rng: &mut StdRng) -> Result<Option<String>, LabelError> {
    let Some(code) = obj.class.as_deref().and_then(dominant_class) else {
        return Ok(None);
    };
    let (_, catalog) = CLASS_CATALOG
        .iter()
        .find(|(c, _)| *c == code)
        .ok_or(LabelError::UnknownClass(code))?;
    let pick = rng.gen_range(0..catalog.len());
    Ok(Some(catalog[pick].to_string()))
}

fn initial_state(
    entity: &EntitySeries,
    frame: &dyn CoordinateFrame,
    cfg: &LabelingConfig,
) -> Option<InitialState> {
    let first = entity.first_present()?;
    let (Some(pos), Some(speed)) = (entity.position(first), entity.speed[first]) else {
        return None;
    };

    let recorded_heading = entity
        .heading
        .as_ref()
        .and_then(|h| h.get(first).copied().flatten());
    let compass = match recorded_heading {
        Some(h) => h,
        None => {
            let mut present = entity.positions().into_iter().flatten();
            match (present.next(), present.next()) {
                (Some(a), Some(b)) => frame.bearing_deg(a, b),
                _ => 0.0,
            }
        }
    };

    let Position { x, y } = frame.to_output(pos);
    Some(InitialState {
        x,
        y,
        speed: cfg.to_base_speed(speed),
        heading: convert_heading(compass),
    })
}

fn label_entity(
    entity: &EntitySeries,
    lanes: &LaneTable,
    threshold: f64,
    frame: &dyn CoordinateFrame,
    cfg: &LabelingConfig,
) -> Result<EntityLabels, LabelError> {
    let positions = entity.positions();
    let longitudinal_masks = detect_longitudinal(&entity.speed, threshold, cfg);
    let lateral_masks = detect_lane_changes(lanes, &positions);
    let longitudinal =
        extract_longitudinal(&longitudinal_masks, &entity.speed, &positions, frame, cfg);
    let lateral = extract_lateral(&lateral_masks, &positions, frame, cfg);
    debug!(
        "{}: {} longitudinal, {} lateral intervals at threshold {:.2}",
        entity.role,
        longitudinal.len(),
        lateral.len(),
        threshold
    );
    let initial = initial_state(entity, frame, cfg);
    if initial.is_none() {
        warn!("{} has no sample with position and speed; no initial state", entity.role);
    }
    Ok(EntityLabels {
        role: entity.role,
        columns: entity.columns.clone(),
        threshold,
        initial_state: initial,
        class_label: None,
        longitudinal,
        lateral,
        longitudinal_masks,
        lateral_masks,
    })
}

/// Labels the ego and every object of `table`.
pub fn label_maneuvers(
    table: &TrajectoryTable,
    lanes: &LaneTable,
    thresholds: &Thresholds,
    frame: &dyn CoordinateFrame,
    cfg: &LabelingConfig,
) -> Result<LabelingOutput, LabelError> {
    cfg.validate()?;
    if table.is_empty() {
        return Err(LabelError::InsufficientData("trajectory table has no samples".into()));
    }
    thresholds.check(table.entity_count())?;
    lanes.ensure_aligned(table.len())?;

    let ego = label_entity(
        &table.ego,
        lanes,
        thresholds.for_entity(EntityRole::Ego),
        frame,
        cfg,
    )?;

    let mut rng = StdRng::seed_from_u64(cfg.class_seed);
    let mut objects = Vec::with_capacity(table.objects.len());
    for obj in &table.objects {
        let mut labels = label_entity(obj, lanes, thresholds.for_entity(obj.role), frame, cfg)?;
        labels.class_label = class_label(obj, &mut rng)?;
        objects.push(labels);
    }

    info!(
        "Labeled {} entities over {} samples ({} lane boundaries)",
        objects.len() + 1,
        table.len(),
        lanes.boundaries.len()
    );
    Ok(LabelingOutput {
        sample_interval_s: cfg.sample_interval_s,
        config_fingerprint: cfg.fingerprint()?,
        ego,
        objects,
    })
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStyle {
    Time,
    Position,
}

/// Rendering choices handed to a scenario serializer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderOptions {
    pub longitudinal_trigger: TriggerStyle,
    pub lateral_trigger: TriggerStyle,
    /// Radius of position triggers, output-frame units.
    pub trigger_radius: f64,
    pub format_version: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            longitudinal_trigger: TriggerStyle::Time,
            lateral_trigger: TriggerStyle::Position,
            trigger_radius: 2.0,
            format_version: "1.0".to_string(),
        }
    }
}

pub trait ScenarioSerializer {
    fn render(&self, output: &LabelingOutput, options: &RenderOptions) -> Result<String, LabelError>;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TriggerDoc {
    Time { at_s: f64 },
    Position { x: f64, y: f64, radius: f64 },
}

#[derive(Serialize)]
struct ActionDoc {
    maneuver: ManeuverKind,
    trigger: TriggerDoc,
    duration_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    acceleration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    direction: Option<LaneChangeDirection>,
}

#[derive(Serialize)]
struct EntityDoc<'a> {
    name: String,
    role: EntityRole,
    columns: &'a EntityColumns,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog_entry: Option<&'a str>,
    acceleration_threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_state: Option<InitialState>,
    actions: Vec<ActionDoc>,
}

#[derive(Serialize)]
struct ScenarioDoc<'a> {
    format_version: &'a str,
    config_fingerprint: &'a str,
    entities: Vec<EntityDoc<'a>>,
}

/// Writes the labeling output as a JSON scenario skeleton.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonScenarioSerializer {
    pub pretty: bool,
}

impl JsonScenarioSerializer {
    fn trigger(
        &self,
        iv: &ManeuverInterval,
        style: TriggerStyle,
        options: &RenderOptions,
        dt: f64,
    ) -> TriggerDoc {
        match (style, iv.trigger) {
            (TriggerStyle::Position, Some(p)) => TriggerDoc::Position {
                x: p.x,
                y: p.y,
                radius: options.trigger_radius,
            },
            _ => TriggerDoc::Time {
                at_s: iv.start_index as f64 * dt,
            },
        }
    }

    fn entity<'a>(
        &self,
        labels: &'a EntityLabels,
        options: &RenderOptions,
        dt: f64,
    ) -> Result<EntityDoc<'a>, LabelError> {
        let mut actions = Vec::with_capacity(labels.longitudinal.len() + labels.lateral.len());
        for iv in &labels.longitudinal {
            if iv.kind.is_lateral() {
                return Err(LabelError::UnknownManeuver(format!(
                    "{} in longitudinal set of {}",
                    iv.kind, labels.role
                )));
            }
            actions.push(ActionDoc {
                maneuver: iv.kind,
                trigger: self.trigger(iv, options.longitudinal_trigger, options, dt),
                duration_s: iv.samples() as f64 * dt,
                target_speed: Some(iv.target_speed),
                acceleration: Some(iv.rate),
                direction: None,
            });
        }
        for iv in &labels.lateral {
            let direction = LaneChangeDirection::try_from(iv.kind)?;
            actions.push(ActionDoc {
                maneuver: iv.kind,
                trigger: self.trigger(iv, options.lateral_trigger, options, dt),
                duration_s: iv.rate,
                target_speed: None,
                acceleration: None,
                direction: Some(direction),
            });
        }
        Ok(EntityDoc {
            name: labels.role.to_string(),
            role: labels.role,
            columns: &labels.columns,
            catalog_entry: labels.class_label.as_deref(),
            acceleration_threshold: labels.threshold,
            initial_state: labels.initial_state,
            actions,
        })
    }
}

impl ScenarioSerializer for JsonScenarioSerializer {
    fn render(&self, output: &LabelingOutput, options: &RenderOptions) -> Result<String, LabelError> {
        let entities = output
            .entities()
            .map(|labels| self.entity(labels, options, output.sample_interval_s))
            .collect::<Result<Vec<_>, _>>()?;
        let doc = ScenarioDoc {
            format_version: &options.format_version,
            config_fingerprint: &output.config_fingerprint,
            entities,
        };
        let rendered = if self.pretty {
            serde_json::to_string_pretty(&doc)
        } else {
            serde_json::to_string(&doc)
        };
        rendered.map_err(|e| LabelError::Serialization(e.to_string()))
    }
}
