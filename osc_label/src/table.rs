//! Normalized input tables consumed by the labeling engine.
//!
//! Positions keep the column order of the source data: the first coordinate
//! is latitude (or local northing) and the second longitude (or easting).
//! Absent samples are `None`, never zero.

use std::fmt;

use geo::Coord;
use serde::{Deserialize, Serialize};

use crate::LabelError;

const EGO_LAT: &str = "lat";
const EGO_LON: &str = "long";
const EGO_SPEED: &str = "speed";
const EGO_HEADING: &str = "heading";
const OBJ_LAT: &str = "lat_";
const OBJ_LON: &str = "lon_";
const OBJ_SPEED: &str = "speed_";
const OBJ_CLASS: &str = "class_";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRole {
    Ego,
    Object(usize),
}

impl EntityRole {
    /// Position of the entity in ego-first order.
    pub fn ordinal(&self) -> usize {
        match self {
            EntityRole::Ego => 0,
            EntityRole::Object(i) => i + 1,
        }
    }
}

impl fmt::Display for EntityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRole::Ego => write!(f, "EGO"),
            EntityRole::Object(i) => write!(f, "Player{}", i + 1),
        }
    }
}

/// Source column names of one entity, handed through to the serializer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityColumns {
    pub lat: String,
    pub lon: String,
    pub speed: String,
    pub heading: Option<String>,
    pub class: Option<String>,
}

impl EntityColumns {
    pub fn ego() -> Self {
        Self {
            lat: EGO_LAT.to_string(),
            lon: EGO_LON.to_string(),
            speed: EGO_SPEED.to_string(),
            heading: Some(EGO_HEADING.to_string()),
            class: None,
        }
    }

    pub fn object(suffix: &str) -> Self {
        Self {
            lat: format!("{OBJ_LAT}{suffix}"),
            lon: format!("{OBJ_LON}{suffix}"),
            speed: format!("{OBJ_SPEED}{suffix}"),
            heading: None,
            class: Some(format!("{OBJ_CLASS}{suffix}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EntitySeries {
    pub role: EntityRole,
    pub columns: EntityColumns,
    pub lat: Vec<Option<f64>>,
    pub lon: Vec<Option<f64>>,
    pub speed: Vec<Option<f64>>,
    pub heading: Option<Vec<Option<f64>>>,
    pub class: Option<Vec<Option<i64>>>,
}

impl EntitySeries {
    pub fn new(
        role: EntityRole,
        columns: EntityColumns,
        lat: Vec<Option<f64>>,
        lon: Vec<Option<f64>>,
        speed: Vec<Option<f64>>,
    ) -> Result<Self, LabelError> {
        check_len(&columns.lon, lat.len(), lon.len())?;
        check_len(&columns.speed, lat.len(), speed.len())?;
        Ok(Self {
            role,
            columns,
            lat,
            lon,
            speed,
            heading: None,
            class: None,
        })
    }

    pub fn with_heading(mut self, heading: Vec<Option<f64>>) -> Result<Self, LabelError> {
        let name = self.columns.heading.clone().unwrap_or_else(|| "heading".into());
        check_len(&name, self.len(), heading.len())?;
        self.heading = Some(heading);
        Ok(self)
    }

    pub fn with_class(mut self, class: Vec<Option<i64>>) -> Result<Self, LabelError> {
        let name = self.columns.class.clone().unwrap_or_else(|| "class".into());
        check_len(&name, self.len(), class.len())?;
        self.class = Some(class);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.lat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lat.is_empty()
    }

    pub fn position(&self, index: usize) -> Option<Coord<f64>> {
        Some(Coord {
            x: (*self.lat.get(index)?)?,
            y: (*self.lon.get(index)?)?,
        })
    }

    pub fn positions(&self) -> Vec<Option<Coord<f64>>> {
        (0..self.len()).map(|i| self.position(i)).collect()
    }

    /// Present speed samples, in recorded units, in time order.
    pub fn observed_speed(&self) -> Vec<f64> {
        self.speed.iter().flatten().copied().collect()
    }

    /// First timestep where both position and speed are present.
    pub fn first_present(&self) -> Option<usize> {
        (0..self.len()).find(|&i| self.position(i).is_some() && self.speed[i].is_some())
    }

    /// Number of timesteps with a present position.
    pub fn present_count(&self) -> usize {
        (0..self.len()).filter(|&i| self.position(i).is_some()).count()
    }
}

fn check_len(what: &str, expected: usize, actual: usize) -> Result<(), LabelError> {
    if expected != actual {
        return Err(LabelError::LengthMismatch {
            what: what.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Time-ordered, evenly spaced trajectory of the ego and every tracked object.
#[derive(Clone, Debug)]
pub struct TrajectoryTable {
    pub ego: EntitySeries,
    pub objects: Vec<EntitySeries>,
}

impl TrajectoryTable {
    pub fn new(ego: EntitySeries, objects: Vec<EntitySeries>) -> Result<Self, LabelError> {
        if ego.role != EntityRole::Ego {
            return Err(LabelError::InvalidShape(format!(
                "ego series carries role {}",
                ego.role
            )));
        }
        for (i, obj) in objects.iter().enumerate() {
            check_len(&obj.columns.lat, ego.len(), obj.len())?;
            if obj.role != EntityRole::Object(i) {
                return Err(LabelError::InvalidShape(format!(
                    "object {} carries role {}",
                    i, obj.role
                )));
            }
        }
        Ok(Self { ego, objects })
    }

    /// Groups named columns into the ego and object series.
    ///
    /// The ego uses `lat`, `long`, `speed` and optionally `heading`; object
    /// `N` uses `lat_N`, `lon_N`, `speed_N` and optionally `class_N`. Objects
    /// keep the order in which their `lat_` column appears.
    pub fn from_named_columns(columns: Vec<(String, Vec<Option<f64>>)>) -> Result<Self, LabelError> {
        let take = |name: &str| -> Option<Vec<Option<f64>>> {
            columns
                .iter()
                .position(|(n, _)| n == name)
                .map(|idx| columns[idx].1.clone())
        };

        let missing = |name: &str| LabelError::InvalidShape(format!("missing column '{name}'"));
        let ego_lat = take(EGO_LAT).ok_or_else(|| missing(EGO_LAT))?;
        let ego_lon = take(EGO_LON).ok_or_else(|| missing(EGO_LON))?;
        let ego_speed = take(EGO_SPEED).ok_or_else(|| missing(EGO_SPEED))?;
        let mut ego = EntitySeries::new(
            EntityRole::Ego,
            EntityColumns::ego(),
            ego_lat,
            ego_lon,
            ego_speed,
        )?;
        match take(EGO_HEADING) {
            Some(heading) => ego = ego.with_heading(heading)?,
            None => ego.columns.heading = None,
        }

        let suffixes: Vec<String> = columns
            .iter()
            .filter_map(|(n, _)| n.strip_prefix(OBJ_LAT).map(str::to_string))
            .collect();

        let mut objects = Vec::with_capacity(suffixes.len());
        for (i, suffix) in suffixes.iter().enumerate() {
            let names = EntityColumns::object(suffix);
            let lat = take(&names.lat).ok_or_else(|| missing(&names.lat))?;
            let lon = take(&names.lon).ok_or_else(|| missing(&names.lon))?;
            let speed = take(&names.speed).ok_or_else(|| missing(&names.speed))?;
            let class_col = names.class.clone().and_then(|c| take(&c));
            let mut obj = EntitySeries::new(EntityRole::Object(i), names, lat, lon, speed)?;
            match class_col {
                Some(raw) => {
                    let codes = raw
                        .into_iter()
                        .map(|v| v.filter(|c| c.is_finite()).map(|c| c.round() as i64))
                        .collect();
                    obj = obj.with_class(codes)?;
                }
                None => obj.columns.class = None,
            }
            objects.push(obj);
        }

        Self::new(ego, objects)
    }

    pub fn len(&self) -> usize {
        self.ego.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ego.is_empty()
    }

    /// Ego first, then objects in table order.
    pub fn entities(&self) -> impl Iterator<Item = &EntitySeries> {
        std::iter::once(&self.ego).chain(self.objects.iter())
    }

    pub fn entity_count(&self) -> usize {
        self.objects.len() + 1
    }
}

/// One lane-boundary polyline, one vertex slot per timestep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaneBoundary {
    pub vertices: Vec<Option<Coord<f64>>>,
}

impl LaneBoundary {
    pub fn present(&self) -> Vec<Coord<f64>> {
        self.vertices.iter().flatten().copied().collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaneTable {
    pub boundaries: Vec<LaneBoundary>,
}

impl LaneTable {
    /// Builds boundaries from flat columns, consumed pairwise as
    /// (lat, lon). A vertex is absent when either half is absent.
    pub fn from_columns(columns: Vec<Vec<Option<f64>>>) -> Result<Self, LabelError> {
        if columns.len() % 2 != 0 {
            return Err(LabelError::InvalidShape(format!(
                "lane table needs an even number of columns, got {}",
                columns.len()
            )));
        }
        let rows = columns.first().map(Vec::len).unwrap_or(0);
        let mut boundaries = Vec::with_capacity(columns.len() / 2);
        for (i, pair) in columns.chunks(2).enumerate() {
            check_len(&format!("lane column {}", i * 2), rows, pair[0].len())?;
            check_len(&format!("lane column {}", i * 2 + 1), rows, pair[1].len())?;
            let vertices = pair[0]
                .iter()
                .zip(pair[1].iter())
                .map(|(a, b)| match (a, b) {
                    (Some(x), Some(y)) => Some(Coord { x: *x, y: *y }),
                    _ => None,
                })
                .collect();
            boundaries.push(LaneBoundary { vertices });
        }
        Ok(Self { boundaries })
    }

    /// Samples per boundary; zero for a table without boundaries.
    pub fn len(&self) -> usize {
        self.boundaries.first().map(|b| b.vertices.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    pub fn ensure_aligned(&self, timesteps: usize) -> Result<(), LabelError> {
        for (i, boundary) in self.boundaries.iter().enumerate() {
            check_len(&format!("lane {i}"), timesteps, boundary.vertices.len())?;
        }
        Ok(())
    }
}
