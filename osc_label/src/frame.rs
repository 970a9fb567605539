//! Output coordinate frame seam.
//!
//! The real projection (OpenDRIVE geo-reference) is owned by the caller; the
//! engine only needs to map table positions into the output frame and to
//! derive a compass bearing between two table positions.

use geo::Coord;
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Position in the output frame: `x` east, `y` north.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

pub trait CoordinateFrame: Sync {
    /// Maps a table position (lat/northing, lon/easting) to the output frame.
    fn to_output(&self, table_pos: Coord<f64>) -> Position;

    /// Compass bearing in degrees (north = 0, clockwise) from `from` to `to`.
    fn bearing_deg(&self, from: Coord<f64>, to: Coord<f64>) -> f64;
}

/// Table positions already in a local metric frame (northing, easting).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanarFrame {
    pub offset_x: f64,
    pub offset_y: f64,
}

impl CoordinateFrame for PlanarFrame {
    fn to_output(&self, table_pos: Coord<f64>) -> Position {
        Position {
            x: table_pos.y - self.offset_x,
            y: table_pos.x - self.offset_y,
        }
    }

    fn bearing_deg(&self, from: Coord<f64>, to: Coord<f64>) -> f64 {
        let d_north = to.x - from.x;
        let d_east = to.y - from.y;
        normalize_deg(d_east.atan2(d_north).to_degrees())
    }
}

/// Geodetic table positions projected onto a tangent plane at `origin`.
///
/// Good to centimetres over the few hundred metres a recording spans.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct EquirectangularFrame {
    pub origin_lat: f64,
    pub origin_lon: f64,
}

impl CoordinateFrame for EquirectangularFrame {
    fn to_output(&self, table_pos: Coord<f64>) -> Position {
        let lat0 = self.origin_lat.to_radians();
        Position {
            x: (table_pos.y - self.origin_lon).to_radians() * EARTH_RADIUS_M * lat0.cos(),
            y: (table_pos.x - self.origin_lat).to_radians() * EARTH_RADIUS_M,
        }
    }

    fn bearing_deg(&self, from: Coord<f64>, to: Coord<f64>) -> f64 {
        let lat1 = from.x.to_radians();
        let lat2 = to.x.to_radians();
        let dlon = (to.y - from.y).to_radians();
        let y = dlon.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
        normalize_deg(y.atan2(x).to_degrees())
    }
}

fn normalize_deg(deg: f64) -> f64 {
    let d = deg % 360.0;
    if d < 0.0 {
        d + 360.0
    } else {
        d
    }
}

/// Compass heading (degrees, north, clockwise) to the scenario convention
/// (radians, east, counter-clockwise).
pub fn convert_heading(degree: f64) -> f64 {
    let flipped = if degree == 0.0 { 0.0 } else { 360.0 - degree };
    (flipped + 90.0).to_radians()
}
