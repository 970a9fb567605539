//! Lane-change masks from crossings between a ground track and lane
//! boundaries.
//!
//! For every boundary the first crossing with the track (if any) is located,
//! the track samples between the surrounding distance peaks form the active
//! window, and the turning direction of the track against the lane at the
//! crossing decides left or right. Masks from all boundaries are OR-ed.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{BoundingRect, Coord, EuclideanDistance, Intersects, Line, LineString, Point};

use crate::table::LaneTable;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LateralMasks {
    pub left: Vec<bool>,
    pub right: Vec<bool>,
}

impl LateralMasks {
    fn zeros(n: usize) -> Self {
        Self {
            left: vec![false; n],
            right: vec![false; n],
        }
    }

    fn merge(&mut self, other: &LateralMasks) {
        for (a, b) in self.left.iter_mut().zip(&other.left) {
            *a |= *b;
        }
        for (a, b) in self.right.iter_mut().zip(&other.right) {
            *a |= *b;
        }
    }
}

/// Detects lane changes of one entity against every boundary in `lanes`.
///
/// `track` holds one slot per timestep; absent slots are skipped for the
/// geometry and come back as `false` in both masks.
pub fn detect_lane_changes(lanes: &LaneTable, track: &[Option<Coord<f64>>]) -> LateralMasks {
    let compact: Vec<Coord<f64>> = track.iter().flatten().copied().collect();
    let mut combined = LateralMasks::zeros(compact.len());
    for boundary in &lanes.boundaries {
        let lane = boundary.present();
        combined.merge(&crossing_masks(&compact, &lane));
    }

    let mut full = LateralMasks::zeros(track.len());
    let present = track
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.map(|_| i));
    for (k, i) in present.enumerate() {
        full.left[i] = combined.left[k];
        full.right[i] = combined.right[k];
    }
    full
}

/// Masks over the compacted track for a single lane boundary.
fn crossing_masks(track: &[Coord<f64>], lane: &[Coord<f64>]) -> LateralMasks {
    let n = track.len();
    let mut masks = LateralMasks::zeros(n);

    let Some(crossing) = first_intersection(track, lane) else {
        return masks;
    };

    let index = nearest(track, crossing);
    let index2 = nearest(lane, crossing);

    let lane_line = LineString::from(lane.to_vec());
    let distance: Vec<f64> = track
        .iter()
        .map(|c| Point::from(*c).euclidean_distance(&lane_line))
        .collect();
    let peaks = find_peaks(&distance);
    let pos = peaks.partition_point(|&p| p < index);
    let start = if pos == 0 { 0 } else { peaks[pos - 1] };
    let end = peaks.get(pos).copied().unwrap_or(n);

    let v0 = central_difference(lane, index2);
    let v1 = central_difference(track, index);
    let det = v0.x * v1.y - v0.y * v1.x;
    let dot = v0.x * v1.x + v0.y * v1.y;
    let angle = det.atan2(dot);

    let target = if angle < 0.0 {
        &mut masks.left
    } else {
        &mut masks.right
    };
    target[start..end].iter_mut().for_each(|m| *m = true);
    masks
}

/// First crossing point, scanning lane segments in order and, within each,
/// track segments in order. Collinear overlaps report their start.
fn first_intersection(track: &[Coord<f64>], lane: &[Coord<f64>]) -> Option<Coord<f64>> {
    if track.len() < 2 || lane.len() < 2 {
        return None;
    }
    let track_line = LineString::from(track.to_vec());
    let lane_line = LineString::from(lane.to_vec());
    match (track_line.bounding_rect(), lane_line.bounding_rect()) {
        (Some(a), Some(b)) if a.intersects(&b) => {}
        _ => return None,
    }

    let segments = |pts: &[Coord<f64>]| -> Vec<Line<f64>> {
        pts.windows(2)
            .map(|w| Line::new(w[0], w[1]))
            .filter(|l| l.start != l.end)
            .collect()
    };
    let track_segments = segments(track);
    for lane_seg in segments(lane) {
        for track_seg in &track_segments {
            match line_intersection(lane_seg, *track_seg) {
                Some(LineIntersection::SinglePoint { intersection, .. }) => {
                    return Some(intersection)
                }
                Some(LineIntersection::Collinear { intersection }) => {
                    return Some(intersection.start)
                }
                None => {}
            }
        }
    }
    None
}

/// Index of the first sample closest to `target`.
fn nearest(points: &[Coord<f64>], target: Coord<f64>) -> usize {
    let target = Point::from(target);
    points
        .iter()
        .map(|c| Point::from(*c).euclidean_distance(&target))
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, d)| if d < best.1 { (i, d) } else { best })
        .0
}

/// Direction through `index`, from its predecessor to its successor, each
/// clamped to the ends of the polyline.
fn central_difference(points: &[Coord<f64>], index: usize) -> Coord<f64> {
    let prev = index.saturating_sub(1);
    let next = (index + 1).min(points.len().saturating_sub(1));
    points[next] - points[prev]
}

/// Local maxima with a strict rise before and a strict fall after; flat tops
/// report their middle sample (rounded down). End samples are never peaks.
fn find_peaks(values: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if values.len() < 3 {
        return peaks;
    }
    let last = values.len() - 1;
    let mut i = 1;
    while i < last {
        if values[i - 1] < values[i] {
            let mut ahead = i + 1;
            while ahead < last && values[ahead] == values[i] {
                ahead += 1;
            }
            if values[ahead] < values[i] {
                let right = ahead - 1;
                peaks.push((i + right) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::LaneBoundary;

    fn c(x: f64, y: f64) -> Coord<f64> {
        Coord { x, y }
    }

    fn lane(points: &[(f64, f64)]) -> LaneBoundary {
        LaneBoundary {
            vertices: points.iter().map(|&(x, y)| Some(c(x, y))).collect(),
        }
    }

    /// Track running along +x and weaving across the line y = 0.
    fn weaving_track() -> Vec<Option<Coord<f64>>> {
        let ys = [-2.0, -1.5, -1.0, -0.5, 0.5, 1.0, 1.5, 2.0, 1.5, 1.0];
        ys.iter()
            .enumerate()
            .map(|(i, y)| Some(c(i as f64, *y)))
            .collect()
    }

    /// Track at x = 0, 1, 2, ... with the given lateral offsets.
    fn track_from(ys: &[f64]) -> Vec<Option<Coord<f64>>> {
        ys.iter()
            .enumerate()
            .map(|(i, y)| Some(c(i as f64, *y)))
            .collect()
    }

    fn indices(mask: &[bool]) -> Vec<usize> {
        mask.iter()
            .enumerate()
            .filter_map(|(i, m)| m.then_some(i))
            .collect()
    }

    fn straight_lane() -> LaneBoundary {
        lane(&(0..10).map(|i| (i as f64, 0.0)).collect::<Vec<_>>())
    }

    #[test]
    fn peaks_follow_plateau_midpoint_rule() {
        assert_eq!(find_peaks(&[0.0, 1.0, 0.0, 2.0, 2.0, 2.0, 1.0]), vec![1, 4]);
        assert_eq!(find_peaks(&[0.0, 1.0, 1.0, 0.0]), vec![1]);
        // Rising into the end is not a peak.
        assert!(find_peaks(&[0.0, 1.0, 2.0, 3.0]).is_empty());
        assert!(find_peaks(&[3.0, 1.0]).is_empty());
    }

    #[test]
    fn disjoint_extents_give_zero_masks() {
        let lanes = LaneTable {
            boundaries: vec![lane(&[(100.0, 100.0), (101.0, 100.0), (102.0, 100.0)])],
        };
        let track = weaving_track();
        let masks = detect_lane_changes(&lanes, &track);
        assert_eq!(masks.left.len(), track.len());
        assert!(!masks.left.iter().any(|m| *m));
        assert!(!masks.right.iter().any(|m| *m));
    }

    #[test]
    fn degenerate_lane_gives_zero_masks() {
        let lanes = LaneTable {
            boundaries: vec![lane(&[(3.0, 0.0), (3.0, 0.0), (3.0, 0.0)])],
        };
        let masks = detect_lane_changes(&lanes, &weaving_track());
        assert!(!masks.left.iter().any(|m| *m) && !masks.right.iter().any(|m| *m));
    }

    #[test]
    fn crossing_marks_window_up_to_next_peak() {
        let lanes = LaneTable {
            boundaries: vec![straight_lane()],
        };
        let masks = detect_lane_changes(&lanes, &weaving_track());
        // Distances: 2, 1.5, 1, .5, .5, 1, 1.5, 2, 1.5, 1 -> one peak at 7.
        // Crossing is between samples 3 and 4; nearest is 3 (first minimum).
        // Lane runs +x, track turns toward +y: det > 0, a right change here.
        let expected: Vec<bool> = (0..10).map(|i| i < 7).collect();
        assert_eq!(masks.right, expected);
        assert!(!masks.left.iter().any(|m| *m));
    }

    #[test]
    fn opposite_crossing_direction_is_left() {
        let lanes = LaneTable {
            boundaries: vec![straight_lane()],
        };
        let mirrored: Vec<Option<Coord<f64>>> = weaving_track()
            .into_iter()
            .map(|p| p.map(|q| c(q.x, -q.y)))
            .collect();
        let masks = detect_lane_changes(&lanes, &mirrored);
        assert!(masks.left[0] && masks.left[6] && !masks.left[7]);
        assert!(!masks.right.iter().any(|m| *m));
    }

    #[test]
    fn absent_track_samples_stay_false() {
        let lanes = LaneTable {
            boundaries: vec![straight_lane()],
        };
        let mut track = weaving_track();
        track.insert(2, None);
        let masks = detect_lane_changes(&lanes, &track);
        assert_eq!(masks.right.len(), 11);
        assert!(!masks.right[2]);
        assert!(masks.right[0] && masks.right[3]);
    }

    #[test]
    fn masks_from_several_lanes_are_combined() {
        let far = lane(&[(100.0, 100.0), (101.0, 100.0)]);
        let lanes = LaneTable {
            boundaries: vec![far, straight_lane()],
        };
        let masks = detect_lane_changes(&lanes, &weaving_track());
        assert!(masks.right[0]);
    }

    /// Crosses y = 0 upward near x = 1.5, then back down near x = 6.5.
    fn double_crossing() -> Vec<Option<Coord<f64>>> {
        track_from(&[-1.0, -0.5, 0.5, 1.0, 1.5, 1.0, 0.5, -0.5, -1.0, -1.5, -1.0, -0.5])
    }

    #[test]
    fn only_the_first_crossing_counts() {
        let lanes = LaneTable {
            boundaries: vec![lane(&(0..12).map(|i| (i as f64, 0.0)).collect::<Vec<_>>())],
        };
        let masks = detect_lane_changes(&lanes, &double_crossing());
        // Distance peaks at 4 and 9; the upward crossing sits before 4.
        assert_eq!(indices(&masks.right), vec![0, 1, 2, 3]);
        assert!(indices(&masks.left).is_empty());
    }

    #[test]
    fn lane_order_decides_which_crossing_is_first() {
        // Same boundary walked from x = 11 down to 0: the x = 6.5 crossing
        // lies on an earlier lane segment.
        let lanes = LaneTable {
            boundaries: vec![lane(&(0..12).rev().map(|i| (i as f64, 0.0)).collect::<Vec<_>>())],
        };
        let masks = detect_lane_changes(&lanes, &double_crossing());
        assert_eq!(indices(&masks.right), vec![4, 5, 6, 7, 8]);
        assert!(indices(&masks.left).is_empty());
    }

    #[test]
    fn crossing_on_first_track_segment_clamps_to_index_zero() {
        let lanes = LaneTable {
            boundaries: vec![lane(&(0..6).map(|i| (i as f64, 0.0)).collect::<Vec<_>>())],
        };
        let track = track_from(&[-0.4, 0.6, 1.0, 1.5, 2.0, 1.5]);
        let masks = detect_lane_changes(&lanes, &track);
        // Lane (1, 0) against track (1, 1) from samples 0 and 1.
        assert_eq!(indices(&masks.right), vec![0, 1, 2, 3]);
        assert!(indices(&masks.left).is_empty());
    }

    #[test]
    fn crossing_on_last_track_segment_clamps_to_final_index() {
        let lanes = LaneTable {
            boundaries: vec![lane(&(0..6).map(|i| (i as f64, 0.0)).collect::<Vec<_>>())],
        };
        let track = track_from(&[1.5, 2.0, 1.5, 1.0, 0.6, -0.4]);
        let masks = detect_lane_changes(&lanes, &track);
        // Lane (1, 0) against track (1, -1) from the last two samples; the
        // window runs from the peak at 1 to the end of the track.
        assert_eq!(indices(&masks.left), vec![1, 2, 3, 4, 5]);
        assert!(indices(&masks.right).is_empty());
    }

    #[test]
    fn central_difference_clamps_at_the_ends() {
        let pts = [c(0.0, 0.0), c(1.0, 0.0), c(3.0, 0.0)];
        assert_eq!(central_difference(&pts, 0), c(1.0, 0.0));
        assert_eq!(central_difference(&pts, 1), c(3.0, 0.0));
        assert_eq!(central_difference(&pts, 2), c(2.0, 0.0));
    }
}
