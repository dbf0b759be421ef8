//! Road segmenter: ordered track points to ordered road segments.

use tracing::debug;

use crate::params::SegmenterConfig;
use crate::route::{Route, RouteStats, Segment, TrackPoint};
use crate::RideError;

/// Absolute floor on the duplicate-rejection distance; keeps grades finite.
pub const MIN_DISTANCE_FLOOR_M: f64 = 0.01;

/// Meters per degree of latitude and longitude at `lat_deg`.
pub fn meters_per_degree(lat_deg: f64) -> (f64, f64) {
    let phi = lat_deg.to_radians();
    let lat_scale = 111_132.92 - 559.82 * (2.0 * phi).cos() + 1.175 * (4.0 * phi).cos()
        - 0.0023 * (6.0 * phi).cos();
    let lon_scale =
        111_412.84 * phi.cos() - 93.5 * (3.0 * phi).cos() + 0.118 * (5.0 * phi).cos();
    (lat_scale, lon_scale)
}

/// Running median estimate that nudges toward each new sample by a step
/// proportional to the running mean.
#[derive(Clone, Debug, Default)]
pub struct MedianEstimator {
    value: Option<f64>,
    mean: f64,
    count: usize,
}

impl MedianEstimator {
    const STEP_FRACTION: f64 = 0.02;

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        self.mean += (x - self.mean) / self.count as f64;
        self.value = Some(match self.value {
            None => x,
            Some(m) if x > m => m + Self::STEP_FRACTION * self.mean,
            Some(m) if x < m => m - Self::STEP_FRACTION * self.mean,
            Some(m) => m,
        });
    }

    pub fn median(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
}

struct LocalFrame {
    lat_scale: f64,
    lon_scale: f64,
}

impl LocalFrame {
    /// East/north offset in meters from `a` to `b`.
    fn offset(&self, a: &TrackPoint, b: &TrackPoint) -> (f64, f64) {
        (
            (b.lon - a.lon) * self.lon_scale,
            (b.lat - a.lat) * self.lat_scale,
        )
    }
}

/// Build a route from samples, dropping points closer than the configured
/// minimum distance to the previously accepted one.
pub fn build_route(points: &[TrackPoint], config: &SegmenterConfig) -> Result<Route, RideError> {
    if points.len() < 2 {
        return Err(RideError::DegenerateRoute {
            usable: points.len(),
        });
    }

    let mean_lat = points.iter().map(|p| p.lat).sum::<f64>() / points.len() as f64;
    let (lat_scale, lon_scale) = meters_per_degree(mean_lat);
    let frame = LocalFrame {
        lat_scale,
        lon_scale,
    };
    let min_distance = config.min_distance_m.max(MIN_DISTANCE_FLOOR_M);

    let first = points[0];
    let mut segments = vec![Segment::at_point(0, &first)];
    let mut accepted = vec![first];
    let mut rejected = 0usize;
    let mut median = MedianEstimator::default();
    let mut lat_sum = first.lat;
    let mut elevation_sum = first.elevation;
    let mut min_elevation = first.elevation;
    let mut max_elevation = first.elevation;

    let mut prev = first;
    for point in &points[1..] {
        let (dx, dy) = frame.offset(&prev, point);
        let horizontal = dx.hypot(dy);
        if !horizontal.is_finite() || horizontal < min_distance {
            rejected += 1;
            continue;
        }

        let mut seg = Segment::at_point(segments.len(), point);
        seg.horizontal_distance = horizontal;
        seg.grade = (point.elevation - prev.elevation) / horizontal;
        seg.distance = horizontal * (1.0 + seg.grade * seg.grade).sqrt();
        seg.heading_deg = dx.atan2(dy).to_degrees().rem_euclid(360.0);
        segments.push(seg);

        median.push(horizontal);
        lat_sum += point.lat;
        elevation_sum += point.elevation;
        min_elevation = min_elevation.min(point.elevation);
        max_elevation = max_elevation.max(point.elevation);
        accepted.push(*point);
        prev = *point;
    }

    if segments.len() < 2 {
        return Err(RideError::DegenerateRoute {
            usable: segments.len(),
        });
    }
    if rejected > 0 {
        debug!(rejected, min_distance, "dropped near-duplicate track points");
    }

    if config.derive_turn_radius {
        assign_turn_radii(&mut segments, &accepted, &frame, config.max_turn_radius_m);
    }

    let count = accepted.len() as f64;
    let mut route = Route {
        segments,
        stats: RouteStats {
            accepted_points: accepted.len(),
            rejected_points: rejected,
            mean_latitude: lat_sum / count,
            mean_elevation: elevation_sum / count,
            min_elevation,
            max_elevation,
            mean_distance: median.mean(),
            median_distance: median.median(),
            ..RouteStats::default()
        },
    };
    route.recompute_geometry();
    Ok(route)
}

/// Circumradius of each interior vertex, stored on the segment arriving at it.
fn assign_turn_radii(
    segments: &mut [Segment],
    accepted: &[TrackPoint],
    frame: &LocalFrame,
    max_radius: f64,
) {
    for i in 1..accepted.len().saturating_sub(1) {
        let (ax, ay) = frame.offset(&accepted[i], &accepted[i - 1]);
        let (bx, by) = frame.offset(&accepted[i], &accepted[i + 1]);
        let a = ax.hypot(ay);
        let b = bx.hypot(by);
        let c = (ax - bx).hypot(ay - by);
        let twice_area = (ax * by - ay * bx).abs();
        let radius = if twice_area > 1e-9 {
            a * b * c / (2.0 * twice_area)
        } else {
            0.0
        };
        segments[i].turn_radius = if radius > 0.0 && radius <= max_radius {
            radius
        } else {
            0.0
        };
    }
}
