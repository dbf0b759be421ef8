//! Read-only aggregation of an integrated route.

use serde::{Deserialize, Serialize};

use crate::route::{EnergyTerms, Route, Segment, StateTag};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RideSummary {
    pub segments: usize,
    pub distance_m: f64,
    pub horizontal_distance_m: f64,
    pub time_s: f64,
    pub rider_time_s: f64,
    pub freewheel_time_s: f64,
    pub brake_time_s: f64,
    pub rider_distance_m: f64,
    pub freewheel_distance_m: f64,
    pub brake_distance_m: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub max_speed_mps: f64,
    pub average_speed_mps: f64,
    /// Mean rider power over the whole elapsed time.
    pub average_power_w: f64,
    pub steps: u64,
    pub freewheel_segments: usize,
    pub braking_segments: usize,
    pub no_force_segments: usize,
    pub energy: EnergyTerms,
    /// Largest per-segment energy imbalance relative to its magnitude.
    pub max_energy_residual: f64,
}

impl RideSummary {
    /// Totals over every segment with non-zero horizontal distance.
    pub fn from_route(route: &Route) -> Self {
        let mut summary = RideSummary::default();
        let mut prev_elevation = route.segments.first().map(|s| s.elevation);

        for seg in route.segments.iter().skip(1) {
            let start = prev_elevation.unwrap_or(seg.elevation);
            prev_elevation = Some(seg.elevation);
            if !seg.is_ridden() {
                continue;
            }

            summary.segments += 1;
            summary.distance_m += seg.distance;
            summary.horizontal_distance_m += seg.horizontal_distance;
            summary.time_s += seg.time;
            summary.rider_time_s += seg.rider_time;
            summary.freewheel_time_s += seg.freewheel_time;
            summary.brake_time_s += seg.brake_time;
            summary.rider_distance_m += seg.rider_distance;
            summary.freewheel_distance_m += seg.freewheel_distance;
            summary.brake_distance_m += seg.brake_distance;
            summary.steps += seg.steps;
            summary.energy.accumulate(&seg.energy);

            let climb = seg.elevation - start;
            if climb > 0.0 {
                summary.elevation_gain_m += climb;
            } else {
                summary.elevation_loss_m -= climb;
            }
            summary.max_speed_mps = summary.max_speed_mps.max(seg.peak_velocity);

            if seg.freewheel {
                summary.freewheel_segments += 1;
            }
            if seg.passed_through(StateTag::Brake) {
                summary.braking_segments += 1;
            }
            if seg.passed_through(StateTag::NoForce) {
                summary.no_force_segments += 1;
            }
            summary.max_energy_residual = summary.max_energy_residual.max(energy_residual(seg));
        }

        if summary.time_s > 0.0 {
            summary.average_speed_mps = summary.distance_m / summary.time_s;
            summary.average_power_w = summary.energy.rider / summary.time_s;
        }
        summary
    }
}

/// Relative energy imbalance of one segment.
pub fn energy_residual(seg: &Segment) -> f64 {
    let magnitude = seg.energy.magnitude();
    if magnitude > 0.0 {
        seg.energy.balance().abs() / magnitude
    } else {
        0.0
    }
}

/// One output row per ridden segment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SegmentRow {
    pub index: usize,
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: f64,
    pub original_elevation_m: f64,
    pub grade: f64,
    pub distance_m: f64,
    pub head_wind_mps: f64,
    pub target_velocity_mps: f64,
    pub target_power_w: f64,
    pub velocity_ceiling_mps: f64,
    pub entry_ceiling_mps: f64,
    pub entry_velocity_mps: f64,
    pub exit_velocity_mps: f64,
    pub time_s: f64,
    pub rider_energy_j: f64,
    pub drag_energy_j: f64,
    pub braking_energy_j: f64,
    pub steps: u64,
    pub trace: String,
}

impl SegmentRow {
    pub fn from_segment(seg: &Segment) -> Self {
        Self {
            index: seg.index,
            lat: seg.lat,
            lon: seg.lon,
            elevation_m: seg.elevation,
            original_elevation_m: seg.original_elevation,
            grade: seg.grade,
            distance_m: seg.distance,
            head_wind_mps: seg.head_wind,
            target_velocity_mps: seg.target_velocity,
            target_power_w: seg.target_power,
            velocity_ceiling_mps: seg.velocity_ceiling,
            entry_ceiling_mps: seg.entry_ceiling,
            entry_velocity_mps: seg.entry_velocity,
            exit_velocity_mps: seg.exit_velocity,
            time_s: seg.time,
            rider_energy_j: seg.energy.rider,
            drag_energy_j: seg.energy.drag,
            braking_energy_j: seg.energy.braking,
            steps: seg.steps,
            trace: seg
                .trace
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(">"),
        }
    }

    pub fn from_route(route: &Route) -> Vec<Self> {
        route.ridden().map(Self::from_segment).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_skips_unridden_and_counts_elevation() {
        let mut route = Route::from_profile(100.0, &[(100.0, 0.05), (0.0, 0.0), (200.0, -0.02)]);
        for (i, seg) in route.segments.iter_mut().enumerate().skip(1) {
            seg.time = 10.0 * i as f64;
            seg.peak_velocity = i as f64;
            seg.energy.rider = 100.0;
            seg.energy.drag = -100.0;
        }
        route.segments[3].trace = vec![StateTag::Brake, StateTag::ConstantVelocity];

        let summary = RideSummary::from_route(&route);
        assert_eq!(summary.segments, 2);
        assert!((summary.time_s - 40.0).abs() < 1e-12);
        assert!((summary.elevation_gain_m - 5.0).abs() < 1e-9);
        assert!((summary.elevation_loss_m - 4.0).abs() < 1e-9);
        assert_eq!(summary.max_speed_mps, 3.0);
        assert_eq!(summary.braking_segments, 1);
        assert!((summary.energy.rider - 200.0).abs() < 1e-12);
        assert!((summary.average_power_w - 5.0).abs() < 1e-12);
        assert_eq!(summary.max_energy_residual, 0.0);
    }

    #[test]
    fn test_segment_row_trace_string() {
        let mut seg = Segment::default();
        seg.trace = vec![StateTag::Brake, StateTag::Freewheel];
        assert_eq!(SegmentRow::from_segment(&seg).trace, "brake>freewheel");
    }
}
