//! Route and segment data model shared by every pass of the pipeline.

use serde::{Deserialize, Serialize};

use crate::filter::FilterStats;

/// One positional sample with elevation, as delivered by a track parser.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation: f64,
}

impl TrackPoint {
    pub fn new(lat: f64, lon: f64, elevation: f64) -> Self {
        Self {
            lat,
            lon,
            elevation,
        }
    }
}

/// States of the per-segment integrator state machine, recorded in order of entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StateTag {
    Brake,
    Accelerate,
    Decelerate,
    ConstantVelocity,
    Freewheel,
    /// The motion model could not produce force in the requested direction.
    NoForce,
}

impl StateTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateTag::Brake => "brake",
            StateTag::Accelerate => "accelerate",
            StateTag::Decelerate => "decelerate",
            StateTag::ConstantVelocity => "constant",
            StateTag::Freewheel => "freewheel",
            StateTag::NoForce => "no-force",
        }
    }
}

/// Signed energy terms in joules. Energy delivered to the bike is positive.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EnergyTerms {
    pub rider: f64,
    pub drag: f64,
    pub drag_rider: f64,
    pub drag_brake: f64,
    pub drag_freewheel: f64,
    /// Drag absorbed while pedalling to hold a constant velocity.
    pub drag_push: f64,
    pub rolling: f64,
    pub gravity: f64,
    pub kinetic: f64,
    pub braking: f64,
}

impl EnergyTerms {
    /// Sum of the independent terms; zero for a physically consistent segment.
    pub fn balance(&self) -> f64 {
        self.rider + self.gravity + self.rolling + self.drag + self.kinetic + self.braking
    }

    /// Sum of magnitudes, used to scale the balance check.
    pub fn magnitude(&self) -> f64 {
        self.rider.abs()
            + self.gravity.abs()
            + self.rolling.abs()
            + self.drag.abs()
            + self.kinetic.abs()
            + self.braking.abs()
    }

    pub fn accumulate(&mut self, other: &EnergyTerms) {
        self.rider += other.rider;
        self.drag += other.drag;
        self.drag_rider += other.drag_rider;
        self.drag_brake += other.drag_brake;
        self.drag_freewheel += other.drag_freewheel;
        self.drag_push += other.drag_push;
        self.rolling += other.rolling;
        self.gravity += other.gravity;
        self.kinetic += other.kinetic;
        self.braking += other.braking;
    }
}

/// The atomic unit of road and of simulation state.
///
/// Segment `i` spans from the accepted sample `i - 1` to sample `i`; its
/// position and elevation are those of the end sample.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub lat: f64,
    pub lon: f64,
    pub elevation: f64,
    pub original_elevation: f64,
    pub grade: f64,
    pub horizontal_distance: f64,
    /// True (3-D) distance along the road surface.
    pub distance: f64,
    /// Bearing of travel in degrees clockwise from north.
    pub heading_deg: f64,
    /// Along-track wind component, positive for head wind.
    pub head_wind: f64,
    /// Turn radius in meters, 0 when unconstrained.
    pub turn_radius: f64,

    pub target_velocity: f64,
    pub target_power: f64,
    pub freewheel: bool,
    pub velocity_ceiling: f64,
    pub entry_ceiling: f64,

    pub entry_velocity: f64,
    pub exit_velocity: f64,
    /// Highest velocity reached anywhere on the segment.
    pub peak_velocity: f64,
    pub time: f64,
    pub rider_time: f64,
    pub brake_time: f64,
    pub freewheel_time: f64,
    pub rider_distance: f64,
    pub brake_distance: f64,
    pub freewheel_distance: f64,
    pub energy: EnergyTerms,
    pub steps: u64,
    pub trace: Vec<StateTag>,
}

impl Segment {
    pub(crate) fn at_point(index: usize, point: &TrackPoint) -> Self {
        Self {
            index,
            lat: point.lat,
            lon: point.lon,
            elevation: point.elevation,
            original_elevation: point.elevation,
            ..Self::default()
        }
    }

    /// Whether the segment carries any kinematics.
    pub fn is_ridden(&self) -> bool {
        self.horizontal_distance > 0.0
    }

    pub(crate) fn reset_kinematics(&mut self) {
        self.entry_velocity = 0.0;
        self.exit_velocity = 0.0;
        self.peak_velocity = 0.0;
        self.time = 0.0;
        self.rider_time = 0.0;
        self.brake_time = 0.0;
        self.freewheel_time = 0.0;
        self.rider_distance = 0.0;
        self.brake_distance = 0.0;
        self.freewheel_distance = 0.0;
        self.energy = EnergyTerms::default();
        self.steps = 0;
        self.trace.clear();
    }

    /// Record a state on entry, collapsing immediate repeats.
    pub(crate) fn enter(&mut self, tag: StateTag) {
        if self.trace.last() != Some(&tag) {
            self.trace.push(tag);
        }
    }

    pub fn passed_through(&self, tag: StateTag) -> bool {
        self.trace.contains(&tag)
    }
}

/// Ambient wind for a ride: speed and the compass direction it blows from.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindSetup {
    pub speed_mps: f64,
    pub from_deg: f64,
}

impl WindSetup {
    /// Head-wind component for a rider travelling on `heading_deg`.
    pub fn head_wind(&self, heading_deg: f64) -> f64 {
        if self.speed_mps == 0.0 {
            return 0.0;
        }
        self.speed_mps * (self.from_deg - heading_deg).to_radians().cos()
    }
}

/// Route-level aggregates maintained by the segmenter and filters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouteStats {
    pub accepted_points: usize,
    pub rejected_points: usize,
    pub mean_latitude: f64,
    pub mean_elevation: f64,
    pub min_elevation: f64,
    pub max_elevation: f64,
    pub mean_distance: f64,
    pub median_distance: f64,
    pub horizontal_length: f64,
    pub length: f64,
    pub wind: WindSetup,
    pub filter: FilterStats,
}

/// Ordered container of segments. `segments[0]` is the origin sentinel:
/// it holds the first accepted sample and has zero distance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Route {
    pub segments: Vec<Segment>,
    pub stats: RouteStats,
}

impl Route {
    /// Build a route straight from `(horizontal_distance, grade)` pairs,
    /// bypassing the segmenter. Positions are left at the origin.
    pub fn from_profile(start_elevation: f64, profile: &[(f64, f64)]) -> Self {
        let mut segments = Vec::with_capacity(profile.len() + 1);
        segments.push(Segment::at_point(0, &TrackPoint::new(0.0, 0.0, start_elevation)));
        let mut elevation = start_elevation;
        for (i, &(horizontal, grade)) in profile.iter().enumerate() {
            elevation += horizontal * grade;
            let mut seg = Segment::at_point(i + 1, &TrackPoint::new(0.0, 0.0, elevation));
            seg.horizontal_distance = horizontal.max(0.0);
            segments.push(seg);
        }
        let ridden = profile.iter().filter(|(h, _)| *h > 0.0).count().max(1) as f64;
        let mean = profile.iter().map(|(h, _)| h.max(0.0)).sum::<f64>() / ridden;
        let mut route = Route {
            segments,
            stats: RouteStats {
                accepted_points: profile.len() + 1,
                mean_distance: mean,
                median_distance: mean,
                ..RouteStats::default()
            },
        };
        route.recompute_geometry();
        route
    }

    /// Number of segments after the origin sentinel.
    pub fn len(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segments that carry kinematics, in route order.
    pub fn ridden(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().skip(1).filter(|s| s.is_ridden())
    }

    pub fn elevations(&self) -> Vec<f64> {
        self.segments.iter().map(|s| s.elevation).collect()
    }

    /// Re-derive grade and true distance of every segment from its elevations.
    pub fn recompute_geometry(&mut self) {
        let mut horizontal = 0.0;
        let mut length = 0.0;
        for i in 1..self.segments.len() {
            let prev_elevation = self.segments[i - 1].elevation;
            let seg = &mut self.segments[i];
            if seg.horizontal_distance > 0.0 {
                seg.grade = (seg.elevation - prev_elevation) / seg.horizontal_distance;
                seg.distance = seg.horizontal_distance * (1.0 + seg.grade * seg.grade).sqrt();
            } else {
                seg.grade = 0.0;
                seg.distance = 0.0;
            }
            horizontal += seg.horizontal_distance;
            length += seg.distance;
        }
        self.stats.horizontal_length = horizontal;
        self.stats.length = length;
    }

    /// Resolve the ride's wind setup into per-segment head-wind components.
    pub fn apply_wind(&mut self, wind: &WindSetup) {
        self.stats.wind = *wind;
        for seg in self.segments.iter_mut().skip(1) {
            seg.head_wind = wind.head_wind(seg.heading_deg);
        }
    }

    /// Total elapsed time over all ridden segments.
    pub fn total_time(&self) -> f64 {
        self.ridden().map(|s| s.time).sum()
    }
}
