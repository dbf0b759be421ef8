//! Ride time and energy estimation over elevation-tagged routes.
//!
//! A ride runs four passes in order: the road segmenter turns track points
//! into segments, the grade filters smooth the elevation profile, the
//! velocity policy solver assigns targets and ceilings from the last segment
//! back to the first, and the kinematic integrator rides the route forward.
//! [`RideSummary`] aggregates the result.

use thiserror::Error;
use tracing::info;

pub mod filter;
pub mod integrator;
pub mod oracle;
pub mod params;
pub mod physics;
pub mod policy;
pub mod route;
pub mod segmenter;
pub mod summary;

pub use filter::{apply_filters, FilterConfig, FilterStage, FilterStats};
pub use integrator::{
    integrate_route, integrate_route_with, IntegratorStats, StepSample, StepSink,
};
pub use oracle::{Direction, MotionModel, PowerRatio, Step, StepEnergy, Terrain};
pub use params::{
    IntegratorParams, PhysicsParams, PolicyParams, RatioParams, RideParams, SegmenterConfig,
    StepMode,
};
pub use physics::{BikePhysics, RatioModel};
pub use policy::{solve_policy, PolicyStats, VelocityTable};
pub use route::{EnergyTerms, Route, RouteStats, Segment, StateTag, TrackPoint, WindSetup};
pub use segmenter::build_route;
pub use summary::{RideSummary, SegmentRow};

#[derive(Error, Debug)]
pub enum RideError {
    #[error("degenerate route: {usable} usable point(s), need at least 2")]
    DegenerateRoute { usable: usize },
    #[error(
        "target velocity not solvable on segment {segment} (grade {grade:.4}): \
         {power_w:.1} W needed at the pedalled-speed limit"
    )]
    TargetUnsolvable {
        segment: usize,
        grade: f64,
        power_w: f64,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Run the full pipeline over `points` with caller-supplied oracles.
///
/// `table`, when given, must have been built for the same policy, motion and
/// ratio configuration.
pub fn simulate_route<M, R>(
    points: &[TrackPoint],
    params: &RideParams,
    motion: &M,
    ratio: &R,
    table: Option<&VelocityTable>,
) -> Result<Route, RideError>
where
    M: MotionModel + ?Sized,
    R: PowerRatio + ?Sized,
{
    params.validate()?;
    let mut route = build_route(points, &params.segmenter)?;
    route.apply_wind(&params.wind);
    apply_filters(&mut route, &params.filter);
    solve_policy(&mut route, &params.policy, motion, ratio, table)?;
    let stats = integrate_route(&mut route, &params.policy, &params.integrator, motion);
    info!(
        segments = route.len(),
        rejected = route.stats.rejected_points,
        steps = stats.steps,
        time_s = route.total_time(),
        "ride simulated"
    );
    Ok(route)
}

/// Run the full pipeline with the built-in physics and ratio models.
pub fn simulate(points: &[TrackPoint], params: &RideParams) -> Result<Route, RideError> {
    let motion = BikePhysics::new(&params.physics);
    let ratio = RatioModel::new(&params.ratio);
    simulate_route(points, params, &motion, &ratio, None)
}
