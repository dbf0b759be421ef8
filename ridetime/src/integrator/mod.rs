//! Forward kinematic integration. Carries velocity from segment to segment,
//! running each one through the brake / drive / cruise state machine and
//! filling in its time, distance buckets and energy terms.

pub mod stepper;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::oracle::{Direction, MotionModel, Step, Terrain};
use crate::params::{IntegratorParams, PolicyParams};
use crate::route::{Route, Segment, StateTag};

pub use stepper::{clip_step, Bound, Stepper};

/// Distances below this count as an exhausted segment.
const DISTANCE_EPS: f64 = 1e-9;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct IntegratorStats {
    pub segments: usize,
    pub steps: u64,
    pub brake_phases: usize,
    /// Segments whose trace records a no-force termination.
    pub no_force_segments: usize,
    /// Phases dropped because their first step was infeasible.
    pub skipped_phases: usize,
    pub capped_phases: usize,
    /// Cruises that held a velocity a stalled drive left short of target.
    pub unsettled_holds: usize,
}

/// Velocity after one applied step, for callers that want the full history.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepSample {
    pub segment: usize,
    pub state: StateTag,
    pub velocity: f64,
    /// Distance covered within the segment after the step.
    pub distance: f64,
}

pub trait StepSink {
    fn record(&mut self, sample: StepSample);
}

impl StepSink for () {
    fn record(&mut self, _sample: StepSample) {}
}

impl StepSink for Vec<StepSample> {
    fn record(&mut self, sample: StepSample) {
        self.push(sample);
    }
}

/// Bucket a step's distance, time and drag are attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bucket {
    Rider,
    /// Pedalling to hold a constant velocity.
    Push,
    Freewheel,
    Brake,
}

/// Why a drive phase ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriveEnd {
    Target,
    OutOfRoad,
    /// One more step would leave too little road to brake to the exit limit.
    BrakeRoom,
    /// No force in the needed direction, or the step cap.
    Stalled,
}

/// Running state within one segment.
struct Progress {
    v: f64,
    covered: f64,
    total: f64,
}

impl Progress {
    fn remaining(&self) -> f64 {
        (self.total - self.covered).max(0.0)
    }

    fn exhausted(&self) -> bool {
        self.remaining() <= DISTANCE_EPS
    }
}

struct BrakePlan {
    steps: Vec<Step>,
    /// False when the oracle could not brake all the way to the end velocity.
    complete: bool,
}

impl BrakePlan {
    fn distance(&self) -> f64 {
        self.steps.iter().map(|s| s.ds).sum()
    }
}

struct Integrator<'a, M: ?Sized, S> {
    policy: &'a PolicyParams,
    params: &'a IntegratorParams,
    motion: &'a M,
    sink: &'a mut S,
    stats: IntegratorStats,
}

impl<'a, M, S> Integrator<'a, M, S>
where
    M: MotionModel + ?Sized,
    S: StepSink,
{
    fn ride(&mut self, seg: &mut Segment, v_in: f64, exit_limit: f64) -> f64 {
        seg.reset_kinematics();
        seg.entry_velocity = v_in;
        seg.peak_velocity = v_in;
        let terrain = Terrain::new(seg.grade, seg.head_wind);
        let tol = self.params.velocity_tolerance_mps;
        let mut progress = Progress {
            v: v_in,
            covered: 0.0,
            total: seg.distance,
        };

        if progress.v > seg.velocity_ceiling + tol {
            self.stats.brake_phases += 1;
            let ceiling = seg.velocity_ceiling;
            let plan = self.brake_plan(&terrain, progress.v, ceiling);
            self.apply_brake_plan(seg, &mut progress, plan, ceiling);
        }

        if !progress.exhausted() {
            let target = seg.target_velocity.min(seg.velocity_ceiling);
            let end = if (progress.v - target).abs() > tol {
                self.drive(seg, &terrain, &mut progress, target, exit_limit)
            } else {
                DriveEnd::Target
            };
            if !progress.exhausted() {
                if end == DriveEnd::Stalled {
                    self.stats.unsettled_holds += 1;
                    debug!(
                        segment = seg.index,
                        v = progress.v,
                        target,
                        target_power = seg.target_power,
                        "cruising at a velocity the drive could not bring to target"
                    );
                }
                self.cruise(seg, &terrain, &mut progress, exit_limit);
            }
        }

        if seg.passed_through(StateTag::NoForce) {
            self.stats.no_force_segments += 1;
        }
        self.stats.segments += 1;
        self.stats.steps += seg.steps;
        seg.exit_velocity = progress.v;
        progress.v
    }

    fn drive_power(&self, seg: &Segment, v: f64, direction: Direction) -> f64 {
        if seg.freewheel || v > self.policy.max_pedal_speed_mps {
            return 0.0;
        }
        let p = self.params;
        match direction {
            Direction::Accelerate => (p.accel_power_factor * seg.target_power)
                .clamp(p.accel_power_min_w, p.accel_power_max_w),
            Direction::Decelerate => p.decel_power_factor * seg.target_power,
        }
    }

    /// Accelerate or decelerate toward `target` until it is reached, the
    /// segment ends, the brakes need the rest of the road to make
    /// `exit_limit`, or the oracle cannot push in the needed direction.
    fn drive(
        &mut self,
        seg: &mut Segment,
        terrain: &Terrain,
        progress: &mut Progress,
        target: f64,
        exit_limit: f64,
    ) -> DriveEnd {
        let direction = Direction::toward(progress.v, target);
        let stepper = Stepper::for_phase(self.params, progress.v, target, progress.remaining());
        let tol = self.params.velocity_tolerance_mps;
        let mut phase_distance = 0.0;
        let mut count = 0u64;

        while !progress.exhausted() && (target - progress.v).abs() > tol {
            if count >= self.params.max_steps_per_phase {
                warn!(segment = seg.index, count, "step cap reached while driving to target");
                self.stats.capped_phases += 1;
                return DriveEnd::Stalled;
            }
            let power = self.drive_power(seg, progress.v, direction);
            let step = stepper.step(self.motion, terrain, progress.v, power, false, direction);
            if !step.feasible {
                self.no_force(seg, phase_distance, progress.v, power);
                return DriveEnd::Stalled;
            }

            let (step, bound) =
                clip_step(step, progress.v, target, progress.remaining(), direction);
            let left = progress.remaining() - step.ds;
            if !self.leaves_brake_room(terrain, progress.v + step.dv, left, exit_limit) {
                return DriveEnd::BrakeRoom;
            }
            let (tag, bucket) = if power > 0.0 {
                let tag = match direction {
                    Direction::Accelerate => StateTag::Accelerate,
                    Direction::Decelerate => StateTag::Decelerate,
                };
                (tag, Bucket::Rider)
            } else {
                (StateTag::Freewheel, Bucket::Freewheel)
            };
            self.apply(seg, progress, &step, tag, bucket, true);
            phase_distance += step.ds;
            count += 1;

            match bound {
                Some(Bound::Velocity) => {
                    progress.v = target;
                    return DriveEnd::Target;
                }
                Some(Bound::Distance) => {
                    progress.covered = progress.total;
                    return DriveEnd::OutOfRoad;
                }
                None => {}
            }
        }
        if progress.exhausted() {
            DriveEnd::OutOfRoad
        } else {
            DriveEnd::Target
        }
    }

    /// Whether braking from `v` down to `exit_limit` fits within `remaining`.
    fn leaves_brake_room(
        &self,
        terrain: &Terrain,
        v: f64,
        remaining: f64,
        exit_limit: f64,
    ) -> bool {
        if v <= exit_limit + self.params.velocity_tolerance_mps {
            return true;
        }
        self.brake_plan(terrain, v, exit_limit).distance() <= remaining.max(0.0)
    }

    /// Ride out the segment at the current velocity, braking at the far end
    /// when the next segment demands a lower entry speed.
    fn cruise(
        &mut self,
        seg: &mut Segment,
        terrain: &Terrain,
        progress: &mut Progress,
        exit_limit: f64,
    ) {
        let remaining = progress.remaining();
        if progress.v <= exit_limit + self.params.velocity_tolerance_mps {
            self.hold(seg, terrain, progress, remaining);
            return;
        }

        self.stats.brake_phases += 1;
        let plan = self.brake_plan(terrain, progress.v, exit_limit);
        let needed = plan.distance();
        if needed < remaining {
            self.hold(seg, terrain, progress, remaining - needed);
        }
        self.apply_brake_plan(seg, progress, plan, exit_limit);
        if !progress.exhausted() {
            // Braking stopped short of the end velocity; hold what was reached.
            let rest = progress.remaining();
            self.hold(seg, terrain, progress, rest);
        }
    }

    fn hold(&mut self, seg: &mut Segment, terrain: &Terrain, progress: &mut Progress, ds: f64) {
        if ds <= DISTANCE_EPS {
            return;
        }
        let step = self.motion.hold_velocity(terrain, progress.v, ds);
        let (tag, bucket) = if step.energy.braking < 0.0 {
            (StateTag::ConstantVelocity, Bucket::Brake)
        } else if step.energy.rider > 0.0 {
            (StateTag::ConstantVelocity, Bucket::Push)
        } else {
            (StateTag::Freewheel, Bucket::Freewheel)
        };
        self.apply(seg, progress, &step, tag, bucket, false);
    }

    /// Steps that brake from `v_start` to `v_end`, computed before any of
    /// them are applied so the caller can place them at the segment end.
    fn brake_plan(&self, terrain: &Terrain, v_start: f64, v_end: f64) -> BrakePlan {
        let p = self.params;
        if p.brake_single_step && v_start - v_end <= p.brake_single_step_max_dv {
            let step = self.motion.brake(terrain, v_start, v_end);
            return BrakePlan {
                complete: step.feasible,
                steps: if step.feasible { vec![step] } else { Vec::new() },
            };
        }

        let stepper = Stepper::velocity_span(p, v_start, v_end);
        let mut steps = Vec::new();
        let mut v = v_start;
        while v - v_end > p.velocity_tolerance_mps * 1e-3 {
            if steps.len() as u64 >= p.max_steps_per_phase {
                return BrakePlan {
                    steps,
                    complete: false,
                };
            }
            let step = stepper.step(self.motion, terrain, v, 0.0, true, Direction::Decelerate);
            if !step.feasible {
                return BrakePlan {
                    steps,
                    complete: false,
                };
            }
            let (step, bound) = clip_step(step, v, v_end, f64::INFINITY, Direction::Decelerate);
            v += step.dv;
            steps.push(step);
            if bound.is_some() {
                break;
            }
        }
        BrakePlan {
            steps,
            complete: true,
        }
    }

    fn apply_brake_plan(
        &mut self,
        seg: &mut Segment,
        progress: &mut Progress,
        plan: BrakePlan,
        v_end: f64,
    ) {
        let mut phase_distance = 0.0;
        let mut clipped = false;
        for step in &plan.steps {
            let (step, bound) = clip_step(
                *step,
                progress.v,
                v_end,
                progress.remaining(),
                Direction::Decelerate,
            );
            self.apply(seg, progress, &step, StateTag::Brake, Bucket::Brake, true);
            phase_distance += step.ds;
            match bound {
                Some(Bound::Velocity) => {
                    progress.v = v_end;
                    break;
                }
                Some(Bound::Distance) => {
                    progress.covered = progress.total;
                    clipped = true;
                    break;
                }
                None => {}
            }
        }
        if !plan.complete && !clipped {
            self.no_force(seg, phase_distance, progress.v, 0.0);
        }
    }

    fn no_force(&mut self, seg: &mut Segment, phase_distance: f64, v: f64, power: f64) {
        if phase_distance > 0.0 {
            seg.enter(StateTag::NoForce);
            debug!(
                segment = seg.index,
                v,
                power,
                phase_distance,
                "no force in requested direction, phase ended early"
            );
        } else {
            self.stats.skipped_phases += 1;
            debug!(segment = seg.index, v, power, "no force in requested direction, phase skipped");
        }
    }

    fn apply(
        &mut self,
        seg: &mut Segment,
        progress: &mut Progress,
        step: &Step,
        tag: StateTag,
        bucket: Bucket,
        counted: bool,
    ) {
        seg.enter(tag);
        progress.v += step.dv;
        progress.covered += step.ds;
        seg.peak_velocity = seg.peak_velocity.max(progress.v);
        seg.time += step.dt;

        let e = &step.energy;
        seg.energy.rider += e.rider;
        seg.energy.drag += e.drag;
        seg.energy.rolling += e.rolling;
        seg.energy.gravity += e.gravity;
        seg.energy.kinetic += e.kinetic;
        seg.energy.braking += e.braking;
        match bucket {
            Bucket::Rider | Bucket::Push => {
                seg.rider_distance += step.ds;
                seg.rider_time += step.dt;
                if bucket == Bucket::Push {
                    seg.energy.drag_push += e.drag;
                } else {
                    seg.energy.drag_rider += e.drag;
                }
            }
            Bucket::Freewheel => {
                seg.freewheel_distance += step.ds;
                seg.freewheel_time += step.dt;
                seg.energy.drag_freewheel += e.drag;
            }
            Bucket::Brake => {
                seg.brake_distance += step.ds;
                seg.brake_time += step.dt;
                seg.energy.drag_brake += e.drag;
            }
        }
        if counted {
            seg.steps += 1;
        }

        self.sink.record(StepSample {
            segment: seg.index,
            state: tag,
            velocity: progress.v,
            distance: progress.covered,
        });
    }
}

/// Integrate every segment head to tail, starting from
/// `params.start_velocity_mps` or, when not given, the first ridden
/// segment's target velocity.
pub fn integrate_route<M: MotionModel + ?Sized>(
    route: &mut Route,
    policy: &PolicyParams,
    params: &IntegratorParams,
    motion: &M,
) -> IntegratorStats {
    integrate_route_with(route, policy, params, motion, &mut ())
}

/// Like [`integrate_route`], reporting every applied step to `sink`.
pub fn integrate_route_with<M, S>(
    route: &mut Route,
    policy: &PolicyParams,
    params: &IntegratorParams,
    motion: &M,
    sink: &mut S,
) -> IntegratorStats
where
    M: MotionModel + ?Sized,
    S: StepSink,
{
    let start = params
        .start_velocity_mps
        .or_else(|| route.ridden().next().map(|s| s.target_velocity))
        .unwrap_or(0.0);

    // Each segment must leave at or below the next ridden segment's entry ceiling.
    let mut exit_limits = vec![f64::INFINITY; route.segments.len()];
    let mut limit = f64::INFINITY;
    for (i, seg) in route.segments.iter().enumerate().skip(1).rev() {
        exit_limits[i] = limit;
        if seg.is_ridden() {
            limit = seg.entry_ceiling;
        }
    }

    let mut integrator = Integrator {
        policy,
        params,
        motion,
        sink,
        stats: IntegratorStats::default(),
    };
    let mut v = start;
    for (i, seg) in route.segments.iter_mut().enumerate() {
        if i == 0 || !seg.is_ridden() {
            seg.reset_kinematics();
            seg.entry_velocity = v;
            seg.exit_velocity = v;
            seg.peak_velocity = v;
            continue;
        }
        v = integrator.ride(seg, v, exit_limits[i]);
    }

    debug!(
        mode = params.mode.as_str(),
        start,
        stats = ?integrator.stats,
        "route integrated"
    );
    integrator.stats
}
