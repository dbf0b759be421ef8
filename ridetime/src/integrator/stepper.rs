//! Stepping strategies and the overshoot correction every stepping loop shares.

use crate::oracle::{Direction, MotionModel, Step, Terrain};
use crate::params::{IntegratorParams, StepMode};

/// Floor on the speed used to size distance steps.
const MIN_STEP_SPEED: f64 = 0.5;

/// Which bound a clipped step ran into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// The remaining distance of the segment.
    Distance,
    /// The target velocity of the phase.
    Velocity,
}

/// Scale `step` so it ends exactly on whichever bound it would cross first.
///
/// Every delta (velocity, distance, time, each energy term) is scaled by the
/// same fraction, so the per-step energy balance survives the correction.
/// Returns the bound that was hit, if any; the caller ends the loop then.
pub fn clip_step(
    step: Step,
    v: f64,
    target: f64,
    remaining: f64,
    direction: Direction,
) -> (Step, Option<Bound>) {
    let mut fraction = 1.0;
    let mut bound = None;

    if step.ds > remaining {
        fraction = (remaining / step.ds).max(0.0);
        bound = Some(Bound::Distance);
    }

    let gap = target - v;
    let crosses = match direction {
        Direction::Accelerate => step.dv > gap,
        Direction::Decelerate => step.dv < gap,
    };
    if crosses && step.dv != 0.0 {
        let to_target = (gap / step.dv).max(0.0);
        if to_target <= fraction {
            fraction = to_target;
            bound = Some(Bound::Velocity);
        }
    }

    match bound {
        Some(_) => (step.scaled(fraction), bound),
        None => (step, None),
    }
}

/// Step size for one phase, fixed when the phase starts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Stepper {
    Velocity { dv: f64 },
    Distance { ds: f64 },
    Time { dt: f64 },
}

impl Stepper {
    /// Strategy for driving from `v` toward `target` over `remaining` meters.
    pub fn for_phase(params: &IntegratorParams, v: f64, target: f64, remaining: f64) -> Self {
        match params.mode {
            StepMode::Velocity => Self::velocity_span(params, v, target),
            StepMode::Distance => {
                let average = (0.5 * (v + target)).max(MIN_STEP_SPEED);
                let count = (remaining / (average * params.time_step_s)).ceil().max(1.0);
                Stepper::Distance {
                    ds: remaining / count,
                }
            }
            StepMode::Time => Stepper::Time {
                dt: params.time_step_s,
            },
        }
    }

    /// Equal velocity increments that exactly span `v` to `target`.
    pub fn velocity_span(params: &IntegratorParams, v: f64, target: f64) -> Self {
        let span = target - v;
        let count = (span.abs() / params.velocity_step_mps).ceil().max(1.0);
        Stepper::Velocity { dv: span / count }
    }

    pub fn step<M: MotionModel + ?Sized>(
        &self,
        motion: &M,
        terrain: &Terrain,
        v: f64,
        power: f64,
        braking: bool,
        direction: Direction,
    ) -> Step {
        match *self {
            Stepper::Velocity { dv } => motion.step_velocity(terrain, v, dv, power, braking),
            Stepper::Distance { ds } => {
                motion.step_distance(terrain, v, ds, power, braking, direction)
            }
            Stepper::Time { dt } => motion.step_time(terrain, v, dt, power, braking, direction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::StepEnergy;

    fn step(dv: f64, ds: f64) -> Step {
        Step {
            dv,
            ds,
            dt: ds / 5.0,
            energy: StepEnergy {
                rider: 100.0,
                drag: -40.0,
                rolling: -10.0,
                gravity: 0.0,
                kinetic: -50.0,
                braking: 0.0,
            },
            feasible: true,
        }
    }

    #[test]
    fn test_clip_untouched_inside_bounds() {
        let s = step(0.1, 2.0);
        let (out, bound) = clip_step(s, 5.0, 6.0, 10.0, Direction::Accelerate);
        assert_eq!(out, s);
        assert_eq!(bound, None);
    }

    #[test]
    fn test_clip_on_distance() {
        let (out, bound) = clip_step(step(0.1, 4.0), 5.0, 6.0, 1.0, Direction::Accelerate);
        assert_eq!(bound, Some(Bound::Distance));
        assert!((out.ds - 1.0).abs() < 1e-12);
        assert!((out.dv - 0.025).abs() < 1e-12);
        assert!((out.energy.rider - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_clip_on_target_velocity_first() {
        // Target is crossed at 40 % of the step, distance at 50 %.
        let (out, bound) = clip_step(step(-0.5, 2.0), 5.0, 4.8, 1.0, Direction::Decelerate);
        assert_eq!(bound, Some(Bound::Velocity));
        assert!((out.dv + 0.2).abs() < 1e-12);
        assert!((out.ds - 0.8).abs() < 1e-12);
        let e = out.energy;
        let sum = e.rider + e.drag + e.rolling + e.gravity + e.kinetic + e.braking;
        assert!(sum.abs() < 1e-12);
    }

    #[test]
    fn test_velocity_span_is_exact() {
        let params = IntegratorParams::default();
        match Stepper::velocity_span(&params, 4.0, 4.33) {
            Stepper::Velocity { dv } => {
                let count = (0.33 / dv).round();
                assert_eq!(count, 7.0);
                assert!((dv * count - 0.33).abs() < 1e-12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_distance_steps_divide_remaining() {
        let params = IntegratorParams {
            mode: StepMode::Distance,
            ..IntegratorParams::default()
        };
        match Stepper::for_phase(&params, 4.0, 6.0, 100.0) {
            Stepper::Distance { ds } => {
                let count = 100.0 / ds;
                assert!((count - count.round()).abs() < 1e-9);
                assert!(ds <= 2.5 + 1e-12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
