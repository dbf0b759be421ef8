//! Reference implementations of the motion and power-ratio oracles.
//!
//! The force model is the usual road-cycling one: gravity and rolling
//! resistance from the grade, aerodynamic drag against the air speed
//! (ground speed plus head wind), and a constant deceleration when braking.
//! Every step is evaluated at a single mid-step velocity, which makes the
//! kinetic energy change equal to the work of the net force by construction.

use crate::oracle::{Direction, MotionModel, PowerRatio, Step, StepEnergy, Terrain};
use crate::params::{PhysicsParams, RatioParams};

pub const GRAVITY: f64 = 9.81;

/// Floor applied to velocities used as divisors.
const MIN_SPEED: f64 = 0.1;
/// Upper bracket for every velocity root-finder.
const SPEED_LIMIT: f64 = 150.0;
const ROOT_TOL: f64 = 1e-9;
const ROOT_ITERATIONS: usize = 200;

#[derive(Clone, Debug)]
pub struct BikePhysics {
    mass: f64,
    cda: f64,
    crr: f64,
    air_density: f64,
    brake_decel: f64,
}

impl BikePhysics {
    pub fn new(params: &PhysicsParams) -> Self {
        Self {
            mass: params.mass_kg,
            cda: params.cda_m2,
            crr: params.crr,
            air_density: params.air_density,
            brake_decel: params.brake_decel_mps2,
        }
    }

    fn slope(grade: f64) -> (f64, f64) {
        let hyp = (1.0 + grade * grade).sqrt();
        (grade / hyp, 1.0 / hyp)
    }

    pub fn gravity_force(&self, terrain: &Terrain) -> f64 {
        let (sin, _) = Self::slope(terrain.grade);
        self.mass * GRAVITY * sin
    }

    pub fn rolling_force(&self, terrain: &Terrain) -> f64 {
        let (_, cos) = Self::slope(terrain.grade);
        self.crr * self.mass * GRAVITY * cos
    }

    fn drag_slope(&self, terrain: &Terrain, v: f64) -> f64 {
        self.air_density * self.cda * (v + terrain.head_wind).abs()
    }

    fn net_force(&self, terrain: &Terrain, v: f64, power: f64, braking: bool) -> f64 {
        let brake = if braking { self.brake_force() } else { 0.0 };
        power / v.max(MIN_SPEED) - self.resistance(terrain, v) - brake
    }

    /// Energy over `ds` with every force evaluated at `vm`; also returns the time.
    fn energy_over(
        &self,
        terrain: &Terrain,
        vm: f64,
        ds: f64,
        power: f64,
        braking: bool,
    ) -> (StepEnergy, f64) {
        let vm = vm.max(MIN_SPEED);
        let dt = ds / vm;
        let rider = power * dt;
        let drag = -self.drag_force(terrain, vm) * ds;
        let rolling = -self.rolling_force(terrain) * ds;
        let gravity = -self.gravity_force(terrain) * ds;
        let braking = if braking {
            -self.brake_force() * ds
        } else {
            0.0
        };
        let kinetic = -(rider + drag + rolling + gravity + braking);
        (
            StepEnergy {
                rider,
                drag,
                rolling,
                gravity,
                kinetic,
                braking,
            },
            dt,
        )
    }

    fn pushes(force: f64, direction: Direction) -> bool {
        match direction {
            Direction::Accelerate => force > 0.0,
            Direction::Decelerate => force < 0.0,
        }
    }

    fn finish_step(
        &self,
        terrain: &Terrain,
        v: f64,
        vm: f64,
        ds: f64,
        force: f64,
        power: f64,
        braking: bool,
    ) -> Step {
        let v1_sq = v * v + 2.0 * force * ds / self.mass;
        if !v1_sq.is_finite() || v1_sq <= 0.0 {
            return Step::infeasible();
        }
        let (energy, dt) = self.energy_over(terrain, vm, ds, power, braking);
        Step {
            dv: v1_sq.sqrt() - v,
            ds,
            dt,
            energy,
            feasible: true,
        }
    }
}

impl MotionModel for BikePhysics {
    fn mass(&self) -> f64 {
        self.mass
    }

    fn drag_force(&self, terrain: &Terrain, v: f64) -> f64 {
        let air = v + terrain.head_wind;
        0.5 * self.air_density * self.cda * air * air.abs()
    }

    fn brake_force(&self) -> f64 {
        self.mass * self.brake_decel
    }

    fn resistance(&self, terrain: &Terrain, v: f64) -> f64 {
        self.gravity_force(terrain) + self.rolling_force(terrain) + self.drag_force(terrain, v)
    }

    fn step_velocity(&self, terrain: &Terrain, v: f64, dv: f64, power: f64, braking: bool) -> Step {
        if dv == 0.0 {
            return Step {
                feasible: true,
                ..Step::default()
            };
        }
        let v1 = v + dv;
        if v1 < 0.0 {
            return Step::infeasible();
        }
        let vm = v + 0.5 * dv;
        let force = self.net_force(terrain, vm, power, braking);
        if !force.is_finite() || force * dv <= 0.0 {
            return Step::infeasible();
        }
        let ds = self.mass * (v1 * v1 - v * v) / (2.0 * force);
        let (energy, dt) = self.energy_over(terrain, vm, ds, power, braking);
        Step {
            dv,
            ds,
            dt,
            energy,
            feasible: true,
        }
    }

    fn step_distance(
        &self,
        terrain: &Terrain,
        v: f64,
        ds: f64,
        power: f64,
        braking: bool,
        direction: Direction,
    ) -> Step {
        if ds <= 0.0 {
            return Step {
                feasible: true,
                ..Step::default()
            };
        }
        let f0 = self.net_force(terrain, v, power, braking);
        let predicted = (v * v + 2.0 * f0 * ds / self.mass).max(0.0).sqrt();
        let vm = 0.5 * (v + predicted);
        let force = self.net_force(terrain, vm, power, braking);
        if !Self::pushes(force, direction) {
            return Step::infeasible();
        }
        self.finish_step(terrain, v, vm, ds, force, power, braking)
    }

    fn step_time(
        &self,
        terrain: &Terrain,
        v: f64,
        dt: f64,
        power: f64,
        braking: bool,
        direction: Direction,
    ) -> Step {
        if dt <= 0.0 {
            return Step {
                feasible: true,
                ..Step::default()
            };
        }
        let f0 = self.net_force(terrain, v, power, braking);
        let vm = (v + 0.5 * f0 * dt / self.mass).max(MIN_SPEED);
        let force = self.net_force(terrain, vm, power, braking);
        if !Self::pushes(force, direction) {
            return Step::infeasible();
        }
        self.finish_step(terrain, v, vm, vm * dt, force, power, braking)
    }

    fn velocity_from_power(
        &self,
        terrain: &Terrain,
        power: f64,
        guess: Option<f64>,
    ) -> Option<f64> {
        if power <= 0.0 {
            return self.freewheel_velocity(terrain);
        }
        let surplus = |v: f64| power - v * self.resistance(terrain, v);
        let mut lo = self.freewheel_velocity(terrain).unwrap_or(MIN_SPEED);
        if surplus(lo) <= 0.0 {
            return None;
        }
        let mut hi = (2.0 * lo).max(1.0);
        while surplus(hi) > 0.0 {
            hi *= 2.0;
            if hi > SPEED_LIMIT {
                return None;
            }
        }

        let mut v = match guess {
            Some(g) if g > lo && g < hi => g,
            _ => 0.5 * (lo + hi),
        };
        for _ in 0..ROOT_ITERATIONS {
            let f = surplus(v);
            if f.abs() < ROOT_TOL {
                return Some(v);
            }
            if f > 0.0 {
                lo = v;
            } else {
                hi = v;
            }
            if hi - lo < ROOT_TOL {
                break;
            }
            let slope = -(self.resistance(terrain, v) + v * self.drag_slope(terrain, v));
            let newton = if slope.abs() > f64::EPSILON {
                v - f / slope
            } else {
                f64::NAN
            };
            v = if newton.is_finite() && newton > lo && newton < hi {
                newton
            } else {
                0.5 * (lo + hi)
            };
        }
        Some(v)
    }

    fn power_from_velocity(&self, terrain: &Terrain, v: f64) -> f64 {
        v * self.resistance(terrain, v)
    }

    fn grade_from_velocity_power(&self, head_wind: f64, v: f64, power: f64) -> Option<f64> {
        let excess = |grade: f64| v * self.resistance(&Terrain::new(grade, head_wind), v) - power;
        let (mut lo, mut hi) = (-1.0, 1.0);
        if excess(lo) > 0.0 || excess(hi) < 0.0 {
            return None;
        }
        for _ in 0..ROOT_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            if excess(mid) > 0.0 {
                hi = mid;
            } else {
                lo = mid;
            }
            if hi - lo < ROOT_TOL {
                break;
            }
        }
        Some(0.5 * (lo + hi))
    }

    fn freewheel_velocity(&self, terrain: &Terrain) -> Option<f64> {
        if self.resistance(terrain, MIN_SPEED) >= 0.0 {
            return None;
        }
        let mut lo = MIN_SPEED;
        let mut hi = 1.0_f64.max(2.0 * MIN_SPEED);
        while self.resistance(terrain, hi) < 0.0 {
            lo = hi;
            hi *= 2.0;
            if hi > SPEED_LIMIT {
                return None;
            }
        }
        for _ in 0..ROOT_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            if self.resistance(terrain, mid) < 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < ROOT_TOL {
                break;
            }
        }
        Some(0.5 * (lo + hi))
    }

    fn velocity_from_brake_distance(
        &self,
        terrain: &Terrain,
        distance: f64,
        v_end: f64,
    ) -> Option<f64> {
        let v_end = v_end.max(0.0);
        if distance <= 0.0 {
            return Some(v_end);
        }
        let stop_distance = |v0: f64| {
            let step = self.brake(terrain, v0, v_end);
            step.feasible.then_some(step.ds)
        };

        let mut lo = v_end;
        let mut hi = v_end + 1.0;
        loop {
            match stop_distance(hi) {
                None => return None,
                Some(ds) if ds >= distance => break,
                Some(_) => {
                    lo = hi;
                    hi = v_end + 2.0 * (hi - v_end);
                    if hi > SPEED_LIMIT {
                        return Some(SPEED_LIMIT);
                    }
                }
            }
        }
        for _ in 0..ROOT_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            match stop_distance(mid) {
                Some(ds) if ds < distance => lo = mid,
                _ => hi = mid,
            }
            if hi - lo < ROOT_TOL {
                break;
            }
        }
        Some(lo)
    }

    fn hold_velocity(&self, terrain: &Terrain, v: f64, ds: f64) -> Step {
        if ds <= 0.0 {
            return Step {
                feasible: true,
                ..Step::default()
            };
        }
        let dt = ds / v.max(MIN_SPEED);
        let need = self.power_from_velocity(terrain, v);
        let rider = need.max(0.0) * dt;
        let braking = need.min(0.0) * dt;
        let drag = -self.drag_force(terrain, v) * ds;
        let rolling = -self.rolling_force(terrain) * ds;
        let gravity = -self.gravity_force(terrain) * ds;
        Step {
            dv: 0.0,
            ds,
            dt,
            energy: StepEnergy {
                rider,
                drag,
                rolling,
                gravity,
                kinetic: -(rider + drag + rolling + gravity + braking),
                braking,
            },
            feasible: true,
        }
    }

    fn brake(&self, terrain: &Terrain, v_start: f64, v_end: f64) -> Step {
        if v_end >= v_start {
            return Step {
                feasible: true,
                ..Step::default()
            };
        }
        self.step_velocity(terrain, v_start, v_end - v_start, 0.0, true)
    }
}

/// Piecewise-linear power multiplier on grade and wind, saturating at the
/// calibration thresholds.
#[derive(Clone, Debug)]
pub struct RatioModel {
    params: RatioParams,
}

impl RatioModel {
    pub fn new(params: &RatioParams) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

fn saturating_blend(value: f64, threshold: f64, at_threshold: f64) -> f64 {
    let fraction = if threshold > 0.0 {
        (value / threshold).clamp(0.0, 1.0)
    } else {
        1.0
    };
    1.0 + (at_threshold - 1.0) * fraction
}

impl PowerRatio for RatioModel {
    fn ratio(&self, grade: f64, head_wind: f64) -> f64 {
        let p = &self.params;
        let grade_part = if grade >= 0.0 {
            saturating_blend(grade, p.uphill_grade, p.uphill_ratio)
        } else {
            saturating_blend(-grade, p.downhill_grade, p.downhill_ratio)
        };
        let wind_part = if head_wind >= 0.0 {
            saturating_blend(head_wind, p.headwind_mps, p.headwind_ratio)
        } else {
            saturating_blend(-head_wind, p.tailwind_mps, p.tailwind_ratio)
        };
        (grade_part * wind_part).max(0.0)
    }
}
