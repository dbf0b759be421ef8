//! Velocity policy solver. Walks the route from the last segment to the
//! first, assigning each ridden segment a target velocity and power, a local
//! speed ceiling, and the entry ceiling the previous segment must respect.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::oracle::{MotionModel, PowerRatio, Terrain};
use crate::params::PolicyParams;
use crate::route::Route;
use crate::RideError;

/// Powers at or below this are treated as zero.
const POWER_EPS: f64 = 1e-6;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyStats {
    pub freewheel_segments: usize,
    /// Targets pulled into the pedalled-speed band with power re-derived.
    pub clamped_targets: usize,
    pub braking_limited: usize,
    pub turn_limited: usize,
    pub entry_limited: usize,
    pub table_guesses: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Target {
    velocity: f64,
    power: f64,
    freewheel: bool,
}

/// Steady velocities on a grade × head-wind grid for one ride configuration,
/// used as root-finder starting points. Unsolvable cells hold NaN.
#[derive(Clone, Debug)]
pub struct VelocityTable {
    grades: Axis,
    winds: Axis,
    velocities: Vec<f64>,
}

#[derive(Clone, Copy, Debug)]
struct Axis {
    start: f64,
    step: f64,
    len: usize,
}

impl Axis {
    fn value(&self, i: usize) -> f64 {
        self.start + self.step * i as f64
    }

    /// Cell index and fraction within it, or `None` outside the axis.
    fn locate(&self, x: f64) -> Option<(usize, f64)> {
        let pos = (x - self.start) / self.step;
        let max = (self.len - 1) as f64;
        if !pos.is_finite() || pos < 0.0 || pos > max {
            return None;
        }
        let i = (pos.floor() as usize).min(self.len - 2);
        Some((i, pos - i as f64))
    }
}

impl VelocityTable {
    pub fn build<M, R>(params: &PolicyParams, motion: &M, ratio: &R) -> Self
    where
        M: MotionModel + ?Sized,
        R: PowerRatio + ?Sized,
    {
        let grades = Axis {
            start: -0.25,
            step: 0.01,
            len: 51,
        };
        let winds = Axis {
            start: -15.0,
            step: 1.0,
            len: 31,
        };
        let mut velocities = Vec::with_capacity(grades.len * winds.len);
        for gi in 0..grades.len {
            let grade = grades.value(gi);
            let mut guess = None;
            for wi in 0..winds.len {
                let wind = winds.value(wi);
                let power = target_power(params, ratio, grade, wind);
                let v = motion.velocity_from_power(&Terrain::new(grade, wind), power, guess);
                guess = v;
                velocities.push(v.unwrap_or(f64::NAN));
            }
        }
        Self {
            grades,
            winds,
            velocities,
        }
    }

    pub fn lookup(&self, grade: f64, head_wind: f64) -> Option<f64> {
        let (gi, gf) = self.grades.locate(grade)?;
        let (wi, wf) = self.winds.locate(head_wind)?;
        let at = |g: usize, w: usize| self.velocities[g * self.winds.len + w];
        let v = (1.0 - gf) * ((1.0 - wf) * at(gi, wi) + wf * at(gi, wi + 1))
            + gf * ((1.0 - wf) * at(gi + 1, wi) + wf * at(gi + 1, wi + 1));
        v.is_finite().then_some(v)
    }
}

fn target_power<R: PowerRatio + ?Sized>(
    params: &PolicyParams,
    ratio: &R,
    grade: f64,
    head_wind: f64,
) -> f64 {
    (params.flat_power_w * ratio.ratio(grade, head_wind)).min(params.uphill_power_cap_w)
}

fn coast_threshold<M: MotionModel + ?Sized>(
    params: &PolicyParams,
    motion: &M,
    head_wind: f64,
) -> Option<f64> {
    let base = match params.coast_grade {
        Some(grade) => grade,
        None => motion.grade_from_velocity_power(head_wind, params.max_pedal_speed_mps, 0.0)?,
    };
    Some(base - params.coast_wind_factor * head_wind)
}

struct Solver<'a, M: ?Sized, R: ?Sized> {
    params: &'a PolicyParams,
    motion: &'a M,
    ratio: &'a R,
    table: Option<&'a VelocityTable>,
    stats: PolicyStats,
}

impl<'a, M, R> Solver<'a, M, R>
where
    M: MotionModel + ?Sized,
    R: PowerRatio + ?Sized,
{
    fn target(
        &mut self,
        index: usize,
        terrain: &Terrain,
        previous: Option<f64>,
    ) -> Result<Target, RideError> {
        let p = self.params;

        if let Some(threshold) = coast_threshold(p, self.motion, terrain.head_wind) {
            if terrain.grade < threshold {
                if let Some(v) = self.motion.freewheel_velocity(terrain) {
                    if v > p.max_pedal_speed_mps {
                        return Ok(Target {
                            velocity: v,
                            power: 0.0,
                            freewheel: true,
                        });
                    }
                }
            }
        }

        let power = target_power(p, self.ratio, terrain.grade, terrain.head_wind);
        let guess = match self.table.and_then(|t| t.lookup(terrain.grade, terrain.head_wind)) {
            Some(v) => {
                self.stats.table_guesses += 1;
                Some(v)
            }
            None => previous,
        };
        let solved = self.motion.velocity_from_power(terrain, power, guess);

        let band = p.min_pedal_speed_mps..=p.max_pedal_speed_mps;
        match solved {
            Some(v) if power > POWER_EPS && band.contains(&v) => {
                return Ok(Target {
                    velocity: v,
                    power,
                    freewheel: false,
                })
            }
            Some(v)
                if power <= POWER_EPS
                    && terrain.head_wind < 0.0
                    && (v - p.max_pedal_speed_mps).abs() <= p.ceiling_slack_mps =>
            {
                return Ok(Target {
                    velocity: v,
                    power: 0.0,
                    freewheel: true,
                })
            }
            _ => {}
        }

        let clamped = match solved {
            Some(v) => v.clamp(p.min_pedal_speed_mps, p.max_pedal_speed_mps),
            None if terrain.grade >= 0.0 => p.min_pedal_speed_mps,
            None => p.max_pedal_speed_mps,
        };
        let needed = self.motion.power_from_velocity(terrain, clamped);
        if needed > p.uphill_power_cap_w {
            return Err(RideError::TargetUnsolvable {
                segment: index,
                grade: terrain.grade,
                power_w: needed,
            });
        }
        self.stats.clamped_targets += 1;
        Ok(Target {
            velocity: clamped,
            power: needed.max(0.0),
            freewheel: needed <= POWER_EPS,
        })
    }

    /// Local ceiling from braking distance or descent rate, and turn radius.
    fn ceiling(&mut self, terrain: &Terrain, turn_radius: f64) -> f64 {
        let p = self.params;
        let mut ceiling = p.max_speed_mps;

        if terrain.grade < 0.0 {
            let steep = -terrain.grade;
            let limit = match (p.braking_distance_m, p.max_descent_rate_mps) {
                (Some(distance), _) => {
                    let effective = if steep > p.steep_downhill_grade {
                        distance * p.steep_downhill_grade / steep
                    } else {
                        distance
                    };
                    // No solution means the brakes cannot slow the bike here.
                    Some(
                        self.motion
                            .velocity_from_brake_distance(terrain, effective, 0.0)
                            .unwrap_or(p.min_limited_speed_mps),
                    )
                }
                (None, Some(rate)) => {
                    let sin = steep / (1.0 + steep * steep).sqrt();
                    Some(rate / sin)
                }
                (None, None) => None,
            };
            if let Some(v) = limit {
                if v < ceiling {
                    ceiling = v;
                    self.stats.braking_limited += 1;
                }
            }
        }

        if turn_radius > 0.0 {
            let v = (p.lateral_accel_mps2 * turn_radius).sqrt();
            if v < ceiling {
                ceiling = v;
                self.stats.turn_limited += 1;
            }
        }

        ceiling.max(p.min_limited_speed_mps).min(p.max_speed_mps)
    }
}

/// Assign targets and ceilings to every segment, last to first.
///
/// Fails with [`RideError::TargetUnsolvable`] when a segment cannot be
/// ridden inside the pedalled-speed band without exceeding the uphill
/// power cap.
pub fn solve_policy<M, R>(
    route: &mut Route,
    params: &PolicyParams,
    motion: &M,
    ratio: &R,
    table: Option<&VelocityTable>,
) -> Result<PolicyStats, RideError>
where
    M: MotionModel + ?Sized,
    R: PowerRatio + ?Sized,
{
    let mut solver = Solver {
        params,
        motion,
        ratio,
        table,
        stats: PolicyStats::default(),
    };
    let mut next_entry: Option<f64> = None;
    let mut previous: Option<f64> = None;

    for i in (1..route.segments.len()).rev() {
        let seg = &mut route.segments[i];
        if !seg.is_ridden() {
            let limit = next_entry.unwrap_or(params.max_speed_mps);
            seg.target_velocity = 0.0;
            seg.target_power = 0.0;
            seg.freewheel = false;
            seg.velocity_ceiling = limit;
            seg.entry_ceiling = limit;
            continue;
        }

        let terrain = Terrain::new(seg.grade, seg.head_wind);
        let mut target = solver.target(i, &terrain, previous)?;
        let mut ceiling = solver.ceiling(&terrain, seg.turn_radius);

        if target.velocity > ceiling {
            let needed = motion.power_from_velocity(&terrain, ceiling);
            target = Target {
                velocity: ceiling,
                power: needed.max(0.0),
                freewheel: target.freewheel || needed <= POWER_EPS,
            };
        } else if target.velocity >= ceiling - params.ceiling_slack_mps {
            ceiling = target.velocity;
        }

        let entry = match next_entry {
            Some(limit) if params.entry_speed_limit => {
                let reachable = motion
                    .velocity_from_brake_distance(&terrain, seg.distance, limit)
                    .unwrap_or(limit);
                if reachable < ceiling {
                    solver.stats.entry_limited += 1;
                }
                ceiling.min(reachable)
            }
            _ => ceiling,
        };

        seg.target_velocity = target.velocity;
        seg.target_power = target.power;
        seg.freewheel = target.freewheel;
        seg.velocity_ceiling = ceiling;
        seg.entry_ceiling = entry;
        if target.freewheel {
            solver.stats.freewheel_segments += 1;
        } else {
            previous = Some(target.velocity);
        }
        next_entry = Some(entry);
    }

    debug!(stats = ?solver.stats, "velocity policy solved");
    Ok(solver.stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{PhysicsParams, RatioParams};
    use crate::physics::{BikePhysics, RatioModel};

    fn oracles() -> (BikePhysics, RatioModel) {
        (
            BikePhysics::new(&PhysicsParams::default()),
            RatioModel::new(&RatioParams::default()),
        )
    }

    #[test]
    fn test_flat_target_holds_flat_power() {
        let (motion, ratio) = oracles();
        let mut route = Route::from_profile(0.0, &[(500.0, 0.0)]);
        let params = PolicyParams::default();
        solve_policy(&mut route, &params, &motion, &ratio, None).unwrap();
        let seg = &route.segments[1];
        assert!((seg.target_power - params.flat_power_w).abs() < 1e-9);
        let p = motion.power_from_velocity(&Terrain::new(0.0, 0.0), seg.target_velocity);
        assert!((p - params.flat_power_w).abs() < 1e-5);
        assert!(!seg.freewheel);
        assert_eq!(seg.velocity_ceiling, params.max_speed_mps);
    }

    #[test]
    fn test_descent_freewheels_under_braking_ceiling() {
        let (motion, ratio) = oracles();
        let mut route = Route::from_profile(200.0, &[(400.0, -0.08)]);
        let params = PolicyParams::default();
        let stats = solve_policy(&mut route, &params, &motion, &ratio, None).unwrap();
        let seg = &route.segments[1];
        assert!(seg.freewheel);
        assert_eq!(seg.target_power, 0.0);
        assert!(seg.velocity_ceiling < params.max_speed_mps);
        assert!(seg.target_velocity <= seg.velocity_ceiling);
        assert_eq!(stats.braking_limited, 1);
        // Braking from the ceiling stops within the configured distance.
        let terrain = Terrain::new(seg.grade, 0.0);
        let stop = motion.brake(&terrain, seg.velocity_ceiling, 0.0);
        assert!((stop.ds - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_descent_rate_model_without_braking_distance() {
        let (motion, ratio) = oracles();
        let mut route = Route::from_profile(200.0, &[(400.0, -0.08)]);
        let params = PolicyParams {
            braking_distance_m: None,
            max_descent_rate_mps: Some(1.0),
            ..PolicyParams::default()
        };
        solve_policy(&mut route, &params, &motion, &ratio, None).unwrap();
        let sin = 0.08 / (1.0 + 0.08_f64 * 0.08).sqrt();
        let expected = 1.0 / sin;
        let seg = &route.segments[1];
        assert!((seg.velocity_ceiling - expected).abs() < 1e-6);
    }

    #[test]
    fn test_unreachable_climb_fails_with_segment_index() {
        let (motion, ratio) = oracles();
        let mut route = Route::from_profile(0.0, &[(100.0, 0.0), (100.0, 0.30), (100.0, 0.0)]);
        let err = solve_policy(&mut route, &PolicyParams::default(), &motion, &ratio, None)
            .unwrap_err();
        match err {
            RideError::TargetUnsolvable {
                segment,
                grade,
                power_w,
            } => {
                assert_eq!(segment, 2);
                assert!((grade - 0.30).abs() < 1e-9);
                assert!(power_w > 350.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_moderate_climb_clamps_to_min_pedal_speed() {
        let (motion, ratio) = oracles();
        // Steep enough that the ratio power stalls below the band, but
        // holding the minimum speed stays under the cap.
        let mut route = Route::from_profile(0.0, &[(100.0, 0.16)]);
        let params = PolicyParams::default();
        let stats = solve_policy(&mut route, &params, &motion, &ratio, None).unwrap();
        let seg = &route.segments[1];
        assert_eq!(stats.clamped_targets, 1);
        assert_eq!(seg.target_velocity, params.min_pedal_speed_mps);
        assert!(seg.target_power > params.flat_power_w);
        assert!(seg.target_power <= params.uphill_power_cap_w);
    }

    #[test]
    fn test_turn_radius_limits_ceiling() {
        let (motion, ratio) = oracles();
        let mut route = Route::from_profile(0.0, &[(100.0, 0.0), (20.0, 0.0)]);
        route.segments[2].turn_radius = 10.0;
        let params = PolicyParams::default();
        let stats = solve_policy(&mut route, &params, &motion, &ratio, None).unwrap();
        let expected = (params.lateral_accel_mps2 * 10.0).sqrt();
        let seg = &route.segments[2];
        assert!((seg.velocity_ceiling - expected).abs() < 1e-9);
        assert!((seg.target_velocity - expected).abs() < 1e-9);
        assert_eq!(stats.turn_limited, 1);
        // The straight before the corner must let the rider brake into it.
        let before = &route.segments[1];
        assert!(before.entry_ceiling <= before.velocity_ceiling);
        let stop = motion.brake(&Terrain::new(0.0, 0.0), before.entry_ceiling, expected);
        assert!(stop.ds <= before.distance + 1e-6 || before.entry_ceiling <= expected);
    }

    #[test]
    fn test_short_segment_inherits_entry_limit() {
        let (motion, ratio) = oracles();
        let mut route = Route::from_profile(0.0, &[(100.0, 0.0), (2.0, 0.0), (50.0, 0.0)]);
        route.segments[3].turn_radius = 4.0;
        let params = PolicyParams::default();
        solve_policy(&mut route, &params, &motion, &ratio, None).unwrap();
        let corner = route.segments[3].entry_ceiling;
        let short = &route.segments[2];
        assert!(short.entry_ceiling < short.velocity_ceiling);
        assert!(short.entry_ceiling > corner);
        assert!(route.segments[1].entry_ceiling >= short.entry_ceiling);
    }

    #[test]
    fn test_table_guess_gives_same_targets() {
        let (motion, ratio) = oracles();
        let params = PolicyParams::default();
        let table = VelocityTable::build(&params, &motion, &ratio);
        let profile = [(120.0, 0.02), (80.0, 0.055), (150.0, -0.01), (60.0, 0.0)];
        let mut plain = Route::from_profile(0.0, &profile);
        let mut guided = Route::from_profile(0.0, &profile);
        solve_policy(&mut plain, &params, &motion, &ratio, None).unwrap();
        let stats = solve_policy(&mut guided, &params, &motion, &ratio, Some(&table)).unwrap();
        assert_eq!(stats.table_guesses, 4);
        for (a, b) in plain.segments.iter().zip(&guided.segments) {
            assert!((a.target_velocity - b.target_velocity).abs() < 1e-6);
        }
    }

    #[test]
    fn test_table_lookup_bounds() {
        let (motion, ratio) = oracles();
        let params = PolicyParams::default();
        let table = VelocityTable::build(&params, &motion, &ratio);
        assert!(table.lookup(0.5, 0.0).is_none());
        assert!(table.lookup(0.0, 40.0).is_none());
        let v = table.lookup(0.0, 0.0).unwrap();
        let direct = motion
            .velocity_from_power(&Terrain::new(0.0, 0.0), params.flat_power_w, None)
            .unwrap();
        assert!((v - direct).abs() < 1e-6);
    }
}
