//! Invariants every integrated route must satisfy.

use ridetime::{
    integrate_route, integrate_route_with, solve_policy, BikePhysics, IntegratorParams,
    PhysicsParams, PolicyParams, RatioModel, RatioParams, Route, StateTag, StepMode, StepSample,
};

fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() < epsilon
}

fn oracles() -> (BikePhysics, RatioModel) {
    (
        BikePhysics::new(&PhysicsParams::default()),
        RatioModel::new(&RatioParams::default()),
    )
}

/// Climbs, descents steep enough to freewheel and brake, and a tight corner.
fn rolling_route() -> Route {
    let mut route = Route::from_profile(
        300.0,
        &[
            (200.0, 0.0),
            (150.0, 0.04),
            (120.0, 0.08),
            (60.0, 0.02),
            (250.0, -0.03),
            (180.0, -0.07),
            (60.0, -0.10),
            (30.0, 0.0),
            (300.0, 0.01),
            (100.0, -0.05),
            (200.0, 0.0),
        ],
    );
    route.segments[8].turn_radius = 8.0;
    route
}

fn ride(mode: StepMode) -> (Route, Vec<StepSample>) {
    let (motion, ratio) = oracles();
    let policy = PolicyParams::default();
    let params = IntegratorParams {
        mode,
        ..IntegratorParams::default()
    };
    let mut route = rolling_route();
    solve_policy(&mut route, &policy, &motion, &ratio, None).unwrap();
    let mut samples = Vec::new();
    integrate_route_with(&mut route, &policy, &params, &motion, &mut samples);
    (route, samples)
}

const MODES: [StepMode; 3] = [StepMode::Velocity, StepMode::Distance, StepMode::Time];

#[test]
fn test_velocity_is_continuous_across_segments() {
    for mode in MODES {
        let (route, _) = ride(mode);
        for pair in route.segments.windows(2) {
            assert_eq!(
                pair[1].entry_velocity, pair[0].exit_velocity,
                "discontinuity before segment {} in {:?} mode",
                pair[1].index, mode
            );
        }
    }
}

#[test]
fn test_distances_times_and_steps_are_non_negative() {
    for mode in MODES {
        let (route, _) = ride(mode);
        for seg in route.ridden() {
            assert!(seg.distance >= 0.0);
            assert!(seg.time > 0.0);
            assert!(seg.rider_time >= 0.0 && seg.freewheel_time >= 0.0 && seg.brake_time >= 0.0);
            assert!(seg.rider_distance >= 0.0);
            assert!(seg.freewheel_distance >= 0.0);
            assert!(seg.brake_distance >= 0.0);
            assert!(!seg.trace.is_empty());
        }
    }
}

#[test]
fn test_buckets_cover_each_segment_exactly() {
    let (route, _) = ride(StepMode::Velocity);
    for seg in route.ridden() {
        let distance = seg.rider_distance + seg.freewheel_distance + seg.brake_distance;
        let time = seg.rider_time + seg.freewheel_time + seg.brake_time;
        assert!(approx_eq(distance, seg.distance, 1e-6), "segment {}", seg.index);
        assert!(approx_eq(time, seg.time, 1e-9), "segment {}", seg.index);
        let drag = seg.energy.drag_rider
            + seg.energy.drag_push
            + seg.energy.drag_freewheel
            + seg.energy.drag_brake;
        assert!(approx_eq(drag, seg.energy.drag, 1e-6), "segment {}", seg.index);
    }
}

#[test]
fn test_energy_balances_per_segment() {
    let mass = PhysicsParams::default().mass_kg;
    for mode in MODES {
        let (route, _) = ride(mode);
        for seg in route.ridden() {
            // Steps clipped at a bound are scaled linearly, which leaves a
            // small quadratic residue against the exact kinetic change.
            let expected = -0.5
                * mass
                * (seg.exit_velocity * seg.exit_velocity
                    - seg.entry_velocity * seg.entry_velocity);
            assert!(
                approx_eq(seg.energy.kinetic, expected, 1e-6 * expected.abs() + 10.0),
                "segment {} kinetic {} expected {} in {:?} mode",
                seg.index,
                seg.energy.kinetic,
                expected,
                mode
            );

            let residual = seg.energy.balance().abs() / seg.energy.magnitude();
            assert!(
                residual < 1e-5,
                "segment {} residual {} in {:?} mode",
                seg.index,
                residual,
                mode
            );
        }
    }
}

#[test]
fn test_velocity_never_rises_while_braking() {
    for mode in MODES {
        let (route, samples) = ride(mode);
        assert!(route.ridden().any(|s| s.passed_through(StateTag::Brake)));
        for seg in route.ridden() {
            let mut last = seg.entry_velocity;
            for sample in samples.iter().filter(|s| s.segment == seg.index) {
                if sample.state == StateTag::Brake {
                    assert!(
                        sample.velocity <= last + 1e-12,
                        "segment {} sped up while braking",
                        seg.index
                    );
                }
                last = sample.velocity;
            }
        }
    }
}

#[test]
fn test_corner_is_entered_at_its_ceiling() {
    let (route, _) = ride(StepMode::Velocity);
    let corner = &route.segments[8];
    assert!(corner.entry_velocity <= corner.entry_ceiling + 1e-6);
    assert!(route.segments[7].passed_through(StateTag::Brake));
}

#[test]
fn test_modes_agree_on_total_time() {
    let times: Vec<f64> = MODES.iter().map(|&m| ride(m).0.total_time()).collect();
    for t in &times[1..] {
        assert!((t - times[0]).abs() / times[0] < 0.01, "times {:?}", times);
    }
}

fn converge(mode: StepMode, start: f64) -> (f64, f64) {
    let (motion, ratio) = oracles();
    let policy = PolicyParams::default();
    let mut route = Route::from_profile(0.0, &[(3000.0, 0.0)]);
    solve_policy(&mut route, &policy, &motion, &ratio, None).unwrap();
    let params = IntegratorParams {
        mode,
        start_velocity_mps: Some(start),
        ..IntegratorParams::default()
    };
    integrate_route(&mut route, &policy, &params, &motion);
    let seg = &route.segments[1];
    (seg.exit_velocity, seg.target_velocity)
}

#[test]
fn test_every_mode_converges_to_target() {
    for mode in MODES {
        for start in [3.0, 12.0] {
            let (exit, target) = converge(mode, start);
            assert!(
                approx_eq(exit, target, 1e-4),
                "{:?} from {} ended at {} not {}",
                mode,
                start,
                exit,
                target
            );
        }
    }
}
