//! End-to-end rides with known outcomes.

use ridetime::segmenter::meters_per_degree;
use ridetime::{
    integrate_route, integrate_route_with, simulate, solve_policy, BikePhysics, FilterConfig,
    FilterStage, IntegratorParams, PhysicsParams, PolicyParams, RatioModel, RatioParams,
    RideError, RideParams, RideSummary, Route, StateTag, StepSample, TrackPoint,
};

fn oracles() -> (BikePhysics, RatioModel) {
    (
        BikePhysics::new(&PhysicsParams::default()),
        RatioModel::new(&RatioParams::default()),
    )
}

/// Points due north from (45, 6), elevation from `profile(distance)`.
fn northward(count: usize, step_m: f64, profile: impl Fn(f64) -> f64) -> Vec<TrackPoint> {
    let (lat_scale, _) = meters_per_degree(45.0);
    (0..count)
        .map(|i| {
            let along = i as f64 * step_m;
            TrackPoint::new(45.0 + along / lat_scale, 6.0, profile(along))
        })
        .collect()
}

#[test]
fn test_flat_cruise_at_target() {
    let (motion, ratio) = oracles();
    let policy = PolicyParams::default();
    let mut route = Route::from_profile(0.0, &[(1000.0, 0.0)]);
    solve_policy(&mut route, &policy, &motion, &ratio, None).unwrap();
    let target = route.segments[1].target_velocity;
    let params = IntegratorParams {
        start_velocity_mps: Some(target),
        ..IntegratorParams::default()
    };
    integrate_route(&mut route, &policy, &params, &motion);

    let seg = &route.segments[1];
    assert_eq!(seg.steps, 0);
    assert_eq!(seg.exit_velocity, seg.entry_velocity);
    assert!((seg.time - 1000.0 / target).abs() < 1e-9);
    assert!(!seg.passed_through(StateTag::Brake));
}

fn overspeed_descent(params: IntegratorParams) -> (Route, Vec<StepSample>) {
    let (motion, ratio) = oracles();
    let policy = PolicyParams::default();
    let mut route = Route::from_profile(500.0, &[(300.0, -0.08)]);
    solve_policy(&mut route, &policy, &motion, &ratio, None).unwrap();
    let ceiling = route.segments[1].velocity_ceiling;
    let params = IntegratorParams {
        start_velocity_mps: Some(ceiling + 5.0),
        ..params
    };
    let mut samples = Vec::new();
    integrate_route_with(&mut route, &policy, &params, &motion, &mut samples);
    (route, samples)
}

#[test]
fn test_overspeed_descent_brakes_first() {
    for params in [
        IntegratorParams::default(),
        IntegratorParams {
            brake_single_step_max_dv: 10.0,
            ..IntegratorParams::default()
        },
    ] {
        let (route, samples) = overspeed_descent(params);
        let seg = &route.segments[1];
        let ceiling = seg.velocity_ceiling;
        assert_eq!(seg.trace.first(), Some(&StateTag::Brake));

        let first_other = samples
            .iter()
            .position(|s| s.state != StateTag::Brake)
            .unwrap_or(samples.len());
        assert!(first_other > 0);
        let after_brake = samples[first_other - 1].velocity;
        assert!(after_brake <= ceiling + 1e-3, "{} > {}", after_brake, ceiling);
        assert!(samples[first_other..]
            .iter()
            .all(|s| s.state != StateTag::Accelerate));
        assert!(seg.exit_velocity <= ceiling + 1e-3);
        assert!(seg.brake_distance > 0.0);
    }
}

#[test]
fn test_unreachable_climb_is_a_setup_error() {
    let points = northward(30, 20.0, |d| if d > 200.0 { (d - 200.0) * 0.30 } else { 0.0 });
    match simulate(&points, &RideParams::default()) {
        Err(RideError::TargetUnsolvable {
            segment, power_w, ..
        }) => {
            assert!(segment > 10);
            assert!(power_w > PolicyParams::default().uphill_power_cap_w);
        }
        other => panic!("expected an unsolvable target, got {:?}", other.map(|r| r.len())),
    }
}

#[test]
fn test_raising_the_power_cap_makes_the_climb_rideable() {
    let points = northward(30, 20.0, |d| if d > 200.0 { (d - 200.0) * 0.30 } else { 0.0 });
    let mut params = RideParams::default();
    params.policy.uphill_power_cap_w = 700.0;
    let route = simulate(&points, &params).unwrap();
    let climb = &route.segments[20];
    assert_eq!(climb.target_velocity, params.policy.min_pedal_speed_mps);
    assert!(climb.target_power > 350.0);
}

#[test]
fn test_degenerate_track_is_rejected() {
    let p = TrackPoint::new(45.0, 6.0, 100.0);
    let err = simulate(&[p, p], &RideParams::default()).unwrap_err();
    assert!(matches!(err, RideError::DegenerateRoute { usable: 1 }));
}

#[test]
fn test_filtered_noisy_climb() {
    let noisy = |d: f64| 200.0 + 0.03 * d + 0.5 * (d / 20.0 * 1.3).sin();
    let points = northward(200, 20.0, noisy);
    let params = RideParams {
        filter: FilterConfig {
            interpolation_distance_m: 100.0,
            backstep: 3,
            smoothing_weight: 1.0,
            level_factor: 0.5,
            level_min_m: 0.2,
            max_grade: 0.12,
            ..FilterConfig::default()
        },
        ..RideParams::default()
    };
    let route = simulate(&points, &params).unwrap();
    let stats = &route.stats.filter;
    assert!(stats.smoothed_points > 0);
    assert!(!stats.gradient_residue);

    // Grade changes between neighbours shrink once filtered.
    let roughness = |elevations: Vec<f64>| -> f64 {
        let grades: Vec<f64> = elevations
            .windows(2)
            .zip(route.segments.iter().skip(1))
            .map(|(w, s)| (w[1] - w[0]) / s.horizontal_distance)
            .collect();
        grades.windows(2).map(|g| (g[1] - g[0]).powi(2)).sum()
    };
    let raw = roughness(route.segments.iter().map(|s| s.original_elevation).collect());
    let filtered = roughness(route.elevations());
    assert!(filtered < 0.25 * raw, "raw {} filtered {}", raw, filtered);

    // Endpoints never move.
    let first = &route.segments[0];
    let last = route.segments.last().unwrap();
    assert_eq!(first.elevation, first.original_elevation);
    assert_eq!(last.elevation, last.original_elevation);

    let summary = RideSummary::from_route(&route);
    assert!(summary.max_energy_residual < 1e-5);
    assert!((summary.elevation_gain_m - summary.elevation_loss_m - 0.03 * 3980.0).abs() < 2.0);
}

#[test]
fn test_filter_order_is_configurable() {
    let points = northward(60, 25.0, |d| 100.0 + 1.0 * (d / 25.0 * 2.1).sin());
    let base = FilterConfig {
        smoothing_weight: 0.8,
        level_factor: 0.5,
        level_min_m: 0.1,
        ..FilterConfig::default()
    };
    let mut level_first = base.clone();
    level_first.order = vec![FilterStage::Level, FilterStage::Smooth];
    let mut smooth_first = base;
    smooth_first.order = vec![FilterStage::Smooth, FilterStage::Level];

    let run = |filter: FilterConfig| {
        let params = RideParams {
            filter,
            ..RideParams::default()
        };
        simulate(&points, &params).unwrap()
    };
    let a = run(level_first);
    let b = run(smooth_first);
    assert!(a.stats.filter.leveled_points > 0);
    assert_ne!(a.elevations(), b.elevations());
}
