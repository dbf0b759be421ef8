//! Ride configuration. Every block deserializes with defaults so a JSON file
//! only needs the fields it overrides. "Not given" is `None`, never a sentinel
//! number, and grades are always fractions (0.05 == 5 %).

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::filter::FilterConfig;
use crate::route::WindSetup;
use crate::RideError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Samples closer than this to the previous accepted one are rejected.
    pub min_distance_m: f64,
    pub derive_turn_radius: bool,
    /// Radii above this are treated as straight road.
    pub max_turn_radius_m: f64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 1.0,
            derive_turn_radius: false,
            max_turn_radius_m: 500.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhysicsParams {
    /// Rider plus bike.
    pub mass_kg: f64,
    pub cda_m2: f64,
    pub crr: f64,
    pub air_density: f64,
    pub brake_decel_mps2: f64,
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self {
            mass_kg: 90.0,
            cda_m2: 0.35,
            crr: 0.005,
            air_density: 1.225,
            brake_decel_mps2: 3.0,
        }
    }
}

/// Calibration of the power-ratio oracle. Thresholds are magnitudes; the
/// ratio is reached at the threshold and held beyond it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RatioParams {
    pub uphill_grade: f64,
    pub uphill_ratio: f64,
    pub downhill_grade: f64,
    pub downhill_ratio: f64,
    pub headwind_mps: f64,
    pub headwind_ratio: f64,
    pub tailwind_mps: f64,
    pub tailwind_ratio: f64,
}

impl Default for RatioParams {
    fn default() -> Self {
        Self {
            uphill_grade: 0.08,
            uphill_ratio: 1.5,
            downhill_grade: 0.05,
            downhill_ratio: 0.2,
            headwind_mps: 8.0,
            headwind_ratio: 1.15,
            tailwind_mps: 8.0,
            tailwind_ratio: 0.9,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyParams {
    pub flat_power_w: f64,
    pub uphill_power_cap_w: f64,
    pub min_pedal_speed_mps: f64,
    pub max_pedal_speed_mps: f64,
    /// Grade below which coasting is considered. `None` derives it from the
    /// motion model as the grade that freewheels at the max pedalled speed.
    pub coast_grade: Option<f64>,
    /// Coast-threshold shift per m/s of head wind.
    pub coast_wind_factor: f64,
    pub braking_distance_m: Option<f64>,
    pub steep_downhill_grade: f64,
    /// Vertical descent-rate ceiling, used when no braking distance is set.
    pub max_descent_rate_mps: Option<f64>,
    pub lateral_accel_mps2: f64,
    pub entry_speed_limit: bool,
    pub min_limited_speed_mps: f64,
    pub max_speed_mps: f64,
    /// A target this close below the ceiling pulls the ceiling down onto it.
    pub ceiling_slack_mps: f64,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            flat_power_w: 180.0,
            uphill_power_cap_w: 350.0,
            min_pedal_speed_mps: 2.0,
            max_pedal_speed_mps: 14.0,
            coast_grade: Some(-0.03),
            coast_wind_factor: 0.002,
            braking_distance_m: Some(40.0),
            steep_downhill_grade: 0.10,
            max_descent_rate_mps: Some(2.0),
            lateral_accel_mps2: 2.5,
            entry_speed_limit: true,
            min_limited_speed_mps: 3.0,
            max_speed_mps: 25.0,
            ceiling_slack_mps: 0.3,
        }
    }
}

/// Numeric stepping scheme, fixed for a whole ride.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    #[default]
    Velocity,
    Distance,
    Time,
}

impl StepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepMode::Velocity => "velocity",
            StepMode::Distance => "distance",
            StepMode::Time => "time",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegratorParams {
    pub mode: StepMode,
    pub velocity_step_mps: f64,
    pub time_step_s: f64,
    pub velocity_tolerance_mps: f64,
    pub accel_power_factor: f64,
    pub accel_power_min_w: f64,
    pub accel_power_max_w: f64,
    pub decel_power_factor: f64,
    pub brake_single_step: bool,
    pub brake_single_step_max_dv: f64,
    pub start_velocity_mps: Option<f64>,
    pub max_steps_per_phase: u64,
}

impl Default for IntegratorParams {
    fn default() -> Self {
        Self {
            mode: StepMode::Velocity,
            velocity_step_mps: 0.05,
            time_step_s: 0.5,
            velocity_tolerance_mps: 1e-4,
            accel_power_factor: 1.5,
            accel_power_min_w: 60.0,
            accel_power_max_w: 600.0,
            decel_power_factor: 0.5,
            brake_single_step: true,
            brake_single_step_max_dv: 1.0,
            start_velocity_mps: None,
            max_steps_per_phase: 200_000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RideParams {
    pub segmenter: SegmenterConfig,
    pub filter: FilterConfig,
    pub wind: WindSetup,
    pub physics: PhysicsParams,
    pub ratio: RatioParams,
    pub policy: PolicyParams,
    pub integrator: IntegratorParams,
}

fn require(ok: bool, what: &str) -> Result<(), RideError> {
    if ok {
        Ok(())
    } else {
        Err(RideError::InvalidParameter(what.to_string()))
    }
}

impl RideParams {
    /// Range-check every block. Filter thresholds of zero or below are not
    /// errors; they disable the sub-pass.
    pub fn validate(&self) -> Result<(), RideError> {
        let s = &self.segmenter;
        require(s.min_distance_m >= 0.0, "segmenter.min_distance_m must be >= 0")?;
        require(s.max_turn_radius_m > 0.0, "segmenter.max_turn_radius_m must be > 0")?;

        let f = &self.filter;
        require(
            f.backstep_decay > 0.0 && f.backstep_decay <= 1.0,
            "filter.backstep_decay must be in (0, 1]",
        )?;
        require(f.backstep_min_grade >= 0.0, "filter.backstep_min_grade must be >= 0")?;
        require(f.level_factor <= 1.0, "filter.level_factor must be <= 1")?;
        require(f.level_max_m >= 0.0, "filter.level_max_m must be >= 0")?;

        require(self.wind.speed_mps >= 0.0, "wind.speed_mps must be >= 0")?;

        let ph = &self.physics;
        require(ph.mass_kg > 0.0, "physics.mass_kg must be > 0")?;
        require(ph.cda_m2 >= 0.0, "physics.cda_m2 must be >= 0")?;
        require(ph.crr >= 0.0, "physics.crr must be >= 0")?;
        require(ph.air_density > 0.0, "physics.air_density must be > 0")?;
        require(ph.brake_decel_mps2 > 0.0, "physics.brake_decel_mps2 must be > 0")?;

        let r = &self.ratio;
        require(
            r.uphill_ratio >= 0.0
                && r.downhill_ratio >= 0.0
                && r.headwind_ratio >= 0.0
                && r.tailwind_ratio >= 0.0,
            "ratio multipliers must be >= 0",
        )?;

        let p = &self.policy;
        require(p.flat_power_w > 0.0, "policy.flat_power_w must be > 0")?;
        require(
            p.uphill_power_cap_w >= p.flat_power_w,
            "policy.uphill_power_cap_w must be >= flat_power_w",
        )?;
        require(p.min_pedal_speed_mps > 0.0, "policy.min_pedal_speed_mps must be > 0")?;
        require(
            p.max_pedal_speed_mps > p.min_pedal_speed_mps,
            "policy.max_pedal_speed_mps must exceed min_pedal_speed_mps",
        )?;
        if let Some(grade) = p.coast_grade {
            require(grade < 0.0, "policy.coast_grade must be negative")?;
        }
        if let Some(d) = p.braking_distance_m {
            require(d > 0.0, "policy.braking_distance_m must be > 0 when given")?;
        }
        if let Some(rate) = p.max_descent_rate_mps {
            require(rate > 0.0, "policy.max_descent_rate_mps must be > 0 when given")?;
        }
        require(p.steep_downhill_grade > 0.0, "policy.steep_downhill_grade must be > 0")?;
        require(p.lateral_accel_mps2 > 0.0, "policy.lateral_accel_mps2 must be > 0")?;
        require(p.min_limited_speed_mps > 0.0, "policy.min_limited_speed_mps must be > 0")?;
        require(
            p.max_speed_mps > p.min_limited_speed_mps,
            "policy.max_speed_mps must exceed min_limited_speed_mps",
        )?;
        require(p.ceiling_slack_mps >= 0.0, "policy.ceiling_slack_mps must be >= 0")?;

        let i = &self.integrator;
        require(i.velocity_step_mps > 0.0, "integrator.velocity_step_mps must be > 0")?;
        require(i.time_step_s > 0.0, "integrator.time_step_s must be > 0")?;
        require(
            i.velocity_tolerance_mps > 0.0,
            "integrator.velocity_tolerance_mps must be > 0",
        )?;
        require(
            i.accel_power_factor > 1.0,
            "integrator.accel_power_factor must be > 1",
        )?;
        require(
            i.accel_power_max_w >= i.accel_power_min_w && i.accel_power_min_w >= 0.0,
            "integrator accel power bounds are inverted",
        )?;
        require(
            (0.0..1.0).contains(&i.decel_power_factor),
            "integrator.decel_power_factor must be in [0, 1)",
        )?;
        require(
            i.brake_single_step_max_dv > 0.0,
            "integrator.brake_single_step_max_dv must be > 0",
        )?;
        if let Some(v) = i.start_velocity_mps {
            require(v >= 0.0, "integrator.start_velocity_mps must be >= 0")?;
        }
        require(i.max_steps_per_phase > 0, "integrator.max_steps_per_phase must be > 0")?;
        Ok(())
    }

    /// SHA-256 of the canonical JSON form, identifying a ride configuration.
    pub fn fingerprint(&self) -> Result<String, RideError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| RideError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
