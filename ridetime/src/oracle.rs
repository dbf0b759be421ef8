//! Contracts for the physics collaborators consumed by the policy solver and
//! the integrator. Neither pass computes raw forces itself.

/// Road conditions a motion query is evaluated under.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Terrain {
    pub grade: f64,
    /// Along-track wind, positive for head wind.
    pub head_wind: f64,
}

impl Terrain {
    pub fn new(grade: f64, head_wind: f64) -> Self {
        Self { grade, head_wind }
    }
}

/// Direction a stepping primitive is expected to move velocity in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Accelerate,
    Decelerate,
}

impl Direction {
    pub fn toward(from: f64, to: f64) -> Self {
        if to >= from {
            Direction::Accelerate
        } else {
            Direction::Decelerate
        }
    }
}

/// Signed energy over one step, in joules. Mirrors [`crate::EnergyTerms`]
/// without the drag attribution, which the integrator decides.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepEnergy {
    pub rider: f64,
    pub drag: f64,
    pub rolling: f64,
    pub gravity: f64,
    pub kinetic: f64,
    pub braking: f64,
}

impl StepEnergy {
    pub fn scaled(&self, fraction: f64) -> Self {
        Self {
            rider: self.rider * fraction,
            drag: self.drag * fraction,
            rolling: self.rolling * fraction,
            gravity: self.gravity * fraction,
            kinetic: self.kinetic * fraction,
            braking: self.braking * fraction,
        }
    }
}

/// Result of one stepping primitive.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Step {
    pub dv: f64,
    pub ds: f64,
    pub dt: f64,
    pub energy: StepEnergy,
    /// False when the requested power cannot move velocity in the requested
    /// direction; all deltas are zero in that case.
    pub feasible: bool,
}

impl Step {
    pub fn infeasible() -> Self {
        Self::default()
    }

    pub fn scaled(&self, fraction: f64) -> Self {
        Self {
            dv: self.dv * fraction,
            ds: self.ds * fraction,
            dt: self.dt * fraction,
            energy: self.energy.scaled(fraction),
            feasible: self.feasible,
        }
    }
}

/// Physics calculator for a bike and rider.
///
/// Stepping primitives return the deltas of one discretisation step under a
/// constant rider `power`; `braking` adds the brake force. Root-finders return
/// `None` when no physical solution exists.
pub trait MotionModel {
    fn mass(&self) -> f64;

    /// Aerodynamic drag force at ground speed `v`.
    fn drag_force(&self, terrain: &Terrain, v: f64) -> f64;

    /// Force applied by the brakes when braking.
    fn brake_force(&self) -> f64;

    /// Sum of gravity, rolling and drag forces opposing motion at `v`.
    fn resistance(&self, terrain: &Terrain, v: f64) -> f64;

    /// Step by a velocity increment `dv`.
    fn step_velocity(&self, terrain: &Terrain, v: f64, dv: f64, power: f64, braking: bool)
        -> Step;

    /// Step by a distance increment `ds`.
    fn step_distance(
        &self,
        terrain: &Terrain,
        v: f64,
        ds: f64,
        power: f64,
        braking: bool,
        direction: Direction,
    ) -> Step;

    /// Step by a time increment `dt`.
    fn step_time(
        &self,
        terrain: &Terrain,
        v: f64,
        dt: f64,
        power: f64,
        braking: bool,
        direction: Direction,
    ) -> Step;

    /// Steady-state velocity sustained by `power`.
    fn velocity_from_power(&self, terrain: &Terrain, power: f64, guess: Option<f64>)
        -> Option<f64>;

    /// Power needed to hold `v`; negative when the road alone would accelerate.
    fn power_from_velocity(&self, terrain: &Terrain, v: f64) -> f64;

    /// Grade on which `power` holds velocity `v` steady.
    fn grade_from_velocity_power(&self, head_wind: f64, v: f64, power: f64) -> Option<f64>;

    /// Terminal velocity with zero rider power, if the road is steep enough to coast.
    fn freewheel_velocity(&self, terrain: &Terrain) -> Option<f64>;

    /// Velocity from which braking reaches `v_end` within `distance`.
    fn velocity_from_brake_distance(&self, terrain: &Terrain, distance: f64, v_end: f64)
        -> Option<f64>;

    /// Hold `v` over `ds`. Rider power covers any resistance; when the road
    /// alone would accelerate, the brakes absorb the surplus.
    fn hold_velocity(&self, terrain: &Terrain, v: f64, ds: f64) -> Step;

    /// Distance, time and energy of braking from `v_start` down to `v_end`
    /// in one evaluation.
    fn brake(&self, terrain: &Terrain, v_start: f64, v_end: f64) -> Step;
}

/// Maps grade and wind to a multiplier of flat-ground rider power.
pub trait PowerRatio {
    fn ratio(&self, grade: f64, head_wind: f64) -> f64;
}
