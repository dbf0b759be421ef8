//! Grade filter pipeline: optional elevation-smoothing sub-passes run in a
//! configurable order. Route endpoints never move. A threshold of zero (or
//! below) disables its sub-pass.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::route::Route;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Interpolate,
    Backstep,
    Smooth,
    Level,
    ReduceGradient,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    pub interpolation_distance_m: f64,
    /// Bump grade above which a distance window is flattened.
    pub interpolation_grade: f64,
    /// Segments to step back after an interpolation; 0 disables the pass.
    pub backstep: usize,
    pub backstep_rounds: usize,
    pub backstep_start_grade: f64,
    pub backstep_min_grade: f64,
    pub backstep_decay: f64,
    pub max_interpolations_per_point: usize,
    pub smoothing_weight: f64,
    pub level_factor: f64,
    pub level_min_m: f64,
    pub level_max_m: f64,
    pub max_grade: f64,
    pub order: Vec<FilterStage>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            interpolation_distance_m: 0.0,
            interpolation_grade: 0.01,
            backstep: 0,
            backstep_rounds: 4,
            backstep_start_grade: 0.08,
            backstep_min_grade: 0.02,
            backstep_decay: 0.5,
            max_interpolations_per_point: 8,
            smoothing_weight: 0.0,
            level_factor: 0.0,
            level_min_m: 0.5,
            level_max_m: 5.0,
            max_grade: 0.0,
            order: vec![
                FilterStage::Interpolate,
                FilterStage::Backstep,
                FilterStage::Smooth,
                FilterStage::Level,
                FilterStage::ReduceGradient,
            ],
        }
    }
}

impl FilterConfig {
    /// All sub-passes disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(&self, stage: FilterStage) -> bool {
        match stage {
            FilterStage::Interpolate => {
                self.interpolation_distance_m > 0.0 && self.interpolation_grade > 0.0
            }
            FilterStage::Backstep => self.backstep > 0 && self.backstep_rounds > 0,
            FilterStage::Smooth => self.smoothing_weight > 0.0,
            FilterStage::Level => self.level_factor > 0.0,
            FilterStage::ReduceGradient => self.max_grade > 0.0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterStats {
    pub interpolated_windows: usize,
    pub backstep_interpolations: usize,
    pub backstep_rounds: usize,
    pub smoothed_points: usize,
    pub leveled_points: usize,
    pub reduced_runs: usize,
    /// A steep run reached the end of the route and was left as is.
    pub gradient_residue: bool,
}

/// Elevations and horizontal distances indexed like `Route::segments`.
struct Profile {
    elevation: Vec<f64>,
    distance: Vec<f64>,
}

impl Profile {
    fn from_route(route: &Route) -> Self {
        Self {
            elevation: route.segments.iter().map(|s| s.elevation).collect(),
            distance: route
                .segments
                .iter()
                .map(|s| s.horizontal_distance)
                .collect(),
        }
    }

    fn last(&self) -> usize {
        self.elevation.len().saturating_sub(1)
    }

    fn grade(&self, i: usize) -> f64 {
        let d = self.distance[i];
        if d > 0.0 {
            (self.elevation[i] - self.elevation[i - 1]) / d
        } else {
            0.0
        }
    }

    /// Put point `i` on the line between its neighbours.
    fn interpolate_point(&mut self, i: usize) {
        let before = self.distance[i];
        let span = before + self.distance[i + 1];
        if span <= 0.0 {
            return;
        }
        let (a, b) = (self.elevation[i - 1], self.elevation[i + 1]);
        self.elevation[i] = a + (b - a) * before / span;
    }

    /// Replace the interior points of `start..=end` with a straight line.
    fn interpolate_range(&mut self, start: usize, end: usize) {
        let span: f64 = self.distance[start + 1..=end].iter().sum();
        if span <= 0.0 {
            return;
        }
        let (a, b) = (self.elevation[start], self.elevation[end]);
        let mut along = 0.0;
        for k in start + 1..end {
            along += self.distance[k];
            self.elevation[k] = a + (b - a) * along / span;
        }
    }

    fn interpolate_by_distance(&mut self, window: f64, bump_grade: f64) -> usize {
        let n = self.last();
        let mut flattened = 0;
        let mut s = 0;
        while s < n {
            let mut j = s;
            let mut covered = 0.0;
            while j < n && covered < window {
                j += 1;
                covered += self.distance[j];
            }
            if covered > 1.5 * window && j > s + 1 {
                covered -= self.distance[j];
                j -= 1;
            }
            if j - s < 2 {
                s = j;
                continue;
            }

            let climb: f64 = (s + 1..=j)
                .map(|k| (self.elevation[k] - self.elevation[k - 1]).max(0.0))
                .sum();
            let rise = (self.elevation[j] - self.elevation[s]).max(0.0);
            if climb - rise > covered * bump_grade {
                self.interpolate_range(s, j);
                flattened += 1;
                s = j;
            } else {
                let slide = covered * 2.0 / 3.0;
                let mut next = s;
                let mut advanced = 0.0;
                while next < j && advanced < slide {
                    next += 1;
                    advanced += self.distance[next];
                }
                s = next.max(s + 1);
            }
        }
        flattened
    }

    fn backstep(&mut self, config: &FilterConfig) -> (usize, usize) {
        let n = self.last();
        let mut counts = vec![0usize; n + 1];
        let mut total = 0;
        let mut rounds = 0;
        for round in 0..config.backstep_rounds {
            let threshold = (config.backstep_start_grade * config.backstep_decay.powi(round as i32))
                .max(config.backstep_min_grade);
            let mut hits = 0;
            let mut i = 1;
            while i < n {
                let delta = (self.grade(i + 1) - self.grade(i)).abs();
                if delta > threshold && counts[i] < config.max_interpolations_per_point {
                    self.interpolate_point(i);
                    counts[i] += 1;
                    hits += 1;
                    i = i.saturating_sub(config.backstep).max(1);
                } else {
                    i += 1;
                }
            }
            rounds += 1;
            total += hits;
            // A quiet round only ends the pass once the threshold stops falling.
            let at_floor =
                threshold <= config.backstep_min_grade || config.backstep_decay >= 1.0;
            if hits == 0 && at_floor {
                break;
            }
        }
        (total, rounds)
    }

    fn smooth(&mut self, weight: f64, reference_distance: f64) -> usize {
        let n = self.last();
        if n < 2 || reference_distance <= 0.0 {
            return 0;
        }
        let factor = |d: f64| {
            if d > 0.0 {
                (weight * reference_distance / d).min(1.0)
            } else {
                0.0
            }
        };
        for i in (1..n).rev() {
            let k = factor(self.distance[i + 1]);
            self.elevation[i] = (self.elevation[i] + k * self.elevation[i + 1]) / (1.0 + k);
        }
        for i in 1..n {
            let k = factor(self.distance[i]);
            self.elevation[i] = (self.elevation[i] + k * self.elevation[i - 1]) / (1.0 + k);
        }
        n - 1
    }

    fn level(&mut self, factor: f64, min_excess: f64, max_correction: f64) -> usize {
        let n = self.last();
        let mut leveled = 0;
        for i in 1..n {
            let (g0, g1) = (self.grade(i), self.grade(i + 1));
            let (a, b) = (self.elevation[i - 1], self.elevation[i + 1]);
            if g0 > 0.0 && g1 < 0.0 {
                let excess = self.elevation[i] - a.max(b);
                if excess > min_excess {
                    self.elevation[i] -= (excess * factor).min(max_correction);
                    leveled += 1;
                }
            } else if g0 < 0.0 && g1 > 0.0 {
                let excess = a.min(b) - self.elevation[i];
                if excess > min_excess {
                    self.elevation[i] += (excess * factor).min(max_correction);
                    leveled += 1;
                }
            }
        }
        leveled
    }

    fn reduce_gradient(&mut self, max_grade: f64) -> (usize, bool) {
        let n = self.last();
        let mut runs = 0;
        let mut i = 1;
        while i <= n {
            if self.grade(i).abs() <= max_grade {
                i += 1;
                continue;
            }
            let start = i - 1;
            let mut j = i;
            let mut span = self.distance[i];
            loop {
                let chord = if span > 0.0 {
                    (self.elevation[j] - self.elevation[start]) / span
                } else {
                    0.0
                };
                if chord.abs() <= max_grade {
                    self.interpolate_range(start, j);
                    runs += 1;
                    break;
                }
                if j == n {
                    return (runs, true);
                }
                j += 1;
                span += self.distance[j];
            }
            i = j + 1;
        }
        (runs, false)
    }
}

/// Run every enabled sub-pass in configured order, then re-derive grade and
/// true distance from the working elevations.
pub fn apply_filters(route: &mut Route, config: &FilterConfig) -> FilterStats {
    let mut stats = FilterStats::default();
    if route.len() < 2 || !config.order.iter().any(|&s| config.enabled(s)) {
        route.stats.filter = stats.clone();
        return stats;
    }

    let mut profile = Profile::from_route(route);
    for &stage in &config.order {
        if !config.enabled(stage) {
            continue;
        }
        match stage {
            FilterStage::Interpolate => {
                stats.interpolated_windows += profile.interpolate_by_distance(
                    config.interpolation_distance_m,
                    config.interpolation_grade,
                );
            }
            FilterStage::Backstep => {
                let (interpolations, rounds) = profile.backstep(config);
                stats.backstep_interpolations += interpolations;
                stats.backstep_rounds += rounds;
            }
            FilterStage::Smooth => {
                let reference = if route.stats.median_distance > 0.0 {
                    route.stats.median_distance
                } else {
                    route.stats.mean_distance
                };
                stats.smoothed_points += profile.smooth(config.smoothing_weight, reference);
            }
            FilterStage::Level => {
                stats.leveled_points +=
                    profile.level(config.level_factor, config.level_min_m, config.level_max_m);
            }
            FilterStage::ReduceGradient => {
                let (runs, residue) = profile.reduce_gradient(config.max_grade);
                stats.reduced_runs += runs;
                stats.gradient_residue |= residue;
            }
        }
    }

    for (seg, &elevation) in route.segments.iter_mut().zip(&profile.elevation) {
        seg.elevation = elevation;
    }
    route.recompute_geometry();
    debug!(?stats, "grade filters applied");
    route.stats.filter = stats.clone();
    stats
}
