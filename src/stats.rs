//! Per-target execution statistics and the remaining-time predictor.
//!
//! Durations are recorded in calibration units: raw seconds divided by the
//! worker's one-time benchmark time ([`calibrate`]), so a fast and a slow
//! host describing the same target produce comparable numbers.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Floor for predicted remaining time; keeps loads strictly positive for
/// tasks running past their mean.
pub const MIN_REMAINING: f64 = 1e-6;

/// Mean and std-dev assumed for a target that has never been observed.
const UNKNOWN_PRIOR: (f64, f64) = (1.0, 1.0);

/// Running statistics for one distinct target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetStats {
    /// Mean execution time, in calibration units.
    pub mean: f64,
    pub std_dev: f64,
    /// Running sum of squared times, kept so the std-dev updates in O(1).
    pub sum_sq: f64,
    pub samples: u64,
    /// Whether an instance of this target has ever spawned children.
    /// Batched fan-out is only applied to targets that never do.
    pub spawns_children: bool,
}

impl TargetStats {
    fn first(time: f64, spawned: bool) -> Self {
        Self {
            mean: time,
            std_dev: 0.0,
            sum_sq: time * time,
            samples: 1,
            spawns_children: spawned,
        }
    }

    fn observe(&mut self, time: f64, spawned: bool) {
        let count = self.samples as f64;
        let mean = (time + self.mean * count) / (count + 1.0);
        let sum_sq = self.sum_sq + time * time;
        self.mean = mean;
        self.std_dev = (sum_sq / (count + 1.0) - mean * mean).abs().sqrt();
        self.sum_sq = sum_sq;
        self.samples += 1;
        self.spawns_children = self.spawns_children || spawned;
    }
}

/// Shared table of [`TargetStats`], keyed by target name.
///
/// Updated by execution threads after every completed run and merged with the
/// snapshots piggybacked on every inbound envelope.
#[derive(Debug, Default)]
pub struct StatsTable {
    inner: Mutex<HashMap<String, TargetStats>>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, target: &str, time: f64, spawned: bool) {
        let mut table = self.inner.lock();
        match table.get_mut(target) {
            Some(stats) => stats.observe(time, spawned),
            None => {
                table.insert(target.to_string(), TargetStats::first(time, spawned));
            }
        }
    }

    /// Merge a remote snapshot: per key, the record backed by more samples
    /// wins outright.
    pub fn merge(&self, remote: &HashMap<String, TargetStats>) {
        let mut table = self.inner.lock();
        for (key, theirs) in remote {
            match table.get(key) {
                Some(ours) if ours.samples >= theirs.samples => {}
                _ => {
                    table.insert(key.clone(), *theirs);
                }
            }
        }
    }

    pub fn snapshot(&self) -> HashMap<String, TargetStats> {
        self.inner.lock().clone()
    }

    pub fn get(&self, target: &str) -> Option<TargetStats> {
        self.inner.lock().get(target).copied()
    }

    /// Predicted remaining time of a task instance of `target` that has
    /// already run for `done` calibration units.
    pub fn predict(&self, target: &str, done: f64) -> f64 {
        let (mean, std_dev) = match self.get(target) {
            Some(stats) => (stats.mean, stats.std_dev),
            None => UNKNOWN_PRIOR,
        };
        remaining(mean, std_dev, done)
    }

    /// True when `target` has enough history to trust its mean for batching.
    pub fn batching_profile(&self, target: &str) -> Option<TargetStats> {
        self.get(target).filter(|s| s.samples >= 4)
    }
}

/// Expected remaining execution time for a task with historical `(mean,
/// std_dev)` that has already consumed `done` units.
///
/// Models the duration as a normal distribution truncated below `done` and
/// returns the mean of the tail, minus `done`. With no elapsed time there is
/// no information to condition on, so the answer is the plain mean; with no
/// variance the distribution is a point mass at `mean`.
pub fn remaining(mean: f64, std_dev: f64, done: f64) -> f64 {
    if done == 0.0 {
        return mean;
    }
    if std_dev == 0.0 {
        return (mean - done).max(MIN_REMAINING);
    }

    let sqrt2 = std::f64::consts::SQRT_2;
    let sqrt_pi = std::f64::consts::PI.sqrt();

    // Antiderivatives of x·N(x) and N(x) evaluated at `done`...
    let common = erf(sqrt2 * (done - mean) / (std_dev * 2.0));
    let area_done = 0.5 * common;
    let mass_done = (sqrt2 / (4.0 * sqrt_pi))
        * (-2.0 * std_dev * (-0.5 * (done - mean) * (done - mean) / (std_dev * std_dev)).exp()
            + mean * sqrt_pi * sqrt2 * common);

    // ...and at +infinity, where erf is 1 and the exponential vanishes.
    let area_inf = 0.5;
    let mass_inf = mean / 2.0;

    let tail = area_inf - area_done;
    let prevision = if tail <= 0.0 {
        // The instance is already far beyond anything the history predicts;
        // the tail mass underflowed to zero.
        done + 0.5
    } else {
        (mass_inf - mass_done) / tail
    };

    (prevision - done).max(MIN_REMAINING)
}

/// Gaussian error function, Abramowitz & Stegun formula 7.1.26.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

/// One-time local benchmark whose median runtime becomes this worker's
/// reference time. A mix of arithmetic, string building and serialization
/// round trips stands in for a typical target.
pub fn calibrate() -> f64 {
    const RUNS: usize = 3;
    let mut rng = Pcg64Mcg::seed_from_u64(0x00C0_10BF);
    let mut times = Vec::with_capacity(RUNS);

    for _ in 0..RUNS {
        let start = Instant::now();

        let mut acc = 0.0f64;
        for i in 0..10_000u32 {
            acc += (rng.gen::<f64>() / (rng.gen_range(0.0..f64::from(i) + 1.0) + 1.0)).sqrt();
        }

        let mut text = String::new();
        for _ in 0..5_000 {
            text.push_str(&rng.gen_range(0..9_999u32).to_string());
        }

        for _ in 0..500 {
            let bytes = rmp_serde::to_vec(&text).unwrap_or_default();
            text = rmp_serde::from_slice(&bytes).unwrap_or_default();
        }

        // keep the arithmetic loop from being optimized out
        std::hint::black_box(acc);
        times.push(start.elapsed().as_secs_f64());
    }

    times.sort_by(f64::total_cmp);
    times[RUNS / 2].max(f64::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_untouched_task_is_mean() {
        assert_eq!(remaining(3.0, 4.0, 0.0), 3.0);
        assert_eq!(remaining(7.5, 0.0, 0.0), 7.5);
    }

    #[test]
    fn test_remaining_zero_stddev_is_clamped_difference() {
        assert_eq!(remaining(5.0, 0.0, 2.0), 3.0);
        assert_eq!(remaining(5.0, 0.0, 9.0), MIN_REMAINING);
    }

    #[test]
    fn test_remaining_matches_truncated_normal() {
        // (mean, std_dev) = (3, 4) at 3 elapsed units: the tail of the
        // gaussian centers near 6.19, about 3.19 units away.
        let r = remaining(3.0, 4.0, 3.0);
        assert!((r - 3.19).abs() < 0.02, "got {r}");
    }

    #[test]
    fn test_remaining_far_past_mean_falls_back() {
        // so deep into the tail that its mass underflows
        let r = remaining(1.0, 0.001, 1000.0);
        assert!((r - 0.5).abs() < 1e-9, "got {r}");
    }

    #[test]
    fn test_remaining_shrinks_as_work_progresses() {
        let early = remaining(10.0, 2.0, 1.0);
        let late = remaining(10.0, 2.0, 8.0);
        assert!(late < early);
    }

    #[test]
    fn test_erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.8427).abs() < 1e-4);
        assert!((erf(-1.0) + 0.8427).abs() < 1e-4);
        assert!((erf(3.0) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_record_running_moments() {
        let table = StatsTable::new();
        table.record("f", 2.0, false);
        table.record("f", 4.0, false);
        let stats = table.get("f").unwrap();
        assert_eq!(stats.samples, 2);
        assert!((stats.mean - 3.0).abs() < 1e-12);
        assert!((stats.std_dev - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_merge_keeps_larger_sample_count() {
        let table = StatsTable::new();
        table.record("f", 2.0, false);

        let mut remote = HashMap::new();
        remote.insert(
            "f".to_string(),
            TargetStats {
                mean: 9.0,
                std_dev: 0.0,
                sum_sq: 81.0,
                samples: 10,
                spawns_children: true,
            },
        );
        remote.insert(
            "g".to_string(),
            TargetStats {
                mean: 1.0,
                std_dev: 0.0,
                sum_sq: 1.0,
                samples: 1,
                spawns_children: false,
            },
        );
        table.merge(&remote);

        assert_eq!(table.get("f").unwrap().samples, 10);
        assert!((table.get("f").unwrap().mean - 9.0).abs() < 1e-12);
        assert_eq!(table.get("g").unwrap().samples, 1);

        // a second merge with fewer samples must not regress
        let mut stale = HashMap::new();
        stale.insert(
            "f".to_string(),
            TargetStats {
                mean: 1.0,
                std_dev: 0.0,
                sum_sq: 1.0,
                samples: 3,
                spawns_children: false,
            },
        );
        table.merge(&stale);
        assert_eq!(table.get("f").unwrap().samples, 10);
    }

    #[test]
    fn test_unknown_target_uses_prior() {
        let table = StatsTable::new();
        assert_eq!(table.predict("nope", 0.0), 1.0);
    }

    #[test]
    fn test_calibrate_is_positive() {
        assert!(calibrate() > 0.0);
    }
}
