//! Bootstrap and jackknife confidence intervals for an arbitrary statistic.
//!
//! The statistic is any `Fn(&[T]) -> f64`; extra arguments are captured by the
//! closure. NaN statistics are tolerated on individual resamples and filtered
//! before quantiles are taken.

use anyhow::{anyhow, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::special::{normal_cdf, normal_ppf, quantile_sorted, sorted_finite};

/// Default number of bootstrap iterations.
pub const DEFAULT_ITERATIONS: usize = 200;

/// |z0| cap used by BCa when every (or no) bootstrap value falls below the
/// sample statistic.
const Z0_CLAMP: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiType {
    Basic,
    Percentile,
    /// Bias-corrected, acceleration fixed at 0.
    Bc,
    /// Bias-corrected and accelerated; needs the jackknife.
    Bca,
}

impl CiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiType::Basic => "basic",
            CiType::Percentile => "percentile",
            CiType::Bc => "bc",
            CiType::Bca => "bca",
        }
    }

    pub fn needs_jackknife(&self) -> bool {
        matches!(self, CiType::Bca)
    }
}

impl FromStr for CiType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(CiType::Basic),
            "percentile" => Ok(CiType::Percentile),
            "bc" => Ok(CiType::Bc),
            "bca" => Ok(CiType::Bca),
            other => Err(anyhow!(
                "unknown CI type \"{}\" (expected basic, percentile, bc or bca)",
                other
            )),
        }
    }
}

pub struct Bootstrap<F> {
    stat: F,
    ci_type: CiType,
    n: usize,
    rng: StdRng,
    sample_stat: f64,
    bootstrap_stats: Vec<f64>,
    jack_stats: Vec<f64>,
}

impl<F> Bootstrap<F> {
    pub fn new(stat: F, ci_type: CiType, n: usize) -> Self {
        Self {
            stat,
            ci_type,
            n,
            rng: StdRng::from_entropy(),
            sample_stat: f64::NAN,
            bootstrap_stats: Vec::new(),
            jack_stats: Vec::new(),
        }
    }

    /// Deterministic resampling for a given seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Seeds from the option when present, otherwise keeps entropy seeding.
    pub fn with_optional_seed(self, seed: Option<u64>) -> Self {
        match seed {
            Some(s) => self.with_seed(s),
            None => self,
        }
    }

    pub fn ci_type(&self) -> CiType {
        self.ci_type
    }

    pub fn sample_stat(&self) -> f64 {
        self.sample_stat
    }

    pub fn bootstrap_stats(&self) -> &[f64] {
        &self.bootstrap_stats
    }

    pub fn jack_stats(&self) -> &[f64] {
        &self.jack_stats
    }

    /// Resample uniformly with replacement.
    pub fn fit<T: Clone>(&mut self, data: &[T])
    where
        F: Fn(&[T]) -> f64,
    {
        self.sample_stat = (self.stat)(data);
        self.bootstrap_stats.clear();

        let len = data.len();
        let mut resample: Vec<T> = Vec::with_capacity(len);
        for _ in 0..self.n {
            resample.clear();
            for _ in 0..len {
                resample.push(data[self.rng.gen_range(0..len)].clone());
            }
            self.bootstrap_stats.push((self.stat)(&resample));
        }

        self.jackknife(data);
    }

    /// Resample with per-element inclusion probabilities `p` (need not sum
    /// to 1). `None` is the same as [`Bootstrap::fit`].
    pub fn fit_with_probability<T: Clone>(&mut self, data: &[T], p: Option<&[f64]>) -> Result<()>
    where
        F: Fn(&[T]) -> f64,
    {
        let Some(p) = p else {
            self.fit(data);
            return Ok(());
        };
        if p.len() != data.len() {
            return Err(anyhow!(
                "probability vector has {} entries for {} data points",
                p.len(),
                data.len()
            ));
        }
        let dist = WeightedIndex::new(p).map_err(|e| anyhow!("invalid resampling probabilities: {}", e))?;

        self.sample_stat = (self.stat)(data);
        self.bootstrap_stats.clear();

        let len = data.len();
        let mut resample: Vec<T> = Vec::with_capacity(len);
        for _ in 0..self.n {
            resample.clear();
            for _ in 0..len {
                resample.push(data[dist.sample(&mut self.rng)].clone());
            }
            self.bootstrap_stats.push((self.stat)(&resample));
        }

        self.jackknife(data);
        Ok(())
    }

    fn jackknife<T: Clone>(&mut self, data: &[T])
    where
        F: Fn(&[T]) -> f64,
    {
        self.jack_stats.clear();
        if !self.ci_type.needs_jackknife() {
            return;
        }
        let mut held_out: Vec<T> = Vec::with_capacity(data.len().saturating_sub(1));
        for i in 0..data.len() {
            held_out.clear();
            held_out.extend_from_slice(&data[..i]);
            held_out.extend_from_slice(&data[i + 1..]);
            self.jack_stats.push((self.stat)(&held_out));
        }
    }

    /// The 100·(1 − alpha)% interval. `(NaN, NaN)` when no bootstrap
    /// statistic is finite.
    pub fn get_ci(&self, alpha: f64) -> (f64, f64) {
        let arr = sorted_finite(&self.bootstrap_stats);
        if arr.is_empty() {
            return (f64::NAN, f64::NAN);
        }

        match self.ci_type {
            CiType::Basic => {
                let lower = 2.0 * self.sample_stat - quantile_sorted(&arr, 1.0 - alpha / 2.0);
                let upper = 2.0 * self.sample_stat - quantile_sorted(&arr, alpha / 2.0);
                (lower, upper)
            }
            CiType::Percentile => (
                quantile_sorted(&arr, alpha / 2.0),
                quantile_sorted(&arr, 1.0 - alpha / 2.0),
            ),
            CiType::Bc => {
                let z0 = self.bias_correction(&arr);
                let (ql, qu) = (normal_ppf(alpha / 2.0), normal_ppf(1.0 - alpha / 2.0));
                let a1 = normal_cdf(2.0 * z0 + ql);
                let a2 = normal_cdf(2.0 * z0 + qu);
                (quantile_sorted(&arr, a1), quantile_sorted(&arr, a2))
            }
            CiType::Bca => {
                let mut z0 = self.bias_correction(&arr);
                if z0.is_infinite() {
                    z0 = z0.signum() * Z0_CLAMP;
                }
                let a_hat = self.acceleration();
                let (ql, qu) = (normal_ppf(alpha / 2.0), normal_ppf(1.0 - alpha / 2.0));
                let a1 = normal_cdf(z0 + (z0 + ql) / (1.0 - a_hat * (z0 + ql)));
                let a2 = normal_cdf(z0 + (z0 + qu) / (1.0 - a_hat * (z0 + qu)));
                (quantile_sorted(&arr, a1), quantile_sorted(&arr, a2))
            }
        }
    }

    /// z0 = Φ⁻¹(fraction of bootstrap values below the sample statistic).
    fn bias_correction(&self, arr: &[f64]) -> f64 {
        let below = arr.iter().filter(|&&v| v < self.sample_stat).count();
        normal_ppf(below as f64 / arr.len() as f64)
    }

    fn acceleration(&self) -> f64 {
        let jack: Vec<f64> = self.jack_stats.iter().copied().filter(|v| v.is_finite()).collect();
        if jack.is_empty() {
            return 0.0;
        }
        let m = jack.iter().sum::<f64>() / jack.len() as f64;
        let num: f64 = jack.iter().map(|j| (m - j).powi(3)).sum();
        let den = 6.0 * jack.iter().map(|j| (m - j).powi(2)).sum::<f64>().powf(1.5);
        if den == 0.0 {
            0.0
        } else {
            num / den
        }
    }
}

/// Iteration count, interval level and seed shared by every bootstrap the
/// monitor runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapSettings {
    pub iterations: usize,
    pub alpha: f64,
    pub seed: Option<u64>,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            alpha: 0.05,
            seed: None,
        }
    }
}

impl BootstrapSettings {
    /// Distinct but reproducible seed for the `stream`-th bootstrap of a run.
    pub fn seed_for(&self, stream: u64) -> Option<u64> {
        self.seed.map(|s| s.wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }
}
