//! Bootstrap confidence intervals for sample-based estimates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::AqeConfig;
use crate::error::AqeError;
use crate::sketch::hash64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    /// Sum of the values, multiplied by the scale factor
    Sum,
    /// Number of non-zero values, multiplied by the scale factor
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

impl ConfidenceInterval {
    pub fn point(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
            level: 1.0,
        }
    }

    pub fn half_width(&self) -> f64 {
        (self.upper - self.lower) / 2.0
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootstrapEstimate {
    pub point: f64,
    pub interval: ConfidenceInterval,
    pub relative_error: f64,
    /// Standard deviation of the bootstrap distribution
    pub std_error: f64,
    pub resamples: usize,
}

/// Relative error of an interval around `point`.
///
/// 0 when both are 0; 1.0 when the point is 0 but the interval is not.
pub fn relative_error(point: f64, half_width: f64) -> f64 {
    if point == 0.0 {
        if half_width > 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        half_width / point.abs()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceEstimator {
    resamples: usize,
    level: f64,
    seed: u64,
}

impl ConfidenceEstimator {
    pub fn new(resamples: usize, level: f64, seed: u64) -> Result<Self, AqeError> {
        if resamples == 0 {
            return Err(AqeError::Configuration(
                "bootstrap needs at least one resample".into(),
            ));
        }
        if !(level > 0.0 && level < 1.0) {
            return Err(AqeError::Configuration(format!(
                "confidence level {level} must be in (0, 1)"
            )));
        }
        Ok(Self {
            resamples,
            level,
            seed,
        })
    }

    pub fn from_config(config: &AqeConfig) -> Result<Self, AqeError> {
        Self::new(
            config.bootstrap_resamples,
            config.confidence_level,
            config.seed,
        )
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    /// Estimator for the `index`-th of several independent groups.
    pub fn for_group(&self, index: usize) -> Self {
        self.with_seed(self.seed ^ hash64(&(index as u64).to_le_bytes(), self.seed))
    }

    pub fn estimate(
        &self,
        values: &[f64],
        statistic: Statistic,
        scale: f64,
    ) -> Result<BootstrapEstimate, AqeError> {
        if values.is_empty() {
            return Err(AqeError::InsufficientData(
                "bootstrap over an empty sample".into(),
            ));
        }
        let n = values.len();
        let point = compute(values.iter().copied(), n, statistic, scale);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut stats = Vec::with_capacity(self.resamples);
        for _ in 0..self.resamples {
            let resample = (0..n).map(|_| values[rng.gen_range(0..n)]);
            stats.push(compute(resample, n, statistic, scale));
        }
        stats.sort_by(|a, b| a.total_cmp(b));

        let alpha = 1.0 - self.level;
        let p = alpha / 2.0;
        let lower = percentile(&stats, p);
        let upper = percentile(&stats, 1.0 - p);

        let mean = stats.iter().sum::<f64>() / stats.len() as f64;
        let variance =
            stats.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / stats.len() as f64;
        let std_error = variance.sqrt();

        // Monte Carlo error of the percentile endpoints themselves
        let z = z_score(self.level);
        let margin = z * (p * (1.0 - p) / self.resamples as f64).sqrt() / normal_pdf(z) * std_error;

        let interval = ConfidenceInterval {
            lower: lower - margin,
            upper: upper + margin,
            level: self.level,
        };
        Ok(BootstrapEstimate {
            point,
            relative_error: relative_error(point, interval.half_width()),
            interval,
            std_error,
            resamples: self.resamples,
        })
    }

    /// Bootstrap several independent samples in parallel. Each sample gets
    /// its own seed derived from its position, so results do not depend on
    /// scheduling.
    pub fn estimate_many(
        &self,
        samples: &[Vec<f64>],
        statistic: Statistic,
        scale: f64,
    ) -> Vec<Result<BootstrapEstimate, AqeError>> {
        samples
            .par_iter()
            .enumerate()
            .map(|(i, values)| self.for_group(i).estimate(values, statistic, scale))
            .collect()
    }

    /// [`estimate_many`](Self::estimate_many) with a scale factor per sample.
    pub fn estimate_scaled(
        &self,
        samples: &[(Vec<f64>, f64)],
        statistic: Statistic,
    ) -> Vec<Result<BootstrapEstimate, AqeError>> {
        samples
            .par_iter()
            .enumerate()
            .map(|(i, (values, scale))| self.for_group(i).estimate(values, statistic, *scale))
            .collect()
    }
}

fn compute(values: impl Iterator<Item = f64>, n: usize, statistic: Statistic, scale: f64) -> f64 {
    match statistic {
        Statistic::Mean => values.sum::<f64>() / n as f64,
        Statistic::Sum => values.sum::<f64>() * scale,
        Statistic::Count => values.filter(|v| *v != 0.0).count() as f64 * scale,
    }
}

/// Linear interpolation between closest ranks of a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Two-sided critical value for a confidence level (1.96 for 0.95).
pub fn z_score(level: f64) -> f64 {
    inverse_normal_cdf(1.0 - (1.0 - level) / 2.0)
}

/// Acklam's rational approximation of the standard normal quantile.
fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}
