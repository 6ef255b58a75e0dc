//! Deterministic modulo sampling.
//!
//! A sample of fraction `f` keeps the rows with `row_id % k == r`, where
//! `k = round(1 / f)`. Results computed on the sample are scaled back by `k`.
//!
//! A stratified sample applies one modulus per stratum to each row's
//! position within its stratum, so small strata can be sampled densely
//! while large ones stay sparse.

use serde::{Deserialize, Serialize};

use crate::error::AqeError;
use crate::query::AggregationKind;

/// Multipliers applied to the default fraction when a strategy needs a
/// larger sample.
const LADDER: [f64; 5] = [1.0, 2.0, 5.0, 10.0, 25.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleDefinition {
    pub modulus: u64,
    pub residue: u64,
}

impl SampleDefinition {
    pub fn matches(&self, row_id: u64) -> bool {
        row_id % self.modulus == self.residue
    }

    /// Fraction actually realized by the modulus.
    pub fn fraction(&self) -> f64 {
        1.0 / self.modulus as f64
    }

    pub fn scaling_factor(&self) -> f64 {
        self.modulus as f64
    }

    /// Scale a sample aggregate back to the full table.
    pub fn scale(&self, kind: AggregationKind, value: f64) -> f64 {
        match kind {
            AggregationKind::Count | AggregationKind::Sum => value * self.scaling_factor(),
            _ => value,
        }
    }

    /// Name under which a materialized copy of this sample may be cached.
    pub fn cache_key(&self, table: &str) -> String {
        format!("{table}__sample_k{}_r{}", self.modulus, self.residue)
    }

    /// Predicate for a SQL collaborator that exposes a row id.
    pub fn predicate_sql(&self) -> String {
        format!("ROWID % {} = {}", self.modulus, self.residue)
    }

    /// How many of the positions `1..=population` fall in the sample.
    pub fn selected_in(&self, population: u64) -> u64 {
        if self.residue == 0 {
            population / self.modulus
        } else if population < self.residue {
            0
        } else {
            (population - self.residue) / self.modulus + 1
        }
    }

    /// First row id at or after `start` that falls in the sample.
    pub fn first_at_or_after(&self, start: u64) -> u64 {
        let rem = start % self.modulus;
        if rem <= self.residue {
            start + (self.residue - rem)
        } else {
            start + (self.modulus - rem) + self.residue
        }
    }
}

/// How a stratified sample divides its rows among strata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    /// Every stratum sampled at the same rate
    Proportional,
    /// Rows in proportion to population times standard deviation
    Neyman,
}

impl Allocation {
    pub fn label(&self) -> &'static str {
        match self {
            Allocation::Proportional => "proportional",
            Allocation::Neyman => "neyman",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StratumProfile {
    pub population: u64,
    /// Spread of the aggregated column within the stratum
    pub std_dev: f64,
}

/// Builds sample definitions for a fixed residue.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sampler {
    residue: u64,
}

fn check_fraction(fraction: f64) -> Result<(), AqeError> {
    if fraction.is_nan() || fraction <= 0.0 || fraction > 1.0 {
        return Err(AqeError::InvalidFraction(fraction));
    }
    Ok(())
}

impl Sampler {
    pub fn new(residue: u64) -> Self {
        Self { residue }
    }

    pub fn define(&self, fraction: f64) -> Result<SampleDefinition, AqeError> {
        check_fraction(fraction)?;
        let modulus = (1.0 / fraction).round() as u64;
        if modulus <= 1 {
            return Err(AqeError::NoSamplingBenefit(fraction));
        }
        Ok(SampleDefinition {
            modulus,
            residue: self.residue % modulus,
        })
    }

    /// One definition per stratum, in `profiles` order.
    ///
    /// The table-wide budget `ceil(rows * fraction)` is split by
    /// `allocation`; each stratum then gets at least `min_rows` positions,
    /// or all of them when it is smaller. Neyman allocation falls back to
    /// proportional when no stratum has any spread.
    pub fn stratify(
        &self,
        profiles: &[StratumProfile],
        fraction: f64,
        min_rows: u64,
        allocation: Allocation,
    ) -> Result<Vec<SampleDefinition>, AqeError> {
        check_fraction(fraction)?;
        let total: u64 = profiles.iter().map(|p| p.population).sum();
        let budget = (total as f64 * fraction).ceil();

        let neyman: Vec<f64> = profiles
            .iter()
            .map(|p| p.population as f64 * p.std_dev.max(0.0))
            .collect();
        let neyman_total: f64 = neyman.iter().sum();
        let weights: Vec<f64> = match allocation {
            Allocation::Neyman if neyman_total.is_finite() && neyman_total > 0.0 => neyman,
            _ => profiles.iter().map(|p| p.population as f64).collect(),
        };
        let weight_total: f64 = weights.iter().sum();

        Ok(profiles
            .iter()
            .zip(&weights)
            .map(|(profile, weight)| {
                let share = if weight_total > 0.0 {
                    budget * weight / weight_total
                } else {
                    0.0
                };
                let target = (share.round() as u64)
                    .max(min_rows)
                    .min(profile.population)
                    .max(1);
                // floor keeps at least `target` positions selected
                let modulus = (profile.population / target).max(1);
                SampleDefinition {
                    modulus,
                    residue: self.residue % modulus,
                }
            })
            .collect())
    }
}

/// Candidate fractions, smallest first: default × {1, 2, 5, 10, 25},
/// capped at `max` and deduplicated.
pub fn fraction_ladder(default: f64, max: f64) -> Vec<f64> {
    let mut ladder: Vec<f64> = Vec::with_capacity(LADDER.len());
    for step in LADDER {
        let f = (default * step).min(max);
        if ladder.last().map_or(true, |last| f > *last) {
            ladder.push(f);
        }
    }
    ladder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_rounds_modulus() {
        let sampler = Sampler::new(0);
        assert_eq!(sampler.define(0.01).unwrap().modulus, 100);
        assert_eq!(sampler.define(0.3).unwrap().modulus, 3);
        assert_eq!(sampler.define(0.015).unwrap().modulus, 67);
    }

    #[test]
    fn test_define_rejects_invalid_fractions() {
        let sampler = Sampler::new(0);
        for f in [0.0, -0.1, 1.5, f64::NAN] {
            assert!(matches!(sampler.define(f), Err(AqeError::InvalidFraction(_))));
        }
        assert!(matches!(sampler.define(1.0), Err(AqeError::NoSamplingBenefit(_))));
        assert!(matches!(sampler.define(0.8), Err(AqeError::NoSamplingBenefit(_))));
    }

    #[test]
    fn test_sample_is_deterministic_and_sized() {
        let def = Sampler::new(0).define(0.01).unwrap();
        let first: Vec<u64> = (1..=200_000u64).filter(|id| def.matches(*id)).collect();
        let second: Vec<u64> = (1..=200_000u64).filter(|id| def.matches(*id)).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2000);
    }

    #[test]
    fn test_residue_wraps_modulus() {
        let def = Sampler::new(105).define(0.01).unwrap();
        assert_eq!(def.residue, 5);
        assert!(def.matches(205));
        assert!(!def.matches(200));
    }

    #[test]
    fn test_scaling() {
        let def = Sampler::new(0).define(0.01).unwrap();
        assert_eq!(def.scaling_factor(), 100.0);
        assert_eq!(def.scale(AggregationKind::Count, 20.0), 2000.0);
        assert_eq!(def.scale(AggregationKind::Sum, 1.5), 150.0);
        assert_eq!(def.scale(AggregationKind::Avg, 1.5), 1.5);
    }

    #[test]
    fn test_cache_key_and_predicate() {
        let def = Sampler::new(0).define(0.01).unwrap();
        assert_eq!(def.cache_key("purchases"), "purchases__sample_k100_r0");
        assert_eq!(def.predicate_sql(), "ROWID % 100 = 0");
    }

    #[test]
    fn test_first_at_or_after() {
        let def = SampleDefinition {
            modulus: 10,
            residue: 3,
        };
        assert_eq!(def.first_at_or_after(0), 3);
        assert_eq!(def.first_at_or_after(3), 3);
        assert_eq!(def.first_at_or_after(4), 13);
        assert_eq!(def.first_at_or_after(21), 23);
    }

    #[test]
    fn test_selected_in_counts_positions() {
        let def = SampleDefinition {
            modulus: 10,
            residue: 3,
        };
        assert_eq!(def.selected_in(2), 0);
        assert_eq!(def.selected_in(3), 1);
        assert_eq!(def.selected_in(25), 3);
        assert_eq!(def.selected_in(25), (1..=25u64).filter(|p| def.matches(*p)).count() as u64);
        let every_tenth = SampleDefinition {
            modulus: 10,
            residue: 0,
        };
        assert_eq!(every_tenth.selected_in(99), 9);
    }

    fn profile(population: u64, std_dev: f64) -> StratumProfile {
        StratumProfile {
            population,
            std_dev,
        }
    }

    #[test]
    fn test_proportional_allocation_tops_up_small_strata() {
        let profiles = [profile(9_000, 0.0), profile(1_000, 0.0), profile(50, 0.0)];
        let defs = Sampler::new(0)
            .stratify(&profiles, 0.01, 30, Allocation::Proportional)
            .unwrap();
        // budget of 101 rows: 90 / 10 / 1 before the top-up
        assert_eq!(defs[0].modulus, 100);
        assert_eq!(defs[1].modulus, 33);
        assert_eq!(defs[2].modulus, 1);
        for (def, p) in defs.iter().zip(&profiles) {
            assert!(def.selected_in(p.population) >= 30.min(p.population));
        }
        assert_eq!(defs[2].selected_in(50), 50);
    }

    #[test]
    fn test_neyman_allocation_follows_spread() {
        let profiles = [profile(1_000, 1.0), profile(1_000, 9.0)];
        let defs = Sampler::new(0)
            .stratify(&profiles, 0.1, 1, Allocation::Neyman)
            .unwrap();
        // 200 rows split 20 / 180
        assert_eq!(defs[0].modulus, 50);
        assert_eq!(defs[1].modulus, 5);

        let flat = [profile(1_000, 0.0), profile(1_000, 0.0)];
        let defs = Sampler::new(0)
            .stratify(&flat, 0.1, 1, Allocation::Neyman)
            .unwrap();
        assert_eq!(defs[0].modulus, 10);
        assert_eq!(defs[1].modulus, 10);
    }

    #[test]
    fn test_stratify_rejects_invalid_fraction() {
        let profiles = [profile(100, 1.0)];
        assert!(matches!(
            Sampler::new(0).stratify(&profiles, 0.0, 30, Allocation::Proportional),
            Err(AqeError::InvalidFraction(_))
        ));
    }

    #[test]
    fn test_fraction_ladder_caps_and_dedups() {
        assert_eq!(fraction_ladder(0.01, 0.25), vec![0.01, 0.02, 0.05, 0.1, 0.25]);
        assert_eq!(fraction_ladder(0.02, 0.25), vec![0.02, 0.04, 0.1, 0.2, 0.25]);
        assert_eq!(fraction_ladder(0.1, 0.25), vec![0.1, 0.2, 0.25]);
    }
}
