use serde::{Deserialize, Serialize};

use crate::error::AqeError;

const MIN_HLL_PRECISION: u8 = 4;
const MAX_HLL_PRECISION: u8 = 18;

/// Resample budgets for the bootstrap estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPreset {
    Fast,
    Balanced,
    Accurate,
}

impl BootstrapPreset {
    pub fn resamples(self) -> usize {
        match self {
            BootstrapPreset::Fast => 500,
            BootstrapPreset::Balanced => 1000,
            BootstrapPreset::Accurate => 2000,
        }
    }
}

/// Process-wide engine configuration.
///
/// Loaded from JSON by the CLI; every field has a default so partial files
/// are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AqeConfig {
    /// HyperLogLog precision `p` (registers = 2^p)
    pub hll_precision: u8,
    pub cms_depth: usize,
    pub cms_width: usize,
    pub bootstrap_resamples: usize,
    pub confidence_level: f64,
    pub default_sample_fraction: f64,
    pub min_sample_fraction: f64,
    pub max_sample_fraction: f64,
    /// Residue `r` of the `row_id % k == r` sample predicate
    pub sample_residue: u64,
    /// Minimum sampled rows per group before sampling is trusted
    pub min_group_rows: u64,
    /// Offer per-group samples when a uniform sample starves small groups
    pub stratified_sampling: bool,
    /// Allocate stratified SUM/AVG samples by group spread instead of size
    pub neyman_allocation: bool,
    pub history_confidence_floor: f64,
    pub history_confidence_ceiling: f64,
    pub history_saturation_count: u64,
    pub default_max_rel_error: f64,
    pub seed: u64,
    /// Run the exact query after an approximate one to measure speedup and error
    pub compare_with_exact: bool,
    /// Deadline for a single sketch build (0 = none)
    pub sketch_timeout_millis: u64,
    pub sketch_cache_entries: usize,
    /// Materialized samples kept by the storage and by the executor
    pub sample_cache_entries: usize,
    /// Speedup assumed for a sketch strategy before any history exists
    pub sketch_speedup_prior: f64,
    /// Grouped distinct counts above this many groups are not sketched
    pub max_sketch_groups: u64,
    /// Window used by `learning_stats`
    pub stats_window_secs: u64,
}

impl Default for AqeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AqeConfig {
    pub fn new() -> Self {
        Self {
            hll_precision: 14,
            cms_depth: 4,
            cms_width: 2048,
            bootstrap_resamples: BootstrapPreset::Balanced.resamples(),
            confidence_level: 0.95,
            default_sample_fraction: 0.01,
            min_sample_fraction: 0.001,
            max_sample_fraction: 0.25,
            sample_residue: 0,
            min_group_rows: 30,
            stratified_sampling: true,
            neyman_allocation: true,
            history_confidence_floor: 0.6,
            history_confidence_ceiling: 0.9,
            history_saturation_count: 10,
            default_max_rel_error: 0.05,
            seed: 0x5eed_a9e0,
            compare_with_exact: true,
            sketch_timeout_millis: 30_000,
            sketch_cache_entries: 64,
            sample_cache_entries: 16,
            sketch_speedup_prior: 3.0,
            max_sketch_groups: 1024,
            stats_window_secs: 30 * 24 * 3600,
        }
    }

    pub fn with_hll_precision(mut self, precision: u8) -> Self {
        self.hll_precision = precision;
        self
    }

    pub fn with_count_min(mut self, depth: usize, width: usize) -> Self {
        self.cms_depth = depth;
        self.cms_width = width;
        self
    }

    pub fn with_bootstrap_resamples(mut self, resamples: usize) -> Self {
        self.bootstrap_resamples = resamples;
        self
    }

    pub fn with_bootstrap_preset(mut self, preset: BootstrapPreset) -> Self {
        self.bootstrap_resamples = preset.resamples();
        self
    }

    pub fn with_confidence_level(mut self, level: f64) -> Self {
        self.confidence_level = level;
        self
    }

    pub fn with_sample_fractions(mut self, default: f64, min: f64, max: f64) -> Self {
        self.default_sample_fraction = default;
        self.min_sample_fraction = min;
        self.max_sample_fraction = max;
        self
    }

    pub fn with_sample_residue(mut self, residue: u64) -> Self {
        self.sample_residue = residue;
        self
    }

    pub fn with_min_group_rows(mut self, rows: u64) -> Self {
        self.min_group_rows = rows;
        self
    }

    pub fn with_stratified_sampling(mut self, enabled: bool) -> Self {
        self.stratified_sampling = enabled;
        self
    }

    pub fn with_neyman_allocation(mut self, enabled: bool) -> Self {
        self.neyman_allocation = enabled;
        self
    }

    pub fn with_history_confidence(mut self, floor: f64, ceiling: f64, saturation: u64) -> Self {
        self.history_confidence_floor = floor;
        self.history_confidence_ceiling = ceiling;
        self.history_saturation_count = saturation;
        self
    }

    pub fn with_default_max_rel_error(mut self, tolerance: f64) -> Self {
        self.default_max_rel_error = tolerance;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_compare_with_exact(mut self, enabled: bool) -> Self {
        self.compare_with_exact = enabled;
        self
    }

    pub fn with_sketch_timeout_millis(mut self, millis: u64) -> Self {
        self.sketch_timeout_millis = millis;
        self
    }

    pub fn with_sketch_cache_entries(mut self, entries: usize) -> Self {
        self.sketch_cache_entries = entries.max(1);
        self
    }

    pub fn with_sample_cache_entries(mut self, entries: usize) -> Self {
        self.sample_cache_entries = entries.max(1);
        self
    }

    pub fn with_max_sketch_groups(mut self, groups: u64) -> Self {
        self.max_sketch_groups = groups;
        self
    }

    pub fn with_stats_window_secs(mut self, secs: u64) -> Self {
        self.stats_window_secs = secs;
        self
    }

    /// Reject settings the estimators cannot work with.
    pub fn validate(&self) -> Result<(), AqeError> {
        if !(MIN_HLL_PRECISION..=MAX_HLL_PRECISION).contains(&self.hll_precision) {
            return Err(AqeError::Configuration(format!(
                "hll_precision {} outside {}..={}",
                self.hll_precision, MIN_HLL_PRECISION, MAX_HLL_PRECISION
            )));
        }
        if self.cms_depth == 0 || self.cms_width == 0 {
            return Err(AqeError::Configuration(
                "count-min depth and width must be positive".into(),
            ));
        }
        if self.bootstrap_resamples == 0 {
            return Err(AqeError::Configuration(
                "bootstrap_resamples must be positive".into(),
            ));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(AqeError::Configuration(format!(
                "confidence_level {} must be in (0, 1)",
                self.confidence_level
            )));
        }
        let fractions = [
            self.min_sample_fraction,
            self.default_sample_fraction,
            self.max_sample_fraction,
        ];
        if fractions.iter().any(|f| !(*f > 0.0 && *f <= 1.0)) {
            return Err(AqeError::Configuration(
                "sample fractions must be in (0, 1]".into(),
            ));
        }
        if self.min_sample_fraction > self.default_sample_fraction
            || self.default_sample_fraction > self.max_sample_fraction
        {
            return Err(AqeError::Configuration(format!(
                "sample fractions must satisfy min <= default <= max ({} / {} / {})",
                self.min_sample_fraction, self.default_sample_fraction, self.max_sample_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.history_confidence_floor)
            || !(0.0..=1.0).contains(&self.history_confidence_ceiling)
            || self.history_confidence_floor > self.history_confidence_ceiling
        {
            return Err(AqeError::Configuration(
                "history confidence must satisfy 0 <= floor <= ceiling <= 1".into(),
            ));
        }
        if self.history_saturation_count == 0 {
            return Err(AqeError::Configuration(
                "history_saturation_count must be positive".into(),
            ));
        }
        if !(self.default_max_rel_error >= 0.0) {
            return Err(AqeError::Configuration(
                "default_max_rel_error must be non-negative".into(),
            ));
        }
        if !(self.sketch_speedup_prior >= 1.0) {
            return Err(AqeError::Configuration(
                "sketch_speedup_prior must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AqeConfig::new();
        config.validate().unwrap();
        assert_eq!(config.hll_precision, 14);
        assert_eq!(config.bootstrap_resamples, 1000);
        assert_eq!(config.min_group_rows, 30);
        assert!(config.stratified_sampling);
        assert_eq!(config.sample_cache_entries, 16);
    }

    #[test]
    fn test_rejects_out_of_range_precision() {
        let err = AqeConfig::new().with_hll_precision(19).validate().unwrap_err();
        assert!(matches!(err, AqeError::Configuration(_)));
        let err = AqeConfig::new().with_hll_precision(3).validate().unwrap_err();
        assert!(matches!(err, AqeError::Configuration(_)));
    }

    #[test]
    fn test_rejects_zero_count_min_shape() {
        let err = AqeConfig::new().with_count_min(0, 2048).validate().unwrap_err();
        assert!(matches!(err, AqeError::Configuration(_)));
    }

    #[test]
    fn test_rejects_unordered_fractions() {
        let err = AqeConfig::new()
            .with_sample_fractions(0.5, 0.001, 0.25)
            .validate()
            .unwrap_err();
        assert!(matches!(err, AqeError::Configuration(_)));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AqeConfig =
            serde_json::from_str(r#"{"hll_precision": 12, "bootstrap_resamples": 500}"#).unwrap();
        assert_eq!(config.hll_precision, 12);
        assert_eq!(config.bootstrap_resamples, 500);
        assert_eq!(config.cms_width, 2048);
        assert!((config.default_max_rel_error - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_presets_map_to_resample_counts() {
        let config = AqeConfig::new().with_bootstrap_preset(BootstrapPreset::Accurate);
        assert_eq!(config.bootstrap_resamples, 2000);
        assert_eq!(BootstrapPreset::Fast.resamples(), 500);
    }
}
