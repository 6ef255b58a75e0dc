//! Strategy selection.
//!
//! The selector is a pure function of the query features, a history
//! summary for the query's similarity key, the caller's error tolerance and
//! the engine configuration. It never touches storage.

use tracing::debug;

use crate::config::AqeConfig;
use crate::error::AqeError;
use crate::history::HistorySummary;
use crate::query::{AggregationKind, QueryFeatures};
use crate::sampler::{fraction_ladder, Sampler};
use crate::sketch::MAX_PRECISION;
use crate::strategy::{SketchKind, Strategy, StrategyDecision};

/// Maximum width multiplier tried for a frequency sketch.
const MAX_WIDTH_DOUBLINGS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchFamily {
    Cardinality,
    Frequency,
}

/// Which strategies a query shape admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityTier {
    ExactOnly(&'static str),
    Sample,
    Sketch(SketchFamily),
    SampleOrSketch(SketchFamily),
}

pub fn classify(features: &QueryFeatures) -> CapabilityTier {
    match features.kind {
        AggregationKind::Min | AggregationKind::Max => {
            return CapabilityTier::ExactOnly("MIN/MAX cannot be estimated from a subset")
        }
        AggregationKind::Rows => {
            return CapabilityTier::ExactOnly("row-returning queries run exactly")
        }
        _ => {}
    }
    if features.has_order_or_limit {
        return CapabilityTier::ExactOnly("ORDER BY/LIMIT results depend on every row");
    }
    match features.kind {
        AggregationKind::CountDistinct => CapabilityTier::Sketch(SketchFamily::Cardinality),
        AggregationKind::Count if features.point_lookup => {
            CapabilityTier::SampleOrSketch(SketchFamily::Frequency)
        }
        _ => CapabilityTier::Sample,
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    strategy: Strategy,
    confidence: f64,
    speedup: f64,
    error: f64,
    observed: bool,
    transformations: Vec<String>,
}

impl Candidate {
    fn score(&self) -> f64 {
        self.confidence * self.speedup
    }
}

#[derive(Debug, Clone)]
pub struct StrategySelector {
    config: AqeConfig,
    sampler: Sampler,
}

impl StrategySelector {
    pub fn new(config: AqeConfig) -> Self {
        let sampler = Sampler::new(config.sample_residue);
        Self { config, sampler }
    }

    pub fn select(
        &self,
        features: &QueryFeatures,
        history: &HistorySummary,
        max_rel_error: f64,
    ) -> StrategyDecision {
        let tolerance = if max_rel_error.is_nan() {
            self.config.default_max_rel_error
        } else {
            max_rel_error.max(0.0)
        };

        let tier = classify(features);
        let family = match tier {
            CapabilityTier::ExactOnly(reason) => return StrategyDecision::exact(reason),
            CapabilityTier::Sample => None,
            CapabilityTier::Sketch(family) | CapabilityTier::SampleOrSketch(family) => Some(family),
        };

        let mut rejected: Vec<String> = Vec::new();
        let mut candidates = Vec::new();
        if matches!(tier, CapabilityTier::Sample | CapabilityTier::SampleOrSketch(_)) {
            candidates.extend(self.sample_candidates(features, history, tolerance, &mut rejected));
        }
        match family {
            Some(SketchFamily::Cardinality) => candidates.extend(self.cardinality_candidate(
                features,
                history,
                tolerance,
                &mut rejected,
            )),
            Some(SketchFamily::Frequency) => candidates.extend(self.frequency_candidate(
                features,
                history,
                tolerance,
                &mut rejected,
            )),
            None => {}
        }

        let history_note = if history.is_empty() {
            "no historical data available".to_string()
        } else {
            format!("learned from {} similar queries", history.total_observations())
        };

        let best = candidates.into_iter().max_by(|a, b| {
            a.score()
                .total_cmp(&b.score())
                .then_with(|| b.error.total_cmp(&a.error))
        });

        match best {
            // exact scores 1.0 with certainty
            Some(best) if best.score() > 1.0 => {
                let basis = if best.observed { "observed" } else { "prior" };
                let reasoning = format!(
                    "{history_note}; {} expected {:.1}x faster with {:.2}% error ({basis}), tolerance {:.2}%",
                    best.strategy.label(),
                    best.speedup,
                    best.error * 100.0,
                    tolerance * 100.0
                );
                debug!(
                    strategy = %best.strategy,
                    confidence = best.confidence,
                    speedup = best.speedup,
                    error = best.error,
                    "selected approximate strategy"
                );
                StrategyDecision {
                    strategy: best.strategy,
                    confidence: best.confidence,
                    estimated_speedup: best.speedup,
                    estimated_error: best.error,
                    reasoning,
                    transformations: best.transformations,
                }
            }
            _ => {
                let mut reasoning = format!(
                    "{history_note}; no approximate strategy beats exact within tolerance {:.2}%",
                    tolerance * 100.0
                );
                if !rejected.is_empty() {
                    reasoning.push_str(" (");
                    reasoning.push_str(&rejected.join("; "));
                    reasoning.push(')');
                }
                StrategyDecision::exact(reasoning)
            }
        }
    }

    /// Decision for a caller-forced sample fraction. An invalid fraction is
    /// replaced by the configured default; a fraction with no benefit runs
    /// exactly.
    pub fn forced_sample(&self, features: &QueryFeatures, fraction: f64) -> StrategyDecision {
        if let CapabilityTier::ExactOnly(reason) = classify(features) {
            return StrategyDecision::exact(reason);
        }
        if features.kind == AggregationKind::CountDistinct {
            return StrategyDecision::exact("distinct counts cannot be scaled from a sample");
        }
        let (fraction, def) = match self.sampler.define(fraction) {
            Ok(def) => (fraction, def),
            Err(AqeError::InvalidFraction(bad)) => {
                let fallback = self.config.default_sample_fraction;
                match self.sampler.define(fallback) {
                    Ok(def) => {
                        debug!(requested = bad, fallback, "invalid sample fraction replaced");
                        (fallback, def)
                    }
                    Err(e) => return StrategyDecision::exact(e.to_string()),
                }
            }
            Err(e) => return StrategyDecision::exact(e.to_string()),
        };
        let per_group = self.rows_per_group(features, def.modulus);
        StrategyDecision {
            strategy: Strategy::Sample { fraction },
            confidence: self.config.history_confidence_floor,
            estimated_speedup: def.modulus as f64,
            estimated_error: prior_sample_error(per_group),
            reasoning: format!("sample fraction {fraction} requested by caller"),
            transformations: sample_transformations(features.kind, def.modulus),
        }
    }

    /// Sampled rows expected in the smallest group, falling back to the
    /// mean group when the smallest is unknown.
    fn rows_per_group(&self, features: &QueryFeatures, modulus: u64) -> f64 {
        if features.is_grouped() {
            if let Some(smallest) = features.smallest_group_rows {
                return smallest as f64 / modulus as f64;
            }
        }
        let groups = if features.is_grouped() {
            features.estimated_groups.unwrap_or(1).max(1)
        } else if features.point_lookup {
            features.key_cardinality.unwrap_or(1).max(1)
        } else {
            1
        };
        features.estimated_rows as f64 / modulus as f64 / groups as f64
    }

    /// Per-group sample at `fraction` for a grouped query whose smallest
    /// group a uniform sample would starve.
    fn stratified_candidate(
        &self,
        features: &QueryFeatures,
        fraction: f64,
        history: &HistorySummary,
        tolerance: f64,
        rejected: &mut Vec<String>,
    ) -> Option<Candidate> {
        let groups = features.estimated_groups?;
        let rows = features.estimated_rows as f64;
        // upper bound: the fraction plus a full top-up of every group
        let top_up = groups.saturating_mul(self.config.min_group_rows) as f64;
        let sampled = (rows * fraction + top_up).min(rows);
        let prior_speedup = rows / sampled.max(1.0);
        let min_rows = self.config.min_group_rows as f64;
        // a group at or below the minimum is read whole
        let per_group = match features.smallest_group_rows {
            Some(s) if s <= self.config.min_group_rows => {
                (rows * fraction / groups.max(1) as f64).max(min_rows)
            }
            Some(s) => (s as f64 * fraction).max(min_rows),
            None => min_rows,
        };
        let strategy = Strategy::Stratified { fraction };
        let (confidence, speedup, error, observed) = match history.get(&strategy) {
            Some(seen) => (seen.confidence, seen.mean_speedup, seen.mean_relative_error, true),
            None => (
                self.config.history_confidence_floor,
                prior_speedup,
                prior_sample_error(per_group),
                false,
            ),
        };
        if speedup <= 1.0 {
            rejected.push(format!("{} saves nothing", strategy.label()));
            return None;
        }
        if error > tolerance {
            rejected.push(format!(
                "{} error {:.2}% over tolerance",
                strategy.label(),
                error * 100.0
            ));
            return None;
        }
        let allocation = match features.kind {
            AggregationKind::Sum | AggregationKind::Avg if self.config.neyman_allocation => {
                "neyman"
            }
            _ => "proportional",
        };
        Some(Candidate {
            strategy,
            confidence,
            speedup,
            error,
            observed,
            transformations: vec![
                format!(
                    "stratify on {} with {allocation} allocation of {fraction}",
                    features.group_by.join(", ")
                ),
                format!(
                    "keep at least {} rows per group",
                    self.config.min_group_rows
                ),
                "scale each group by its population over its sampled rows".to_string(),
            ],
        })
    }

    fn sample_candidates(
        &self,
        features: &QueryFeatures,
        history: &HistorySummary,
        tolerance: f64,
        rejected: &mut Vec<String>,
    ) -> Vec<Candidate> {
        let floor = self.config.history_confidence_floor;
        // most-observed sample strategy, used to extrapolate unseen fractions
        let reference = history
            .strategies
            .iter()
            .filter_map(|s| match s.strategy {
                Strategy::Sample { fraction } => Some((fraction, s)),
                _ => None,
            })
            .max_by_key(|(_, s)| s.observations);

        let mut out = Vec::new();
        for fraction in fraction_ladder(
            self.config.default_sample_fraction,
            self.config.max_sample_fraction,
        ) {
            if fraction < self.config.min_sample_fraction {
                continue;
            }
            let def = match self.sampler.define(fraction) {
                Ok(def) => def,
                Err(_) => continue,
            };
            let per_group = self.rows_per_group(features, def.modulus);
            if per_group < self.config.min_group_rows as f64 {
                rejected.push(format!(
                    "{:.0} sampled rows per group at {fraction} is below {}",
                    per_group, self.config.min_group_rows
                ));
                if features.is_grouped() && self.config.stratified_sampling {
                    out.extend(self.stratified_candidate(
                        features, fraction, history, tolerance, rejected,
                    ));
                }
                continue;
            }
            let prior_error = prior_sample_error(per_group);
            let strategy = Strategy::Sample { fraction };

            let (confidence, speedup, error, observed) = match history.get(&strategy) {
                Some(seen) => (seen.confidence, seen.mean_speedup, seen.mean_relative_error, true),
                None => match reference {
                    Some((seen_fraction, seen)) => {
                        let scaled = seen.mean_relative_error * (seen_fraction / fraction).sqrt();
                        (floor, def.modulus as f64, scaled.max(prior_error), false)
                    }
                    None => (floor, def.modulus as f64, prior_error, false),
                },
            };
            if error > tolerance {
                rejected.push(format!(
                    "{} error {:.2}% over tolerance",
                    strategy.label(),
                    error * 100.0
                ));
                continue;
            }
            out.push(Candidate {
                strategy,
                confidence,
                speedup,
                error,
                observed,
                transformations: sample_transformations(features.kind, def.modulus),
            });
        }
        out
    }

    fn cardinality_candidate(
        &self,
        features: &QueryFeatures,
        history: &HistorySummary,
        tolerance: f64,
        rejected: &mut Vec<String>,
    ) -> Option<Candidate> {
        if features.is_grouped()
            && features.estimated_groups.unwrap_or(u64::MAX) > self.config.max_sketch_groups
        {
            rejected.push(format!(
                "too many groups for per-group sketches (limit {})",
                self.config.max_sketch_groups
            ));
            return None;
        }
        let start = self.config.hll_precision.min(MAX_PRECISION);
        let Some((precision, analytic)) = (start..=MAX_PRECISION)
            .map(|p| (p, 1.04 / ((1u64 << p) as f64).sqrt()))
            .find(|(_, err)| *err <= tolerance)
        else {
            rejected.push(format!(
                "hll error at p={MAX_PRECISION} exceeds tolerance"
            ));
            return None;
        };
        let strategy = Strategy::Sketch {
            kind: SketchKind::Cardinality { precision },
        };
        let transformations = vec![format!("build cardinality sketch with p={precision}")];
        self.sketch_candidate(strategy, analytic, history, tolerance, transformations, rejected)
    }

    fn frequency_candidate(
        &self,
        features: &QueryFeatures,
        history: &HistorySummary,
        tolerance: f64,
        rejected: &mut Vec<String>,
    ) -> Option<Candidate> {
        let depth = self.config.cms_depth;
        let base = self.config.cms_width;
        let chosen = (0..=MAX_WIDTH_DOUBLINGS)
            .map(|shift| base << shift)
            .map(|width| {
                // epsilon * N relative to the expected key frequency N / c
                let error = match features.key_cardinality {
                    Some(c) => std::f64::consts::E * c.max(1) as f64 / width as f64,
                    None => 0.5,
                };
                (width, error)
            })
            .find(|(_, error)| *error <= tolerance);
        let Some((width, analytic)) = chosen else {
            rejected.push("count-min error bound exceeds tolerance".to_string());
            return None;
        };
        let strategy = Strategy::Sketch {
            kind: SketchKind::Frequency { depth, width },
        };
        let transformations = vec![format!("build frequency sketch with d={depth}, w={width}")];
        self.sketch_candidate(strategy, analytic, history, tolerance, transformations, rejected)
    }

    fn sketch_candidate(
        &self,
        strategy: Strategy,
        analytic_error: f64,
        history: &HistorySummary,
        tolerance: f64,
        transformations: Vec<String>,
        rejected: &mut Vec<String>,
    ) -> Option<Candidate> {
        let (confidence, speedup, error, observed) = match history.get(&strategy) {
            Some(seen) => (seen.confidence, seen.mean_speedup, seen.mean_relative_error, true),
            None => (
                self.config.history_confidence_floor,
                self.config.sketch_speedup_prior,
                analytic_error,
                false,
            ),
        };
        if error > tolerance {
            rejected.push(format!(
                "{} error {:.2}% over tolerance",
                strategy.label(),
                error * 100.0
            ));
            return None;
        }
        Some(Candidate {
            strategy,
            confidence,
            speedup,
            error,
            observed,
            transformations,
        })
    }
}

fn prior_sample_error(rows_per_group: f64) -> f64 {
    if rows_per_group <= 0.0 {
        return 0.5;
    }
    (1.0 / rows_per_group.sqrt()).clamp(0.01, 0.5)
}

fn sample_transformations(kind: AggregationKind, modulus: u64) -> Vec<String> {
    let mut out = vec![format!("apply ROWID modulo {modulus} sampling")];
    if matches!(kind, AggregationKind::Count | AggregationKind::Sum) {
        out.push(format!("scale {} by {modulus}", kind.label().to_uppercase()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ConfidencePolicy, HistoryRecord, HistoryStore};
    use crate::query::parse_sql;

    fn features(sql: &str, rows: u64) -> QueryFeatures {
        QueryFeatures::from_query(&parse_sql(sql).unwrap(), rows)
    }

    fn selector() -> StrategySelector {
        StrategySelector::new(AqeConfig::new())
    }

    fn empty(f: &QueryFeatures) -> HistorySummary {
        HistorySummary::empty(f.similarity_key())
    }

    #[test]
    fn test_exact_only_shapes() {
        let s = selector();
        for sql in [
            "SELECT MIN(amount) FROM purchases",
            "SELECT MAX(amount) FROM purchases",
            "SELECT * FROM purchases",
            "SELECT country, COUNT(*) FROM purchases GROUP BY country ORDER BY country",
            "SELECT country, SUM(amount) FROM purchases GROUP BY country LIMIT 3",
        ] {
            let f = features(sql, 200_000);
            let d = s.select(&f, &empty(&f), 0.05);
            assert_eq!(d.strategy, Strategy::Exact, "{sql}");
            assert_eq!(d.confidence, 1.0);
            assert_eq!(d.estimated_speedup, 1.0);
            assert_eq!(d.estimated_error, 0.0);
        }
    }

    #[test]
    fn test_cold_count_uses_default_fraction() {
        let f = features("SELECT COUNT(*) FROM purchases", 200_000);
        let d = selector().select(&f, &empty(&f), 0.05);
        assert_eq!(d.strategy, Strategy::Sample { fraction: 0.01 });
        assert!((d.confidence - 0.6).abs() < 1e-12);
        assert!(d.reasoning.contains("no historical data available"));
        assert!(d
            .transformations
            .contains(&"apply ROWID modulo 100 sampling".to_string()));
        assert!(d.estimated_error >= 0.0);
    }

    #[test]
    fn test_zero_tolerance_is_exact() {
        let s = selector();
        for sql in [
            "SELECT COUNT(*) FROM purchases",
            "SELECT COUNT(DISTINCT country) FROM purchases",
            "SELECT AVG(amount) FROM purchases",
        ] {
            let f = features(sql, 200_000);
            let d = s.select(&f, &empty(&f), 0.0);
            assert_eq!(d.strategy, Strategy::Exact, "{sql}");
            assert_eq!(d.estimated_error, 0.0);
        }
    }

    #[test]
    fn test_negative_tolerance_is_clamped() {
        let f = features("SELECT SUM(amount) FROM purchases", 200_000);
        let d = selector().select(&f, &empty(&f), -1.0);
        assert_eq!(d.strategy, Strategy::Exact);
    }

    #[test]
    fn test_count_distinct_uses_hll() {
        let f = features("SELECT COUNT(DISTINCT country) FROM purchases", 200_000);
        let d = selector().select(&f, &empty(&f), 0.05);
        assert_eq!(
            d.strategy,
            Strategy::Sketch {
                kind: SketchKind::Cardinality { precision: 14 }
            }
        );
        assert_eq!(d.transformations, vec!["build cardinality sketch with p=14"]);
    }

    #[test]
    fn test_tight_tolerance_raises_precision() {
        let f = features("SELECT COUNT(DISTINCT country) FROM purchases", 200_000);
        let d = selector().select(&f, &empty(&f), 0.005);
        assert_eq!(
            d.strategy,
            Strategy::Sketch {
                kind: SketchKind::Cardinality { precision: 16 }
            }
        );
    }

    #[test]
    fn test_small_groups_widen_fraction() {
        // 200k rows over 100 groups: 20 rows per group at 1%, 40 at 2%
        let f = features(
            "SELECT country, COUNT(*) FROM purchases GROUP BY country",
            200_000,
        )
        .with_estimated_groups(Some(100));
        let d = selector().select(&f, &empty(&f), 0.5);
        assert_eq!(d.strategy, Strategy::Sample { fraction: 0.02 });
    }

    #[test]
    fn test_smallest_group_sets_fraction() {
        let s = StrategySelector::new(AqeConfig::new().with_stratified_sampling(false));
        // mean group is 20k rows but the rarest has 1000: 10, 20, then 50 sampled
        let f = features(
            "SELECT country, COUNT(*) FROM purchases GROUP BY country",
            200_000,
        )
        .with_estimated_groups(Some(10))
        .with_smallest_group_rows(Some(1_000));
        let d = s.select(&f, &empty(&f), 0.5);
        assert_eq!(d.strategy, Strategy::Sample { fraction: 0.05 });

        let even = f.clone().with_smallest_group_rows(None);
        let d = s.select(&even, &empty(&even), 0.5);
        assert_eq!(d.strategy, Strategy::Sample { fraction: 0.01 });
    }

    #[test]
    fn test_rare_group_prefers_stratified() {
        let f = features(
            "SELECT country, COUNT(*) FROM purchases GROUP BY country",
            200_000,
        )
        .with_estimated_groups(Some(2))
        .with_smallest_group_rows(Some(200));
        let d = selector().select(&f, &empty(&f), 0.5);
        assert_eq!(d.strategy, Strategy::Stratified { fraction: 0.01 });
        // 2000 sampled plus a 30-row top-up per group
        assert!((d.estimated_speedup - 200_000.0 / 2_060.0).abs() < 1e-9);
        assert_eq!(
            d.transformations,
            vec![
                "stratify on country with proportional allocation of 0.01",
                "keep at least 30 rows per group",
                "scale each group by its population over its sampled rows",
            ]
        );

        let off = StrategySelector::new(AqeConfig::new().with_stratified_sampling(false));
        let d = off.select(&f, &empty(&f), 0.5);
        assert!(matches!(d.strategy, Strategy::Sample { .. } | Strategy::Exact));
    }

    #[test]
    fn test_stratified_prior_respects_tolerance() {
        let sql = "SELECT country, SUM(amount) FROM purchases GROUP BY country";
        // 30 rows kept from the rare group: about 18% error
        let f = features(sql, 200_000)
            .with_estimated_groups(Some(2))
            .with_smallest_group_rows(Some(200));
        let d = selector().select(&f, &empty(&f), 0.05);
        assert_eq!(d.strategy, Strategy::Exact);
        assert!(d.reasoning.contains("stratified(0.0100) error"), "{}", d.reasoning);

        // a rare group below the minimum is read whole, the big one sets the error
        let f = f.with_smallest_group_rows(Some(20));
        let d = selector().select(&f, &empty(&f), 0.05);
        assert_eq!(d.strategy, Strategy::Stratified { fraction: 0.01 });
        assert!(d.transformations[0].contains("neyman"));
    }

    #[test]
    fn test_tiny_table_runs_exact() {
        let f = features("SELECT COUNT(*) FROM purchases", 500);
        let d = selector().select(&f, &empty(&f), 0.05);
        assert_eq!(d.strategy, Strategy::Exact);
    }

    fn record_outcomes(
        store: &HistoryStore,
        f: &QueryFeatures,
        strategy: Strategy,
        error: f64,
        n: usize,
    ) {
        for _ in 0..n {
            store
                .append(HistoryRecord {
                    fingerprint: f.fingerprint(),
                    key: f.similarity_key(),
                    strategy,
                    speedup: 40.0,
                    relative_error: error,
                    speedup_measured: true,
                    timestamp_micros: 0,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_history_raises_confidence() {
        let store = HistoryStore::new(ConfidencePolicy::default());
        let f = features("SELECT SUM(amount) FROM purchases", 200_000);
        record_outcomes(&store, &f, Strategy::Sample { fraction: 0.01 }, 0.01, 10);
        let d = selector().select(&f, &store.summarize(&f.similarity_key()), 0.05);
        assert_eq!(d.strategy, Strategy::Sample { fraction: 0.01 });
        assert!((d.confidence - 0.9).abs() < 1e-12);
        assert!(d.reasoning.contains("learned from 10 similar queries"));
    }

    #[test]
    fn test_bad_history_widens_fraction() {
        let store = HistoryStore::new(ConfidencePolicy::default());
        let f = features("SELECT SUM(amount) FROM purchases", 200_000);
        record_outcomes(&store, &f, Strategy::Sample { fraction: 0.01 }, 0.12, 5);
        let d = selector().select(&f, &store.summarize(&f.similarity_key()), 0.05);
        // 0.12 * sqrt(0.01 / f) <= 0.05 first holds at f = 0.1
        assert_eq!(d.strategy, Strategy::Sample { fraction: 0.1 });
        assert!((d.confidence - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_hopeless_history_falls_back_to_exact() {
        let store = HistoryStore::new(ConfidencePolicy::default());
        let f = features("SELECT SUM(amount) FROM purchases", 200_000);
        record_outcomes(&store, &f, Strategy::Sample { fraction: 0.01 }, 0.9, 5);
        let d = selector().select(&f, &store.summarize(&f.similarity_key()), 0.05);
        assert_eq!(d.strategy, Strategy::Exact);
        assert!(d.reasoning.contains("learned from 5 similar queries"));
    }

    #[test]
    fn test_point_lookup_frequency_sketch() {
        // single-row sample groups too small, sketch carries it
        let f = features("SELECT COUNT(*) FROM purchases WHERE country = 'DE'", 2_000)
            .with_key_cardinality(Some(10));
        assert!(f.point_lookup);
        let d = selector().select(&f, &empty(&f), 0.05);
        assert_eq!(
            d.strategy,
            Strategy::Sketch {
                kind: SketchKind::Frequency {
                    depth: 4,
                    width: 2048
                }
            }
        );
        assert_eq!(d.transformations, vec!["build frequency sketch with d=4, w=2048"]);
    }

    #[test]
    fn test_forced_sample_clamps_invalid_fraction() {
        let f = features("SELECT COUNT(*) FROM purchases", 200_000);
        let d = selector().forced_sample(&f, 7.0);
        assert_eq!(d.strategy, Strategy::Sample { fraction: 0.01 });
        let d = selector().forced_sample(&f, 1.0);
        assert_eq!(d.strategy, Strategy::Exact);
    }
}
