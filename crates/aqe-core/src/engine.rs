//! Request-level facade: feature extraction, strategy selection, execution
//! with downgrade to exact, optional exact comparison and feedback.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AqeConfig;
use crate::error::AqeError;
use crate::executor::{ExecutionContext, ExecutorAdapter, Timed};
use crate::feedback::{FeedbackRecorder, Observation};
use crate::history::{ConfidencePolicy, HistoryStore, StrategySummary};
use crate::query::{parse_sql, AggregateQuery, QueryFeatures};
use crate::result::{relative_error_against, QueryResult};
use crate::selector::StrategySelector;
use crate::storage::Storage;
use crate::strategy::{Strategy, StrategyDecision};

/// Per-request knobs.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Tolerated relative error; the configured default when `None`
    pub max_rel_error: Option<f64>,
    pub use_optimization: bool,
    /// Run the exact query as well and measure the real speedup and error;
    /// the configured default when `None`
    pub compare_exact: Option<bool>,
    /// Force sampling at this fraction instead of letting the selector choose
    pub sample_fraction: Option<f64>,
    pub timeout: Option<Duration>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_rel_error: None,
            use_optimization: true,
            compare_exact: None,
            sample_fraction: None,
            timeout: None,
            cancel: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rel_error(mut self, tolerance: f64) -> Self {
        self.max_rel_error = Some(tolerance);
        self
    }

    pub fn with_optimization(mut self, enabled: bool) -> Self {
        self.use_optimization = enabled;
        self
    }

    pub fn with_compare_exact(mut self, enabled: bool) -> Self {
        self.compare_exact = Some(enabled);
        self
    }

    pub fn with_sample_fraction(mut self, fraction: f64) -> Self {
        self.sample_fraction = Some(fraction);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredTimings {
    /// Wall time of the strategy that produced the result
    pub strategy_millis: f64,
    /// Wall time of the exact comparison run, when one ran
    pub exact_millis: Option<f64>,
    pub measured_speedup: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub result: QueryResult,
    pub decision: StrategyDecision,
    /// Differs from `decision.strategy` after a downgrade
    pub strategy_used: Strategy,
    pub timings: MeasuredTimings,
    /// Largest per-group relative error reported by the estimator
    pub error_estimate: f64,
    /// Why the chosen approximate strategy was abandoned
    pub downgraded: Option<String>,
    /// Error against the exact comparison run
    pub measured_relative_error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    pub enabled: bool,
    pub total_historical_queries: u64,
    /// Strategies seen within the configured stats window
    pub per_strategy: Vec<StrategySummary>,
}

pub struct Engine {
    config: AqeConfig,
    storage: Arc<dyn Storage>,
    selector: StrategySelector,
    executor: ExecutorAdapter,
    feedback: FeedbackRecorder,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("history", self.feedback.history())
            .finish()
    }
}

impl Engine {
    pub fn new(config: AqeConfig, storage: Arc<dyn Storage>) -> Result<Self, AqeError> {
        config.validate()?;
        let history = Arc::new(HistoryStore::new(ConfidencePolicy::from_config(&config)));
        Ok(Self {
            selector: StrategySelector::new(config.clone()),
            executor: ExecutorAdapter::new(storage.clone(), config.clone())?,
            feedback: FeedbackRecorder::new(history),
            storage,
            config,
        })
    }

    /// Use a shared (possibly persistent) history store.
    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.feedback = FeedbackRecorder::new(history);
        self
    }

    pub fn config(&self) -> &AqeConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        self.feedback.history()
    }

    pub fn executor(&self) -> &ExecutorAdapter {
        &self.executor
    }

    pub fn extract_features(&self, query: &AggregateQuery) -> Result<QueryFeatures, AqeError> {
        let rows = self.storage.row_count(&query.table)?;

        let mut groups: Option<u64> = None;
        let mut smallest: Option<u64> = None;
        if !query.group_by.is_empty() {
            let mut product: u64 = 1;
            let mut known = true;
            for column in &query.group_by {
                match self.storage.column_stats(&query.table, column)? {
                    Some(stats) => {
                        product = product.saturating_mul(stats.distinct_estimate.max(1));
                        // single-column groups are exactly the column's values
                        if query.group_by.len() == 1 {
                            smallest = stats.min_frequency;
                        }
                    }
                    None => known = false,
                }
            }
            if known {
                groups = Some(product.min(rows.max(1)));
            }
        }

        let key_cardinality = match query.point_lookup() {
            Some(filter) => self
                .storage
                .column_stats(&query.table, &filter.column)?
                .map(|s| s.distinct_estimate),
            None => None,
        };

        Ok(QueryFeatures::from_query(query, rows)
            .with_estimated_groups(groups)
            .with_smallest_group_rows(smallest)
            .with_key_cardinality(key_cardinality))
    }

    /// Choose a strategy without executing anything.
    pub fn decide(
        &self,
        query: &AggregateQuery,
        options: &QueryOptions,
    ) -> Result<(QueryFeatures, StrategyDecision), AqeError> {
        let features = self.extract_features(query)?;
        let decision = if !options.use_optimization {
            StrategyDecision::exact("optimization disabled")
        } else if let Some(fraction) = options.sample_fraction {
            self.selector.forced_sample(&features, fraction)
        } else {
            let summary = self.history().summarize(&features.similarity_key());
            let tolerance = options
                .max_rel_error
                .unwrap_or(self.config.default_max_rel_error);
            self.selector.select(&features, &summary, tolerance)
        };
        Ok((features, decision))
    }

    pub fn decide_and_execute(
        &self,
        query: &AggregateQuery,
        max_rel_error: f64,
        use_optimization: bool,
    ) -> Result<QueryResponse, AqeError> {
        let options = QueryOptions::new()
            .with_max_rel_error(max_rel_error)
            .with_optimization(use_optimization);
        self.execute_with(query, &options)
    }

    pub fn run_sql(&self, sql: &str, options: &QueryOptions) -> Result<QueryResponse, AqeError> {
        let query = parse_sql(sql)?;
        self.execute_with(&query, options)
    }

    pub fn execute_with(
        &self,
        query: &AggregateQuery,
        options: &QueryOptions,
    ) -> Result<QueryResponse, AqeError> {
        let mut ctx = ExecutionContext::new();
        if let Some(timeout) = options.timeout {
            ctx = ctx.with_timeout(timeout);
        }
        if let Some(cancel) = &options.cancel {
            ctx = ctx.with_cancel(cancel.clone());
        }

        let (features, decision) = self.decide(query, options)?;
        info!(
            table = %query.table,
            strategy = %decision.strategy,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "strategy selected"
        );

        if decision.strategy.is_exact() {
            let exact = self.executor.execute_exact(query, &ctx)?;
            self.feedback.record(
                &features,
                Observation {
                    strategy: Strategy::Exact,
                    speedup: 1.0,
                    relative_error: 0.0,
                    measured: false,
                },
            );
            return Ok(QueryResponse {
                timings: MeasuredTimings {
                    strategy_millis: millis(exact.elapsed),
                    exact_millis: None,
                    measured_speedup: None,
                },
                result: exact.value,
                strategy_used: Strategy::Exact,
                decision,
                error_estimate: 0.0,
                downgraded: None,
                measured_relative_error: None,
            });
        }

        let approx = match self.executor.execute(query, &decision.strategy, &ctx) {
            Ok(approx) => approx,
            Err(e) => return self.downgrade(query, &features, decision, e, &ctx),
        };

        let compare = options
            .compare_exact
            .unwrap_or(self.config.compare_with_exact);
        let baseline: Option<Timed<QueryResult>> = if compare {
            match self.executor.execute_exact(query, &ctx) {
                Ok(exact) => Some(exact),
                Err(e) => {
                    warn!(error = %e, "exact comparison run failed");
                    None
                }
            }
        } else {
            None
        };

        let error_estimate = approx.value.max_relative_error();
        let measured_speedup = baseline
            .as_ref()
            .map(|exact| exact.elapsed.as_secs_f64() / approx.elapsed.as_secs_f64().max(1e-9));
        let measured_error = baseline
            .as_ref()
            .map(|exact| relative_error_against(&approx.value, &exact.value));

        self.feedback.record(
            &features,
            Observation {
                strategy: decision.strategy,
                speedup: measured_speedup.unwrap_or(decision.estimated_speedup),
                relative_error: measured_error.unwrap_or(error_estimate),
                measured: measured_speedup.is_some(),
            },
        );
        debug!(
            strategy = %decision.strategy,
            approx_ms = millis(approx.elapsed),
            speedup = ?measured_speedup,
            error = ?measured_error,
            "approximate execution complete"
        );

        Ok(QueryResponse {
            timings: MeasuredTimings {
                strategy_millis: millis(approx.elapsed),
                exact_millis: baseline.as_ref().map(|b| millis(b.elapsed)),
                measured_speedup,
            },
            result: approx.value,
            strategy_used: decision.strategy,
            decision,
            error_estimate,
            downgraded: None,
            measured_relative_error: measured_error,
        })
    }

    fn downgrade(
        &self,
        query: &AggregateQuery,
        features: &QueryFeatures,
        decision: StrategyDecision,
        cause: AqeError,
        ctx: &ExecutionContext,
    ) -> Result<QueryResponse, AqeError> {
        // the caller stopped the query; says nothing about the strategy
        if let Err(interrupted) = ctx.check() {
            warn!(
                strategy = %decision.strategy,
                error = %interrupted,
                "approximate execution interrupted by caller"
            );
            return Err(interrupted);
        }
        warn!(
            strategy = %decision.strategy,
            error = %cause,
            "approximate execution failed, running exact"
        );
        self.feedback.record(
            features,
            Observation {
                strategy: decision.strategy,
                speedup: 1.0,
                relative_error: 1.0,
                measured: false,
            },
        );
        let exact = self.executor.execute_exact(query, ctx)?;
        Ok(QueryResponse {
            timings: MeasuredTimings {
                strategy_millis: millis(exact.elapsed),
                exact_millis: None,
                measured_speedup: None,
            },
            result: exact.value,
            strategy_used: Strategy::Exact,
            decision,
            error_estimate: 0.0,
            downgraded: Some(cause.to_string()),
            measured_relative_error: None,
        })
    }

    pub fn learning_stats(&self) -> LearningStats {
        let window = i64::try_from(self.config.stats_window_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000_000);
        let since = chrono::Utc::now().timestamp_micros().saturating_sub(window);
        let history = self.history();
        LearningStats {
            enabled: true,
            total_historical_queries: history.len() as u64,
            per_strategy: history.summarize_since(since),
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::PurchasesGenerator;

    fn engine(rows: usize) -> Engine {
        let storage = PurchasesGenerator::new(rows, 10, 11).into_storage().unwrap();
        Engine::new(
            AqeConfig::new().with_bootstrap_resamples(200),
            Arc::new(storage),
        )
        .unwrap()
    }

    #[test]
    fn test_optimization_disabled_runs_exact() {
        let e = engine(5_000);
        let q = parse_sql("SELECT COUNT(*) FROM purchases").unwrap();
        let resp = e.decide_and_execute(&q, 0.05, false).unwrap();
        assert_eq!(resp.strategy_used, Strategy::Exact);
        assert_eq!(resp.decision.reasoning, "optimization disabled");
        assert_eq!(resp.result.scalar(), Some(5_000.0));
        assert_eq!(e.history().len(), 1);
    }

    #[test]
    fn test_min_is_always_exact() {
        let e = engine(5_000);
        let resp = e
            .run_sql("SELECT MIN(amount) FROM purchases", &QueryOptions::new())
            .unwrap();
        assert_eq!(resp.strategy_used, Strategy::Exact);
        assert_eq!(resp.error_estimate, 0.0);
        assert!(resp.timings.measured_speedup.is_none());
    }

    #[test]
    fn test_failed_sample_downgrades_to_exact() {
        let e = engine(2_000);
        // 20 sampled rows split over 10 countries is too thin
        let resp = e
            .run_sql(
                "SELECT country, COUNT(*) FROM purchases GROUP BY country",
                &QueryOptions::new().with_sample_fraction(0.01),
            )
            .unwrap();
        assert_eq!(resp.decision.strategy, Strategy::Sample { fraction: 0.01 });
        assert_eq!(resp.strategy_used, Strategy::Exact);
        assert!(resp.downgraded.is_some());
        let total: f64 = resp
            .result
            .groups()
            .iter()
            .filter_map(|g| g.value.as_f64())
            .sum();
        assert_eq!(total, 2_000.0);

        let history = e.history().snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].relative_error, 1.0);
    }

    #[test]
    fn test_caller_cancel_is_not_held_against_strategy() {
        let e = engine(20_000);
        let cancel = Arc::new(AtomicBool::new(true));
        let result = e.run_sql(
            "SELECT COUNT(DISTINCT customer_id) FROM purchases",
            &QueryOptions::new().with_cancel(cancel),
        );
        assert!(matches!(result, Err(AqeError::Cancelled(_))));
        assert!(e.history().is_empty());
    }

    #[test]
    fn test_caller_deadline_is_not_held_against_strategy() {
        let e = engine(20_000);
        let result = e.run_sql(
            "SELECT COUNT(DISTINCT customer_id) FROM purchases",
            &QueryOptions::new().with_timeout(Duration::ZERO),
        );
        assert!(matches!(result, Err(AqeError::Timeout(_))));
        assert!(e.history().is_empty());
    }

    #[test]
    fn test_dual_mode_measures_speedup_and_error() {
        let e = engine(50_000);
        let resp = e
            .run_sql(
                "SELECT COUNT(*) FROM purchases",
                &QueryOptions::new().with_sample_fraction(0.01),
            )
            .unwrap();
        assert_eq!(resp.strategy_used, Strategy::Sample { fraction: 0.01 });
        assert!(resp.timings.exact_millis.is_some());
        assert!(resp.timings.measured_speedup.unwrap() >= 0.0);
        assert_eq!(resp.measured_relative_error, Some(0.0));
        assert!(e.history().snapshot()[0].speedup_measured);
    }

    #[test]
    fn test_parse_errors_propagate() {
        let e = engine(100);
        assert!(matches!(
            e.run_sql("SELEC nothing", &QueryOptions::new()),
            Err(AqeError::Parse(_))
        ));
        assert!(matches!(
            e.run_sql("SELECT COUNT(*) FROM missing", &QueryOptions::new()),
            Err(AqeError::NotFound(_))
        ));
    }

    #[test]
    fn test_learning_stats_window() {
        let e = engine(5_000);
        for _ in 0..3 {
            e.decide_and_execute(
                &parse_sql("SELECT MAX(amount) FROM purchases").unwrap(),
                0.05,
                true,
            )
            .unwrap();
        }
        let stats = e.learning_stats();
        assert!(stats.enabled);
        assert_eq!(stats.total_historical_queries, 3);
        assert_eq!(stats.per_strategy.len(), 1);
        assert_eq!(stats.per_strategy[0].observations, 3);
    }
}
