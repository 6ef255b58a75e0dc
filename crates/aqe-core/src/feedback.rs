use std::sync::Arc;

use tracing::{debug, warn};

use crate::history::{HistoryRecord, HistoryStore};
use crate::query::QueryFeatures;
use crate::strategy::Strategy;

/// Outcome of one execution, as measured by the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub strategy: Strategy,
    pub speedup: f64,
    pub relative_error: f64,
    /// `speedup` was timed against an exact run
    pub measured: bool,
}

/// Turns observations into history records. Appends are best-effort.
#[derive(Debug, Clone)]
pub struct FeedbackRecorder {
    history: Arc<HistoryStore>,
}

impl FeedbackRecorder {
    pub fn new(history: Arc<HistoryStore>) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn record(&self, features: &QueryFeatures, observation: Observation) -> Option<HistoryRecord> {
        let record = HistoryRecord {
            fingerprint: features.fingerprint(),
            key: features.similarity_key(),
            strategy: observation.strategy,
            speedup: sanitize(observation.speedup, 1.0),
            relative_error: sanitize(observation.relative_error, 1.0),
            speedup_measured: observation.measured,
            timestamp_micros: 0,
        };
        match self.history.append(record) {
            Ok(stored) => {
                debug!(
                    key = %stored.key,
                    strategy = %stored.strategy,
                    speedup = stored.speedup,
                    error = stored.relative_error,
                    "recorded execution"
                );
                Some(stored)
            }
            Err(e) => {
                warn!(error = %e, strategy = %observation.strategy, "failed to record execution history");
                None
            }
        }
    }
}

// non-finite measurements would poison every later mean
fn sanitize(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AqeError;
    use crate::history::{ConfidencePolicy, HistoryLog};
    use crate::query::parse_sql;

    struct BrokenLog;

    impl HistoryLog for BrokenLog {
        fn append(&self, _record: &HistoryRecord) -> Result<(), AqeError> {
            Err(AqeError::Io("disk full".into()))
        }

        fn load(&self) -> Result<Vec<HistoryRecord>, AqeError> {
            Ok(Vec::new())
        }
    }

    fn features() -> QueryFeatures {
        let q = parse_sql("SELECT COUNT(*) FROM purchases").unwrap();
        QueryFeatures::from_query(&q, 200_000)
    }

    #[test]
    fn test_record_appends_to_history() {
        let store = Arc::new(HistoryStore::new(ConfidencePolicy::default()));
        let recorder = FeedbackRecorder::new(store.clone());
        let stored = recorder
            .record(
                &features(),
                Observation {
                    strategy: Strategy::Sample { fraction: 0.01 },
                    speedup: 40.0,
                    relative_error: 0.01,
                    measured: true,
                },
            )
            .unwrap();
        assert_eq!(stored.fingerprint, features().fingerprint());
        assert_eq!(store.len(), 1);
        let summary = store.summarize(&features().similarity_key());
        assert_eq!(summary.total_observations(), 1);
    }

    #[test]
    fn test_non_finite_values_are_replaced() {
        let store = Arc::new(HistoryStore::new(ConfidencePolicy::default()));
        let recorder = FeedbackRecorder::new(store);
        let stored = recorder
            .record(
                &features(),
                Observation {
                    strategy: Strategy::Exact,
                    speedup: f64::INFINITY,
                    relative_error: f64::NAN,
                    measured: false,
                },
            )
            .unwrap();
        assert_eq!(stored.speedup, 1.0);
        assert_eq!(stored.relative_error, 1.0);
    }

    #[test]
    fn test_append_failure_is_swallowed() {
        let store = Arc::new(
            HistoryStore::with_log(ConfidencePolicy::default(), Box::new(BrokenLog)).unwrap(),
        );
        let recorder = FeedbackRecorder::new(store.clone());
        let out = recorder.record(
            &features(),
            Observation {
                strategy: Strategy::Exact,
                speedup: 1.0,
                relative_error: 0.0,
                measured: false,
            },
        );
        assert!(out.is_none());
        assert!(store.is_empty());
    }
}
