pub mod bootstrap;
pub mod config;
pub mod datagen;
pub mod engine;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod history;
pub mod query;
pub mod result;
pub mod sampler;
pub mod selector;
pub mod sketch;
pub mod storage;
pub mod strategy;

pub use bootstrap::{BootstrapEstimate, ConfidenceEstimator, ConfidenceInterval, Statistic};
pub use config::{AqeConfig, BootstrapPreset};
pub use datagen::{purchases_schema, PurchasesGenerator, PURCHASES_TABLE};
pub use engine::{Engine, LearningStats, MeasuredTimings, QueryOptions, QueryResponse};
pub use error::AqeError;
pub use executor::{ExecutionContext, ExecutorAdapter, Timed};
pub use feedback::{FeedbackRecorder, Observation};
pub use history::{
    ConfidencePolicy, HistoryLog, HistoryRecord, HistoryStore, HistorySummary,
    JsonLinesHistoryLog, StrategySummary,
};
pub use query::{
    parse_sql, AggregateExpr, AggregateQuery, AggregationKind, CompareOp, Filter, OrderBy,
    QueryFeatures, SimilarityKey, Value,
};
pub use result::{relative_error_against, GroupEstimate, QueryResult};
pub use sampler::{Allocation, SampleDefinition, Sampler, StratumProfile};
pub use selector::{classify, CapabilityTier, SketchFamily, StrategySelector};
pub use sketch::{CountMinSketch, HyperLogLog, Sketch};
pub use storage::{ColumnStats, MemoryStorage, ScanControl, ScanRequest, ScanRow, ScanStats, Storage};
pub use strategy::{SketchKind, Strategy, StrategyDecision};
