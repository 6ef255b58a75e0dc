//! Runs a chosen strategy against storage and turns the raw output into
//! scaled estimates with error bounds.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::bootstrap::{relative_error, ConfidenceEstimator, ConfidenceInterval, Statistic};
use crate::config::AqeConfig;
use crate::error::AqeError;
use crate::query::{AggregateExpr, AggregateQuery, AggregationKind, Value};
use crate::result::{GroupEstimate, QueryResult};
use crate::sampler::{Allocation, SampleDefinition, Sampler, StratumProfile};
use crate::sketch::{CountMinSketch, HyperLogLog, Sketch};
use crate::storage::{order_groups, ScanControl, ScanRequest, Storage};
use crate::strategy::{SketchKind, Strategy};

/// Rows between deadline and cancellation checks.
const CHECK_INTERVAL: u64 = 4096;

/// Deadline and cancellation flag for one request.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copy with the deadline tightened to at most `timeout` from now.
    pub fn bounded(&self, timeout: Option<Duration>) -> Self {
        let mut bounded = self.clone();
        if let Some(timeout) = timeout {
            let limit = Instant::now() + timeout;
            bounded.deadline = Some(self.deadline.map_or(limit, |d| d.min(limit)));
        }
        bounded
    }

    pub fn check(&self) -> Result<(), AqeError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(AqeError::Cancelled("query cancelled".into()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(AqeError::Timeout("query exceeded its deadline".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Timed<T> {
    pub value: T,
    pub elapsed: Duration,
}

#[derive(Debug)]
enum CachedSketch {
    Cardinality(HyperLogLog),
    Frequency(CountMinSketch),
}

/// Selected rows of one group of a stratified sample.
#[derive(Debug)]
struct Stratum {
    key: Vec<Value>,
    population: u64,
    def: SampleDefinition,
    /// Aggregated column (if any) followed by the filter columns
    rows: Vec<Vec<Value>>,
}

#[derive(Debug)]
struct StratifiedSample {
    strata: Vec<Stratum>,
}

/// Running population and spread of one stratum (Welford).
#[derive(Debug, Clone, Copy, Default)]
struct Spread {
    population: u64,
    n: u64,
    mean: f64,
    m2: f64,
}

impl Spread {
    fn push(&mut self, value: Option<f64>) {
        self.population += 1;
        if let Some(x) = value {
            self.n += 1;
            let delta = x - self.mean;
            self.mean += delta / self.n as f64;
            self.m2 += delta * (x - self.mean);
        }
    }

    fn std_dev(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            (self.m2 / (self.n - 1) as f64).sqrt()
        }
    }
}

pub struct ExecutorAdapter {
    storage: Arc<dyn Storage>,
    config: AqeConfig,
    sampler: Sampler,
    estimator: ConfidenceEstimator,
    sketches: Mutex<LruCache<String, Arc<CachedSketch>>>,
    stratified: Mutex<LruCache<String, Arc<StratifiedSample>>>,
}

impl std::fmt::Debug for ExecutorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorAdapter")
            .field("cached_sketches", &self.sketches.lock().len())
            .field("cached_stratified_samples", &self.stratified.lock().len())
            .finish()
    }
}

impl ExecutorAdapter {
    pub fn new(storage: Arc<dyn Storage>, config: AqeConfig) -> Result<Self, AqeError> {
        let estimator = ConfidenceEstimator::from_config(&config)?;
        let cap = NonZeroUsize::new(config.sketch_cache_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        let sample_cap =
            NonZeroUsize::new(config.sample_cache_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            storage,
            sampler: Sampler::new(config.sample_residue),
            estimator,
            config,
            sketches: Mutex::new(LruCache::new(cap)),
            stratified: Mutex::new(LruCache::new(sample_cap)),
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn cached_sketches(&self) -> usize {
        self.sketches.lock().len()
    }

    pub fn cached_stratified_samples(&self) -> usize {
        self.stratified.lock().len()
    }

    pub fn execute(
        &self,
        query: &AggregateQuery,
        strategy: &Strategy,
        ctx: &ExecutionContext,
    ) -> Result<Timed<QueryResult>, AqeError> {
        match strategy {
            Strategy::Exact => self.execute_exact(query, ctx),
            Strategy::Sample { fraction } => self.execute_sample(query, *fraction, ctx),
            Strategy::Stratified { fraction } => self.execute_stratified(query, *fraction, ctx),
            Strategy::Sketch { kind } => self.execute_sketch(query, kind, ctx),
        }
    }

    pub fn execute_exact(
        &self,
        query: &AggregateQuery,
        ctx: &ExecutionContext,
    ) -> Result<Timed<QueryResult>, AqeError> {
        ctx.check()?;
        let start = Instant::now();
        let value = self.storage.execute(query)?;
        Ok(Timed {
            value,
            elapsed: start.elapsed(),
        })
    }

    // ========================================================================
    // Sampling
    // ========================================================================

    pub fn execute_sample(
        &self,
        query: &AggregateQuery,
        fraction: f64,
        ctx: &ExecutionContext,
    ) -> Result<Timed<QueryResult>, AqeError> {
        let start = Instant::now();
        let agg = sampled_aggregate(query)?;
        let def = self.sampler.define(fraction)?;

        let key_len = query.group_by.len();
        let mut columns = query.group_by.clone();
        let target_slot = agg.column.as_ref().map(|c| {
            columns.push(c.clone());
            columns.len() - 1
        });
        let request = ScanRequest {
            table: query.table.clone(),
            columns,
            filters: query.filters.clone(),
            sample: Some(def),
        };

        // per group: (positions within the visited sample, contributed values)
        let mut groups: FxHashMap<Vec<Value>, (Vec<u64>, Vec<f64>)> = FxHashMap::default();
        let mut interrupted: Option<AqeError> = None;
        let mut visited = 0u64;
        let stats = self.storage.scan(&request, &mut |row| {
            visited += 1;
            if visited % CHECK_INTERVAL == 0 {
                if let Err(e) = ctx.check() {
                    interrupted = Some(e);
                    return ScanControl::Stop;
                }
            }
            let contribution = match (agg.kind, target_slot) {
                (AggregationKind::Count, None) => Some(1.0),
                (AggregationKind::Count, Some(slot)) => {
                    Some(if row.values[slot].is_null() { 0.0 } else { 1.0 })
                }
                (_, Some(slot)) => row.values[slot].as_f64(),
                (_, None) => None,
            };
            let entry = groups
                .entry(row.values[..key_len].to_vec())
                .or_insert_with(|| (Vec::new(), Vec::new()));
            entry.0.push(row.row_id);
            if let Some(v) = contribution {
                entry.1.push(v);
            }
            ScanControl::Continue
        })?;
        if let Some(e) = interrupted {
            return Err(e);
        }
        ctx.check()?;

        if groups.is_empty() {
            return Err(AqeError::InsufficientData(format!(
                "sample of {} rows matched nothing",
                stats.rows_visited
            )));
        }
        let mut keyed: Vec<(Vec<Value>, (Vec<u64>, Vec<f64>))> = groups.into_iter().collect();
        keyed.sort_by(|a, b| {
            a.0.iter()
                .zip(&b.0)
                .map(|(x, y)| crate::query::cmp_values(x, y))
                .find(|o| *o != std::cmp::Ordering::Equal)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some((key, (rows, _))) = keyed
            .iter()
            .find(|(_, (rows, _))| (rows.len() as u64) < self.config.min_group_rows)
        {
            return Err(AqeError::InsufficientData(format!(
                "group {key:?} has {} sampled rows, below {}",
                rows.len(),
                self.config.min_group_rows
            )));
        }

        let scale = def.scaling_factor();
        let (statistic, samples): (Statistic, Vec<Vec<f64>>) = match agg.kind {
            AggregationKind::Avg => (
                Statistic::Mean,
                keyed.iter().map(|(_, (_, values))| values.clone()).collect(),
            ),
            kind => {
                // zero-pad to the whole visited sample so the group's share
                // of the sample varies across resamples
                let padded = keyed
                    .iter()
                    .map(|(_, (_, values))| {
                        let mut v = values.clone();
                        v.resize(stats.rows_visited as usize, 0.0);
                        v
                    })
                    .collect();
                let statistic = if kind == AggregationKind::Count {
                    Statistic::Count
                } else {
                    Statistic::Sum
                };
                (statistic, padded)
            }
        };

        let estimates = self.estimator.estimate_many(&samples, statistic, scale);
        let mut out = Vec::with_capacity(keyed.len());
        for ((key, (rows, _)), estimate) in keyed.into_iter().zip(estimates) {
            let estimate = estimate?;
            let value = if agg.kind == AggregationKind::Count {
                Value::Int(estimate.point.round() as i64)
            } else {
                Value::Float(estimate.point)
            };
            out.push(GroupEstimate {
                key,
                value,
                interval: Some(estimate.interval),
                relative_error: estimate.relative_error,
                sample_rows: Some(rows.len() as u64),
            });
        }
        order_groups(&mut out, query, &agg.alias);

        let elapsed = start.elapsed();
        info!(
            table = %query.table,
            modulus = def.modulus,
            sampled = stats.rows_visited,
            groups = out.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "sample estimate complete"
        );
        Ok(Timed {
            value: QueryResult::Aggregate {
                column: agg.alias.clone(),
                group_columns: query.group_by.clone(),
                groups: out,
            },
            elapsed,
        })
    }

    // ========================================================================
    // Stratified sampling
    // ========================================================================

    /// Estimate a grouped COUNT/SUM/AVG from a per-group sample. Each group
    /// is scaled by its own population over its sampled rows.
    pub fn execute_stratified(
        &self,
        query: &AggregateQuery,
        fraction: f64,
        ctx: &ExecutionContext,
    ) -> Result<Timed<QueryResult>, AqeError> {
        let start = Instant::now();
        let agg = sampled_aggregate(query)?;
        if query.group_by.is_empty() {
            return Err(AqeError::Unsupported(
                "stratified sampling needs GROUP BY".into(),
            ));
        }
        let allocation = match agg.kind {
            AggregationKind::Sum | AggregationKind::Avg if self.config.neyman_allocation => {
                Allocation::Neyman
            }
            _ => Allocation::Proportional,
        };
        let target_slot = agg.column.as_ref().map(|_| 0);
        let filter_base = usize::from(target_slot.is_some());
        let mut payload: Vec<String> = agg.column.iter().cloned().collect();
        payload.extend(query.filters.iter().map(|f| f.column.clone()));

        let sample = self.stratified_sample(query, agg, &payload, fraction, allocation, ctx)?;
        ctx.check()?;

        let statistic = match agg.kind {
            AggregationKind::Avg => Statistic::Mean,
            AggregationKind::Sum => Statistic::Sum,
            _ => Statistic::Count,
        };
        // (key, sampled rows, exact value of a fully kept group)
        let mut planned: Vec<(Vec<Value>, u64, Option<f64>)> = Vec::new();
        let mut jobs: Vec<(Vec<f64>, f64)> = Vec::new();
        for stratum in &sample.strata {
            let mut values = Vec::with_capacity(stratum.rows.len());
            let mut matched = 0u64;
            for row in &stratum.rows {
                let pass = query
                    .filters
                    .iter()
                    .enumerate()
                    .all(|(i, f)| f.matches(&row[filter_base + i]));
                let contribution = if pass {
                    matched += 1;
                    match (agg.kind, target_slot) {
                        (AggregationKind::Count, None) => Some(1.0),
                        (AggregationKind::Count, Some(slot)) => {
                            Some(if row[slot].is_null() { 0.0 } else { 1.0 })
                        }
                        (_, Some(slot)) => row[slot].as_f64(),
                        (_, None) => None,
                    }
                } else {
                    None
                };
                match contribution {
                    Some(v) => values.push(v),
                    // COUNT and SUM keep every sampled row so the group's
                    // share varies across resamples
                    None if statistic != Statistic::Mean => values.push(0.0),
                    None => {}
                }
            }
            if matched == 0 {
                continue;
            }
            let sampled = stratum.rows.len() as u64;
            if stratum.def.modulus == 1 {
                let exact = match statistic {
                    Statistic::Count => values.iter().filter(|v| **v != 0.0).count() as f64,
                    Statistic::Sum => values.iter().sum(),
                    Statistic::Mean if values.is_empty() => f64::NAN,
                    Statistic::Mean => values.iter().sum::<f64>() / values.len() as f64,
                };
                planned.push((stratum.key.clone(), sampled, Some(exact)));
                continue;
            }
            if matched < self.config.min_group_rows {
                return Err(AqeError::InsufficientData(format!(
                    "group {:?} has {matched} matching sampled rows, below {}",
                    stratum.key, self.config.min_group_rows
                )));
            }
            let scale = stratum.population as f64 / sampled as f64;
            planned.push((stratum.key.clone(), sampled, None));
            jobs.push((values, scale));
        }
        if planned.is_empty() {
            return Err(AqeError::InsufficientData(
                "stratified sample matched nothing".into(),
            ));
        }

        let mut estimates = self
            .estimator
            .estimate_scaled(&jobs, statistic)
            .into_iter();
        let mut out = Vec::with_capacity(planned.len());
        for (key, sampled, exact) in planned {
            let group = match exact {
                Some(v) => {
                    let value = if v.is_nan() {
                        Value::Null
                    } else if statistic == Statistic::Count {
                        Value::Int(v as i64)
                    } else {
                        Value::Float(v)
                    };
                    GroupEstimate {
                        key,
                        value,
                        interval: (!v.is_nan()).then(|| ConfidenceInterval::point(v)),
                        relative_error: 0.0,
                        sample_rows: Some(sampled),
                    }
                }
                None => {
                    let estimate = estimates.next().ok_or_else(|| {
                        AqeError::InsufficientData("missing stratum estimate".into())
                    })??;
                    let value = if statistic == Statistic::Count {
                        Value::Int(estimate.point.round() as i64)
                    } else {
                        Value::Float(estimate.point)
                    };
                    GroupEstimate {
                        key,
                        value,
                        interval: Some(estimate.interval),
                        relative_error: estimate.relative_error,
                        sample_rows: Some(sampled),
                    }
                }
            };
            out.push(group);
        }
        order_groups(&mut out, query, &agg.alias);

        let elapsed = start.elapsed();
        info!(
            table = %query.table,
            allocation = allocation.label(),
            strata = sample.strata.len(),
            groups = out.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "stratified estimate complete"
        );
        Ok(Timed {
            value: QueryResult::Aggregate {
                column: agg.alias.clone(),
                group_columns: query.group_by.clone(),
                groups: out,
            },
            elapsed,
        })
    }

    /// Build (or reuse) the per-group sample for a query's grouping.
    ///
    /// Two passes: the first measures each group's population and spread,
    /// the second keeps rows by their position within their group.
    fn stratified_sample(
        &self,
        query: &AggregateQuery,
        agg: &AggregateExpr,
        payload: &[String],
        fraction: f64,
        allocation: Allocation,
        ctx: &ExecutionContext,
    ) -> Result<Arc<StratifiedSample>, AqeError> {
        let version = self.storage.snapshot_version(&query.table)?;
        let cache_key = format!(
            "{}[{}|{}]:strat:{fraction}:{}@{version}",
            query.table,
            query.group_by.join(","),
            payload.join(","),
            allocation.label()
        );
        if let Some(hit) = self.stratified.lock().get(&cache_key) {
            debug!(sample = %cache_key, "stratified sample cache hit");
            return Ok(hit.clone());
        }

        let key_len = query.group_by.len();
        let mut columns = query.group_by.clone();
        columns.extend(agg.column.iter().cloned());
        let request = ScanRequest {
            table: query.table.clone(),
            columns,
            filters: Vec::new(),
            sample: None,
        };
        let mut spreads: FxHashMap<Vec<Value>, Spread> = FxHashMap::default();
        let mut failure: Option<AqeError> = None;
        let mut scanned = 0u64;
        self.storage.scan(&request, &mut |row| {
            scanned += 1;
            if scanned % CHECK_INTERVAL == 0 {
                if let Err(e) = ctx.check() {
                    failure = Some(e);
                    return ScanControl::Stop;
                }
            }
            let value = row.values.get(key_len).and_then(Value::as_f64);
            match spreads.get_mut(&row.values[..key_len]) {
                Some(spread) => spread.push(value),
                None => {
                    let mut spread = Spread::default();
                    spread.push(value);
                    spreads.insert(row.values[..key_len].to_vec(), spread);
                }
            }
            ScanControl::Continue
        })?;
        if let Some(e) = failure {
            return Err(e);
        }

        let (keys, spreads): (Vec<Vec<Value>>, Vec<Spread>) = spreads.into_iter().unzip();
        let profiles: Vec<StratumProfile> = spreads
            .iter()
            .map(|s| StratumProfile {
                population: s.population,
                std_dev: s.std_dev(),
            })
            .collect();
        let defs = self.sampler.stratify(
            &profiles,
            fraction,
            self.config.min_group_rows,
            allocation,
        )?;
        let index: FxHashMap<Vec<Value>, usize> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), i))
            .collect();
        let mut strata: Vec<Stratum> = keys
            .into_iter()
            .zip(profiles.iter().zip(&defs))
            .map(|(key, (profile, def))| Stratum {
                key,
                population: profile.population,
                def: *def,
                rows: Vec::with_capacity(def.selected_in(profile.population) as usize),
            })
            .collect();

        let mut columns = query.group_by.clone();
        columns.extend(payload.iter().cloned());
        let request = ScanRequest {
            table: query.table.clone(),
            columns,
            filters: Vec::new(),
            sample: None,
        };
        let mut positions = vec![0u64; strata.len()];
        let mut scanned = 0u64;
        self.storage.scan(&request, &mut |row| {
            scanned += 1;
            if scanned % CHECK_INTERVAL == 0 {
                if let Err(e) = ctx.check() {
                    failure = Some(e);
                    return ScanControl::Stop;
                }
            }
            let Some(&i) = index.get(&row.values[..key_len]) else {
                return ScanControl::Continue;
            };
            positions[i] += 1;
            if strata[i].def.matches(positions[i]) {
                strata[i].rows.push(row.values[key_len..].to_vec());
            }
            ScanControl::Continue
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        if self.storage.snapshot_version(&query.table)? != version {
            return Err(AqeError::Storage(format!(
                "table {} changed while building a stratified sample",
                query.table
            )));
        }

        let sample = Arc::new(StratifiedSample { strata });
        info!(
            table = %query.table,
            strata = sample.strata.len(),
            rows = sample.strata.iter().map(|s| s.rows.len()).sum::<usize>(),
            allocation = allocation.label(),
            "built stratified sample"
        );
        self.stratified.lock().put(cache_key, sample.clone());
        Ok(sample)
    }

    // ========================================================================
    // Sketches
    // ========================================================================

    pub fn execute_sketch(
        &self,
        query: &AggregateQuery,
        kind: &SketchKind,
        ctx: &ExecutionContext,
    ) -> Result<Timed<QueryResult>, AqeError> {
        let start = Instant::now();
        let timeout = match self.config.sketch_timeout_millis {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let ctx = ctx.bounded(timeout);
        let value = match kind {
            SketchKind::Cardinality { precision } => {
                self.distinct_with_sketch(query, *precision, &ctx)?
            }
            SketchKind::Frequency { depth, width } => {
                self.frequency_with_sketch(query, *depth, *width, &ctx)?
            }
        };
        Ok(Timed {
            value,
            elapsed: start.elapsed(),
        })
    }

    fn cached(&self, key: &str) -> Option<Arc<CachedSketch>> {
        self.sketches.lock().get(key).cloned()
    }

    fn distinct_with_sketch(
        &self,
        query: &AggregateQuery,
        precision: u8,
        ctx: &ExecutionContext,
    ) -> Result<QueryResult, AqeError> {
        let agg = query
            .aggregate
            .as_ref()
            .filter(|a| a.kind == AggregationKind::CountDistinct)
            .ok_or_else(|| {
                AqeError::Unsupported("cardinality sketch needs COUNT(DISTINCT)".into())
            })?;
        let column = agg
            .column
            .clone()
            .ok_or_else(|| AqeError::Unsupported("COUNT(DISTINCT) without column".into()))?;

        let cacheable = query.group_by.is_empty() && query.filters.is_empty();
        let cache_key = if cacheable {
            let version = self.storage.snapshot_version(&query.table)?;
            Some(format!("{}.{column}:hll:p{precision}@{version}", query.table))
        } else {
            None
        };
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cached(key) {
                if let CachedSketch::Cardinality(hll) = hit.as_ref() {
                    debug!(sketch = %key, "sketch cache hit");
                    return Ok(self.cardinality_result(query, agg, vec![(Vec::new(), hll.clone())]));
                }
            }
        }

        let key_len = query.group_by.len();
        let mut columns = query.group_by.clone();
        columns.push(column.clone());
        let request = ScanRequest {
            table: query.table.clone(),
            columns,
            filters: query.filters.clone(),
            sample: None,
        };
        let seed = self.config.seed;
        let max_groups = self.config.max_sketch_groups as usize;
        let mut sketches: FxHashMap<Vec<Value>, HyperLogLog> = FxHashMap::default();
        if key_len == 0 {
            sketches.insert(Vec::new(), HyperLogLog::new(precision, seed)?);
        }
        let mut failure: Option<AqeError> = None;
        let mut scanned = 0u64;
        self.storage.scan(&request, &mut |row| {
            scanned += 1;
            if scanned % CHECK_INTERVAL == 0 {
                if let Err(e) = ctx.check() {
                    failure = Some(e);
                    return ScanControl::Stop;
                }
            }
            let key = &row.values[..key_len];
            if !sketches.contains_key(key) {
                if sketches.len() >= max_groups {
                    failure = Some(AqeError::Unsupported(format!(
                        "more than {max_groups} groups for per-group sketches"
                    )));
                    return ScanControl::Stop;
                }
                match HyperLogLog::new(precision, seed) {
                    Ok(hll) => {
                        sketches.insert(key.to_vec(), hll);
                    }
                    Err(e) => {
                        failure = Some(e);
                        return ScanControl::Stop;
                    }
                }
            }
            let value = &row.values[key_len];
            if !value.is_null() {
                if let Some(hll) = sketches.get_mut(key) {
                    value.with_key_bytes(|bytes| hll.ingest(bytes));
                }
            }
            ScanControl::Continue
        })?;
        // a cancelled or timed-out build is dropped here and never cached
        if let Some(e) = failure {
            return Err(e);
        }
        ctx.check()?;

        let built: Vec<(Vec<Value>, HyperLogLog)> = sketches.into_iter().collect();
        if let (Some(key), [(_, hll)]) = (cache_key, built.as_slice()) {
            debug!(sketch = %key, "caching cardinality sketch");
            self.sketches
                .lock()
                .put(key, Arc::new(CachedSketch::Cardinality(hll.clone())));
        }
        Ok(self.cardinality_result(query, agg, built))
    }

    fn cardinality_result(
        &self,
        query: &AggregateQuery,
        agg: &AggregateExpr,
        sketches: Vec<(Vec<Value>, HyperLogLog)>,
    ) -> QueryResult {
        let level = self.estimator.level();
        let mut groups: Vec<GroupEstimate> = sketches
            .into_iter()
            .map(|(key, hll)| {
                let interval = hll.confidence_interval(level);
                let point = hll.estimate().round();
                GroupEstimate {
                    key,
                    value: Value::Int(point as i64),
                    relative_error: relative_error(point, interval.half_width()),
                    interval: Some(interval),
                    sample_rows: None,
                }
            })
            .collect();
        order_groups(&mut groups, query, &agg.alias);
        QueryResult::Aggregate {
            column: agg.alias.clone(),
            group_columns: query.group_by.clone(),
            groups,
        }
    }

    fn frequency_with_sketch(
        &self,
        query: &AggregateQuery,
        depth: usize,
        width: usize,
        ctx: &ExecutionContext,
    ) -> Result<QueryResult, AqeError> {
        let filter = query.point_lookup().ok_or_else(|| {
            AqeError::Unsupported("frequency sketch needs a single-key COUNT".into())
        })?;
        let alias = query
            .aggregate
            .as_ref()
            .map(|a| a.alias.clone())
            .unwrap_or_else(|| "count".to_string());

        let version = self.storage.snapshot_version(&query.table)?;
        let cache_key = format!(
            "{}.{}:cms:{depth}x{width}@{version}",
            query.table, filter.column
        );
        let cms = match self.cached(&cache_key).as_deref() {
            Some(CachedSketch::Frequency(cms)) => {
                debug!(sketch = %cache_key, "sketch cache hit");
                cms.clone()
            }
            _ => {
                let built = self.build_frequency_sketch(query, &filter.column, depth, width, ctx)?;
                self.sketches
                    .lock()
                    .put(cache_key, Arc::new(CachedSketch::Frequency(built.clone())));
                built
            }
        };

        let (point, interval) =
            filter
                .value
                .with_key_bytes(|bytes| (cms.frequency(bytes), cms.frequency_interval(bytes)));
        let point = point as f64;
        Ok(QueryResult::Aggregate {
            column: alias,
            group_columns: Vec::new(),
            groups: vec![GroupEstimate {
                key: Vec::new(),
                value: Value::Int(point as i64),
                relative_error: relative_error(point, interval.half_width()),
                interval: Some(interval),
                sample_rows: None,
            }],
        })
    }

    fn build_frequency_sketch(
        &self,
        query: &AggregateQuery,
        column: &str,
        depth: usize,
        width: usize,
        ctx: &ExecutionContext,
    ) -> Result<CountMinSketch, AqeError> {
        let mut cms = CountMinSketch::new(depth, width, self.config.seed)?;
        let request = ScanRequest {
            table: query.table.clone(),
            columns: vec![column.to_string()],
            filters: Vec::new(),
            sample: None,
        };
        let mut failure: Option<AqeError> = None;
        let mut scanned = 0u64;
        self.storage.scan(&request, &mut |row| {
            scanned += 1;
            if scanned % CHECK_INTERVAL == 0 {
                if let Err(e) = ctx.check() {
                    failure = Some(e);
                    return ScanControl::Stop;
                }
            }
            if !row.values[0].is_null() {
                row.values[0].with_key_bytes(|bytes| cms.ingest(bytes));
            }
            ScanControl::Continue
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        ctx.check()?;
        Ok(cms)
    }
}

fn sampled_aggregate(query: &AggregateQuery) -> Result<&AggregateExpr, AqeError> {
    match &query.aggregate {
        Some(agg)
            if matches!(
                agg.kind,
                AggregationKind::Count | AggregationKind::Sum | AggregationKind::Avg
            ) =>
        {
            Ok(agg)
        }
        Some(agg) => Err(AqeError::Unsupported(format!(
            "{} cannot be estimated from a sample",
            agg.kind.label()
        ))),
        None => Err(AqeError::Unsupported(
            "row queries cannot be sampled".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::PurchasesGenerator;
    use crate::query::parse_sql;
    use crate::storage::MemoryStorage;
    use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
    use arrow_schema::{DataType, Field, Schema};

    fn adapter(rows: usize) -> ExecutorAdapter {
        let storage = PurchasesGenerator::new(rows, 10, 7).into_storage().unwrap();
        ExecutorAdapter::new(Arc::new(storage), AqeConfig::new().with_bootstrap_resamples(200))
            .unwrap()
    }

    /// 20k rows: region `small` holds 1% of them (ids ending in 50), `rating`
    /// is a float in 1..=5 and `bucket` an integer in 0..5.
    fn skewed_adapter() -> ExecutorAdapter {
        skewed_adapter_with(AqeConfig::new().with_bootstrap_resamples(200))
    }

    fn skewed_adapter_with(config: AqeConfig) -> ExecutorAdapter {
        let schema = Arc::new(Schema::new(vec![
            Field::new("region", DataType::Utf8, false),
            Field::new("amount", DataType::Float64, false),
            Field::new("rating", DataType::Float64, false),
            Field::new("bucket", DataType::Int64, false),
        ]));
        let ids: Vec<i64> = (1..=20_000).collect();
        let regions: Vec<&str> = ids
            .iter()
            .map(|i| if i % 100 == 50 { "small" } else { "big" })
            .collect();
        let amounts: Vec<f64> = ids.iter().map(|i| ((i * 7919) % 1000) as f64 / 10.0).collect();
        let ratings: Vec<f64> = ids.iter().map(|i| (i % 5 + 1) as f64).collect();
        let buckets: Vec<i64> = ids.iter().map(|i| i % 5).collect();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(regions)),
                Arc::new(Float64Array::from(amounts)),
                Arc::new(Float64Array::from(ratings)),
                Arc::new(Int64Array::from(buckets)),
            ],
        )
        .unwrap();
        let storage = MemoryStorage::new();
        storage.register_table("t", schema, vec![batch]).unwrap();
        ExecutorAdapter::new(Arc::new(storage), config).unwrap()
    }

    #[test]
    fn test_sample_count_scales_by_modulus() {
        let a = adapter(20_000);
        let q = parse_sql("SELECT COUNT(*) FROM purchases").unwrap();
        let out = a.execute_sample(&q, 0.01, &ExecutionContext::new()).unwrap();
        // 200 sampled rows, all matching
        assert_eq!(out.value.scalar(), Some(20_000.0));
        let group = &out.value.groups()[0];
        assert_eq!(group.sample_rows, Some(200));
        assert!(group.interval.unwrap().contains(20_000.0));
    }

    #[test]
    fn test_sample_grouped_sum_close_to_exact() {
        let a = adapter(50_000);
        let q = parse_sql("SELECT country, SUM(amount) FROM purchases GROUP BY country").unwrap();
        let approx = a.execute_sample(&q, 0.05, &ExecutionContext::new()).unwrap().value;
        let exact = a.execute_exact(&q, &ExecutionContext::new()).unwrap().value;
        assert_eq!(approx.groups().len(), exact.groups().len());
        let err = crate::result::relative_error_against(&approx, &exact);
        assert!(err < 0.15, "relative error {err}");
    }

    #[test]
    fn test_sample_rejects_small_groups() {
        let a = adapter(2_000);
        let q = parse_sql("SELECT country, COUNT(*) FROM purchases GROUP BY country").unwrap();
        let err = a
            .execute_sample(&q, 0.01, &ExecutionContext::new())
            .unwrap_err();
        assert!(matches!(err, AqeError::InsufficientData(_)));
    }

    #[test]
    fn test_sample_rejects_unsupported_aggregate() {
        let a = adapter(2_000);
        let q = parse_sql("SELECT MIN(amount) FROM purchases").unwrap();
        assert!(matches!(
            a.execute_sample(&q, 0.1, &ExecutionContext::new()),
            Err(AqeError::Unsupported(_))
        ));
        assert!(matches!(
            a.execute_sample(&q, 1.0, &ExecutionContext::new()),
            Err(AqeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_distinct_sketch_is_cached_per_version() {
        let a = adapter(20_000);
        let q = parse_sql("SELECT COUNT(DISTINCT country) FROM purchases").unwrap();
        let kind = SketchKind::Cardinality { precision: 14 };
        let first = a.execute_sketch(&q, &kind, &ExecutionContext::new()).unwrap();
        assert_eq!(first.value.scalar(), Some(10.0));
        assert_eq!(a.cached_sketches(), 1);
        let second = a.execute_sketch(&q, &kind, &ExecutionContext::new()).unwrap();
        assert_eq!(second.value, first.value);
        assert_eq!(a.cached_sketches(), 1);
    }

    #[test]
    fn test_filtered_distinct_is_not_cached() {
        let a = adapter(20_000);
        let q = parse_sql("SELECT COUNT(DISTINCT city) FROM purchases WHERE amount > 100").unwrap();
        a.execute_sketch(
            &q,
            &SketchKind::Cardinality { precision: 12 },
            &ExecutionContext::new(),
        )
        .unwrap();
        assert_eq!(a.cached_sketches(), 0);
    }

    #[test]
    fn test_cancelled_sketch_build_is_dropped() {
        let a = adapter(20_000);
        let q = parse_sql("SELECT COUNT(DISTINCT customer_id) FROM purchases").unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let ctx = ExecutionContext::new().with_cancel(cancel);
        let err = a
            .execute_sketch(&q, &SketchKind::Cardinality { precision: 14 }, &ctx)
            .unwrap_err();
        assert!(matches!(err, AqeError::Cancelled(_)));
        assert_eq!(a.cached_sketches(), 0);
    }

    #[test]
    fn test_frequency_sketch_never_undercounts() {
        let a = adapter(20_000);
        let q = parse_sql("SELECT COUNT(*) FROM purchases WHERE country = 'DE'").unwrap();
        let exact = a.execute_exact(&q, &ExecutionContext::new()).unwrap().value;
        let approx = a
            .execute_sketch(
                &q,
                &SketchKind::Frequency {
                    depth: 4,
                    width: 2048,
                },
                &ExecutionContext::new(),
            )
            .unwrap()
            .value;
        let truth = exact.scalar().unwrap();
        let estimate = approx.scalar().unwrap();
        assert!(estimate >= truth);
        assert!(approx.groups()[0].interval.unwrap().contains(truth));
    }

    #[test]
    fn test_stratified_count_reaches_small_groups() {
        let a = skewed_adapter();
        let q = parse_sql("SELECT region, COUNT(*) FROM t GROUP BY region").unwrap();
        let out = a
            .execute_stratified(&q, 0.01, &ExecutionContext::new())
            .unwrap()
            .value;
        // 1% of 19,800 rows, and the 200-row group topped up to 33
        let big = out.group(&[Value::Text("big".into())]).unwrap();
        assert_eq!(big.value, Value::Int(19_800));
        assert_eq!(big.sample_rows, Some(198));
        let small = out.group(&[Value::Text("small".into())]).unwrap();
        assert_eq!(small.value, Value::Int(200));
        assert_eq!(small.sample_rows, Some(33));
        assert!(small.interval.is_some());
    }

    #[test]
    fn test_stratified_sum_close_to_exact_and_cached() {
        let a = skewed_adapter();
        let q = parse_sql("SELECT region, SUM(amount) FROM t GROUP BY region").unwrap();
        let approx = a
            .execute_stratified(&q, 0.05, &ExecutionContext::new())
            .unwrap()
            .value;
        let exact = a.execute_exact(&q, &ExecutionContext::new()).unwrap().value;
        assert_eq!(approx.groups().len(), 2);
        let err = crate::result::relative_error_against(&approx, &exact);
        assert!(err < 0.05, "relative error {err}");
        assert_eq!(a.cached_stratified_samples(), 1);

        let again = a
            .execute_stratified(&q, 0.05, &ExecutionContext::new())
            .unwrap()
            .value;
        assert_eq!(again, approx);
        assert_eq!(a.cached_stratified_samples(), 1);
    }

    #[test]
    fn test_stratified_small_group_kept_whole() {
        let a = skewed_adapter_with(
            AqeConfig::new()
                .with_bootstrap_resamples(200)
                .with_min_group_rows(250),
        );
        let q = parse_sql(
            "SELECT region, AVG(amount) FROM t WHERE amount >= 20 GROUP BY region",
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        // the 200-row group is smaller than the minimum, so all of it is kept
        let out = a.execute_stratified(&q, 0.05, &ctx).unwrap().value;
        let exact = a.execute_exact(&q, &ctx).unwrap().value;
        let key = [Value::Text("small".into())];
        let small = out.group(&key).unwrap();
        assert_eq!(small.relative_error, 0.0);
        let truth = exact.group(&key).unwrap().value.as_f64().unwrap();
        assert!((small.value.as_f64().unwrap() - truth).abs() < 1e-9);
    }

    #[test]
    fn test_stratified_needs_group_by() {
        let a = skewed_adapter();
        let q = parse_sql("SELECT COUNT(*) FROM t").unwrap();
        assert!(matches!(
            a.execute_stratified(&q, 0.01, &ExecutionContext::new()),
            Err(AqeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_frequency_sketch_matches_numeric_literals_across_types() {
        let a = skewed_adapter();
        let kind = SketchKind::Frequency {
            depth: 4,
            width: 2048,
        };
        for sql in [
            "SELECT COUNT(*) FROM t WHERE rating = 3",
            "SELECT COUNT(*) FROM t WHERE bucket = 2.0",
        ] {
            let q = parse_sql(sql).unwrap();
            let exact = a.execute_exact(&q, &ExecutionContext::new()).unwrap().value;
            let approx = a
                .execute_sketch(&q, &kind, &ExecutionContext::new())
                .unwrap()
                .value;
            let truth = exact.scalar().unwrap();
            assert_eq!(truth, 4_000.0, "{sql}");
            let estimate = approx.scalar().unwrap();
            assert!(estimate >= truth, "{sql}: {estimate} < {truth}");
            assert!(estimate <= truth * 1.05, "{sql}: {estimate}");
        }
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let a = adapter(2_000);
        let q = parse_sql("SELECT COUNT(*) FROM purchases").unwrap();
        let ctx = ExecutionContext::new().with_timeout(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            a.execute_exact(&q, &ctx),
            Err(AqeError::Timeout(_))
        ));
    }
}
