//! Storage collaborator contract and an in-memory Arrow implementation.
//!
//! The engine only needs row counts, a snapshot version, optional column
//! statistics, a row stream with an optional modulo predicate, and exact
//! execution of the query as written.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use arrow::compute::kernels::aggregate;
use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int32Array,
    Int64Array, LargeStringArray, RecordBatch, StringArray, UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, SchemaRef};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::AqeError;
use crate::query::{cmp_values, AggregateQuery, AggregationKind, Filter, Value};
use crate::result::{GroupEstimate, QueryResult};
use crate::sampler::SampleDefinition;
use crate::sketch::{HyperLogLog, Sketch};

/// Distinct values whose frequencies are tracked exactly for `min_frequency`.
const MAX_TRACKED_VALUES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnStats {
    pub distinct_estimate: u64,
    pub null_count: u64,
    /// Rows holding the rarest non-null value; `None` when the column has
    /// too many distinct values to track
    pub min_frequency: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub table: String,
    /// Columns handed to the sink, in this order
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub sample: Option<SampleDefinition>,
}

#[derive(Debug)]
pub struct ScanRow<'a> {
    /// 1-based row id
    pub row_id: u64,
    pub values: &'a [Value],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Rows that passed the sample predicate, before filters
    pub rows_visited: u64,
    /// Rows handed to the sink
    pub rows_matched: u64,
    pub stopped: bool,
}

pub trait Storage: Send + Sync {
    fn row_count(&self, table: &str) -> Result<u64, AqeError>;

    /// Changes whenever the table's contents change.
    fn snapshot_version(&self, table: &str) -> Result<u64, AqeError>;

    fn column_stats(&self, table: &str, column: &str) -> Result<Option<ColumnStats>, AqeError>;

    fn scan(
        &self,
        request: &ScanRequest,
        sink: &mut dyn FnMut(&ScanRow<'_>) -> ScanControl,
    ) -> Result<ScanStats, AqeError>;

    fn execute(&self, query: &AggregateQuery) -> Result<QueryResult, AqeError>;
}

// ============================================================================
// Column access
// ============================================================================

enum ColumnReader<'a> {
    Int64(&'a Int64Array),
    Int32(&'a Int32Array),
    UInt64(&'a UInt64Array),
    UInt32(&'a UInt32Array),
    Float64(&'a Float64Array),
    Float32(&'a Float32Array),
    Utf8(&'a StringArray),
    LargeUtf8(&'a LargeStringArray),
    Boolean(&'a BooleanArray),
    Date32(&'a Date32Array),
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T, AqeError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| AqeError::Storage(format!("unexpected array for {}", array.data_type())))
}

impl<'a> ColumnReader<'a> {
    fn new(array: &'a ArrayRef) -> Result<Self, AqeError> {
        Ok(match array.data_type() {
            DataType::Int64 => ColumnReader::Int64(downcast(array)?),
            DataType::Int32 => ColumnReader::Int32(downcast(array)?),
            DataType::UInt64 => ColumnReader::UInt64(downcast(array)?),
            DataType::UInt32 => ColumnReader::UInt32(downcast(array)?),
            DataType::Float64 => ColumnReader::Float64(downcast(array)?),
            DataType::Float32 => ColumnReader::Float32(downcast(array)?),
            DataType::Utf8 => ColumnReader::Utf8(downcast(array)?),
            DataType::LargeUtf8 => ColumnReader::LargeUtf8(downcast(array)?),
            DataType::Boolean => ColumnReader::Boolean(downcast(array)?),
            DataType::Date32 => ColumnReader::Date32(downcast(array)?),
            other => {
                return Err(AqeError::Unsupported(format!(
                    "column type {other} not supported"
                )))
            }
        })
    }

    fn value(&self, row: usize) -> Value {
        macro_rules! read {
            ($arr:expr, $conv:expr) => {
                if $arr.is_null(row) {
                    Value::Null
                } else {
                    $conv($arr.value(row))
                }
            };
        }
        match self {
            ColumnReader::Int64(a) => read!(a, Value::Int),
            ColumnReader::Int32(a) => read!(a, |v: i32| Value::Int(v as i64)),
            ColumnReader::UInt64(a) => read!(a, |v: u64| Value::Int(v as i64)),
            ColumnReader::UInt32(a) => read!(a, |v: u32| Value::Int(v as i64)),
            ColumnReader::Float64(a) => read!(a, Value::Float),
            ColumnReader::Float32(a) => read!(a, |v: f32| Value::Float(v as f64)),
            ColumnReader::Utf8(a) => read!(a, |v: &str| Value::Text(v.to_string())),
            ColumnReader::LargeUtf8(a) => read!(a, |v: &str| Value::Text(v.to_string())),
            ColumnReader::Boolean(a) => read!(a, |v: bool| Value::Int(v as i64)),
            ColumnReader::Date32(a) => read!(a, |v: i32| Value::Int(v as i64)),
        }
    }
}

fn column_index(schema: &SchemaRef, table: &str, column: &str) -> Result<usize, AqeError> {
    schema
        .index_of(column)
        .map_err(|_| AqeError::NotFound(format!("column {table}.{column}")))
}

// ============================================================================
// In-memory tables
// ============================================================================

#[derive(Debug)]
struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    /// Row offset of each batch
    offsets: Vec<u64>,
    rows: u64,
    version: u64,
}

impl Table {
    fn new(schema: SchemaRef, batches: Vec<RecordBatch>, version: u64) -> Self {
        let mut offsets = Vec::with_capacity(batches.len());
        let mut rows = 0u64;
        for batch in &batches {
            offsets.push(rows);
            rows += batch.num_rows() as u64;
        }
        Self {
            schema,
            batches,
            offsets,
            rows,
            version,
        }
    }

    fn readers<'a>(
        &self,
        batch: &'a RecordBatch,
        indices: &[usize],
    ) -> Result<Vec<ColumnReader<'a>>, AqeError> {
        indices
            .iter()
            .map(|&i| ColumnReader::new(batch.column(i)))
            .collect()
    }
}

/// Rows of one modulo sample, materialized for a fixed column set.
#[derive(Debug)]
struct MaterializedSample {
    rows: Vec<(u64, Vec<Value>)>,
}

/// Arrow-backed storage holding whole tables in memory.
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    samples: Mutex<LruCache<String, Arc<MaterializedSample>>>,
    stats: Mutex<HashMap<(String, String), (u64, ColumnStats)>>,
    next_version: AtomicU64,
    stats_precision: u8,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables: Vec<String> = self.tables.read().keys().cloned().collect();
        f.debug_struct("MemoryStorage").field("tables", &tables).finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_sample_cache(16)
    }

    pub fn with_sample_cache(entries: usize) -> Self {
        let cap = NonZeroUsize::new(entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            tables: RwLock::new(HashMap::new()),
            samples: Mutex::new(LruCache::new(cap)),
            stats: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            stats_precision: 14,
        }
    }

    /// Materialized samples currently held.
    pub fn cached_samples(&self) -> usize {
        self.samples.lock().len()
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Create or replace a table.
    pub fn register_table(
        &self,
        name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<(), AqeError> {
        for batch in &batches {
            if batch.schema().fields() != schema.fields() {
                return Err(AqeError::Storage(format!(
                    "batch schema does not match table {name}"
                )));
            }
        }
        let table = Table::new(schema, batches, self.bump_version());
        debug!(table = name, rows = table.rows, "registered table");
        self.tables.write().insert(name.to_string(), Arc::new(table));
        Ok(())
    }

    /// Append rows; readers holding the previous snapshot are unaffected.
    pub fn append_batch(&self, name: &str, batch: RecordBatch) -> Result<(), AqeError> {
        let mut tables = self.tables.write();
        let current = tables
            .get(name)
            .ok_or_else(|| AqeError::NotFound(format!("table {name}")))?;
        if batch.schema().fields() != current.schema.fields() {
            return Err(AqeError::Storage(format!(
                "batch schema does not match table {name}"
            )));
        }
        let mut batches = current.batches.clone();
        batches.push(batch);
        let table = Table::new(current.schema.clone(), batches, self.bump_version());
        tables.insert(name.to_string(), Arc::new(table));
        Ok(())
    }

    fn table(&self, name: &str) -> Result<Arc<Table>, AqeError> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AqeError::NotFound(format!("table {name}")))
    }

    fn materialize_sample(
        &self,
        name: &str,
        table: &Table,
        def: &SampleDefinition,
        columns: &[String],
    ) -> Result<Arc<MaterializedSample>, AqeError> {
        let key = format!(
            "{}[{}]@{}",
            def.cache_key(name),
            columns.join(","),
            table.version
        );
        if let Some(hit) = self.samples.lock().get(&key) {
            return Ok(hit.clone());
        }

        let indices = columns
            .iter()
            .map(|c| column_index(&table.schema, name, c))
            .collect::<Result<Vec<_>, _>>()?;
        let mut rows = Vec::with_capacity((table.rows / def.modulus) as usize + 1);
        for (batch, &offset) in table.batches.iter().zip(&table.offsets) {
            let readers = table.readers(batch, &indices)?;
            let end = offset + batch.num_rows() as u64;
            let mut row_id = def.first_at_or_after(offset + 1);
            while row_id <= end {
                let local = (row_id - offset - 1) as usize;
                rows.push((row_id, readers.iter().map(|r| r.value(local)).collect()));
                row_id += def.modulus;
            }
        }
        debug!(sample = %key, rows = rows.len(), "materialized sample");
        let sample = Arc::new(MaterializedSample { rows });
        self.samples.lock().put(key, sample.clone());
        Ok(sample)
    }

    fn scan_sample(
        &self,
        table: &Table,
        request: &ScanRequest,
        def: &SampleDefinition,
        sink: &mut dyn FnMut(&ScanRow<'_>) -> ScanControl,
    ) -> Result<ScanStats, AqeError> {
        let (needed, projection, filter_slots) = plan_columns(request);
        let sample = self.materialize_sample(&request.table, table, def, &needed)?;

        let mut stats = ScanStats::default();
        let mut buf: Vec<Value> = Vec::with_capacity(projection.len());
        for (row_id, values) in &sample.rows {
            stats.rows_visited += 1;
            let pass = request
                .filters
                .iter()
                .zip(&filter_slots)
                .all(|(f, &slot)| f.matches(&values[slot]));
            if !pass {
                continue;
            }
            buf.clear();
            buf.extend(projection.iter().map(|&slot| values[slot].clone()));
            stats.rows_matched += 1;
            let row = ScanRow {
                row_id: *row_id,
                values: &buf,
            };
            if sink(&row) == ScanControl::Stop {
                stats.stopped = true;
                break;
            }
        }
        Ok(stats)
    }

    fn scan_full(
        table: &Table,
        request: &ScanRequest,
        sink: &mut dyn FnMut(&ScanRow<'_>) -> ScanControl,
    ) -> Result<ScanStats, AqeError> {
        let projection = request
            .columns
            .iter()
            .map(|c| column_index(&table.schema, &request.table, c))
            .collect::<Result<Vec<_>, _>>()?;
        let filter_columns = request
            .filters
            .iter()
            .map(|f| column_index(&table.schema, &request.table, &f.column))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = ScanStats::default();
        let mut buf: Vec<Value> = Vec::with_capacity(projection.len());
        for (batch, &offset) in table.batches.iter().zip(&table.offsets) {
            let readers = table.readers(batch, &projection)?;
            let filter_readers = table.readers(batch, &filter_columns)?;
            for row in 0..batch.num_rows() {
                stats.rows_visited += 1;
                let pass = request
                    .filters
                    .iter()
                    .zip(&filter_readers)
                    .all(|(f, r)| f.matches(&r.value(row)));
                if !pass {
                    continue;
                }
                buf.clear();
                buf.extend(readers.iter().map(|r| r.value(row)));
                stats.rows_matched += 1;
                let scan_row = ScanRow {
                    row_id: offset + row as u64 + 1,
                    values: &buf,
                };
                if sink(&scan_row) == ScanControl::Stop {
                    stats.stopped = true;
                    return Ok(stats);
                }
            }
        }
        Ok(stats)
    }

    /// Ungrouped, unfiltered SUM/COUNT straight from the arrow arrays.
    fn try_fast_aggregate(
        table: &Table,
        query: &AggregateQuery,
    ) -> Result<Option<QueryResult>, AqeError> {
        let Some(agg) = &query.aggregate else {
            return Ok(None);
        };
        if !query.group_by.is_empty() || !query.filters.is_empty() {
            return Ok(None);
        }
        let value = match (agg.kind, agg.column.as_deref()) {
            (AggregationKind::Count, None) => Value::Int(table.rows as i64),
            (AggregationKind::Sum, Some(column)) => {
                let idx = column_index(&table.schema, &query.table, column)?;
                let mut total = 0.0;
                let mut seen = false;
                for batch in &table.batches {
                    let array = batch.column(idx);
                    let partial = match array.data_type() {
                        DataType::Float64 => {
                            aggregate::sum(downcast::<Float64Array>(array)?)
                        }
                        DataType::Int64 => {
                            aggregate::sum(downcast::<Int64Array>(array)?).map(|v| v as f64)
                        }
                        _ => return Ok(None),
                    };
                    if let Some(v) = partial {
                        total += v;
                        seen = true;
                    }
                }
                if seen {
                    Value::Float(total)
                } else {
                    Value::Null
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(QueryResult::Aggregate {
            column: agg.alias.clone(),
            group_columns: Vec::new(),
            groups: vec![GroupEstimate::exact(Vec::new(), value)],
        }))
    }
}

/// Columns to read for a request: projection first, then filter-only
/// columns. Returns the column list and the slots of projection and filter
/// columns within it.
fn plan_columns(request: &ScanRequest) -> (Vec<String>, Vec<usize>, Vec<usize>) {
    fn slot_of(name: &str, needed: &mut Vec<String>) -> usize {
        match needed.iter().position(|c| c == name) {
            Some(i) => i,
            None => {
                needed.push(name.to_string());
                needed.len() - 1
            }
        }
    }
    let mut needed: Vec<String> = Vec::new();
    let projection: Vec<usize> = request
        .columns
        .iter()
        .map(|c| slot_of(c, &mut needed))
        .collect();
    let filters: Vec<usize> = request
        .filters
        .iter()
        .map(|f| slot_of(&f.column, &mut needed))
        .collect();
    (needed, projection, filters)
}

impl Storage for MemoryStorage {
    fn row_count(&self, table: &str) -> Result<u64, AqeError> {
        Ok(self.table(table)?.rows)
    }

    fn snapshot_version(&self, table: &str) -> Result<u64, AqeError> {
        Ok(self.table(table)?.version)
    }

    fn column_stats(&self, table: &str, column: &str) -> Result<Option<ColumnStats>, AqeError> {
        let snapshot = self.table(table)?;
        let key = (table.to_string(), column.to_string());
        if let Some((version, stats)) = self.stats.lock().get(&key) {
            if *version == snapshot.version {
                return Ok(Some(*stats));
            }
        }

        let idx = column_index(&snapshot.schema, table, column)?;
        let mut hll = HyperLogLog::new(self.stats_precision, 0)?;
        let mut null_count = 0u64;
        let mut frequencies: Option<FxHashMap<Value, u64>> = Some(FxHashMap::default());
        for batch in &snapshot.batches {
            let reader = ColumnReader::new(batch.column(idx))?;
            for row in 0..batch.num_rows() {
                let value = reader.value(row);
                if value.is_null() {
                    null_count += 1;
                    continue;
                }
                value.with_key_bytes(|bytes| hll.ingest(bytes));
                if let Some(counts) = frequencies.as_mut() {
                    *counts.entry(value).or_insert(0) += 1;
                    if counts.len() > MAX_TRACKED_VALUES {
                        frequencies = None;
                    }
                }
            }
        }
        let stats = ColumnStats {
            distinct_estimate: hll.estimate().round() as u64,
            null_count,
            min_frequency: frequencies.and_then(|counts| counts.into_values().min()),
        };
        self.stats.lock().insert(key, (snapshot.version, stats));
        Ok(Some(stats))
    }

    fn scan(
        &self,
        request: &ScanRequest,
        sink: &mut dyn FnMut(&ScanRow<'_>) -> ScanControl,
    ) -> Result<ScanStats, AqeError> {
        let table = self.table(&request.table)?;
        match &request.sample {
            Some(def) => self.scan_sample(&table, request, def, sink),
            None => Self::scan_full(&table, request, sink),
        }
    }

    fn execute(&self, query: &AggregateQuery) -> Result<QueryResult, AqeError> {
        let table = self.table(&query.table)?;
        if let Some(result) = Self::try_fast_aggregate(&table, query)? {
            return Ok(result);
        }
        match &query.aggregate {
            None => execute_rows(&table, query),
            Some(_) => execute_aggregate(&table, query),
        }
    }
}

// ============================================================================
// Exact evaluation
// ============================================================================

#[derive(Debug)]
enum Accumulator {
    Count(u64),
    Sum { total: f64, seen: bool },
    Avg { total: f64, n: u64 },
    Distinct(HashSet<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
}

impl Accumulator {
    fn new(kind: AggregationKind) -> Self {
        match kind {
            AggregationKind::Count | AggregationKind::Rows => Accumulator::Count(0),
            AggregationKind::Sum => Accumulator::Sum {
                total: 0.0,
                seen: false,
            },
            AggregationKind::Avg => Accumulator::Avg { total: 0.0, n: 0 },
            AggregationKind::CountDistinct => Accumulator::Distinct(HashSet::new()),
            AggregationKind::Min => Accumulator::Min(None),
            AggregationKind::Max => Accumulator::Max(None),
        }
    }

    /// `value` is `None` for `COUNT(*)`.
    fn update(&mut self, value: Option<&Value>) {
        if let Some(v) = value {
            if v.is_null() {
                return;
            }
        }
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum { total, seen } => {
                if let Some(x) = value.and_then(Value::as_f64) {
                    *total += x;
                    *seen = true;
                }
            }
            Accumulator::Avg { total, n } => {
                if let Some(x) = value.and_then(Value::as_f64) {
                    *total += x;
                    *n += 1;
                }
            }
            Accumulator::Distinct(set) => {
                if let Some(v) = value {
                    if !set.contains(v) {
                        set.insert(v.clone());
                    }
                }
            }
            Accumulator::Min(current) => {
                if let Some(v) = value {
                    if current
                        .as_ref()
                        .map_or(true, |c| cmp_values(v, c) == std::cmp::Ordering::Less)
                    {
                        *current = Some(v.clone());
                    }
                }
            }
            Accumulator::Max(current) => {
                if let Some(v) = value {
                    if current
                        .as_ref()
                        .map_or(true, |c| cmp_values(v, c) == std::cmp::Ordering::Greater)
                    {
                        *current = Some(v.clone());
                    }
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Int(n as i64),
            Accumulator::Sum { total, seen } => {
                if seen {
                    Value::Float(total)
                } else {
                    Value::Null
                }
            }
            Accumulator::Avg { total, n } => {
                if n == 0 {
                    Value::Null
                } else {
                    Value::Float(total / n as f64)
                }
            }
            Accumulator::Distinct(set) => Value::Int(set.len() as i64),
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(Value::Null),
        }
    }
}

fn execute_aggregate(table: &Table, query: &AggregateQuery) -> Result<QueryResult, AqeError> {
    let Some(agg) = &query.aggregate else {
        return Err(AqeError::Unsupported("aggregate query without aggregate".into()));
    };
    let mut columns = query.group_by.clone();
    let target_slot = agg.column.as_ref().map(|c| {
        columns.push(c.clone());
        columns.len() - 1
    });
    let request = ScanRequest {
        table: query.table.clone(),
        columns,
        filters: query.filters.clone(),
        sample: None,
    };
    let key_len = query.group_by.len();

    let mut groups: FxHashMap<Vec<Value>, Accumulator> = FxHashMap::default();
    if key_len == 0 {
        // an ungrouped aggregate yields one row even over no input
        groups.insert(Vec::new(), Accumulator::new(agg.kind));
    }
    MemoryStorage::scan_full(table, &request, &mut |row| {
        let key = row.values[..key_len].to_vec();
        let acc = groups
            .entry(key)
            .or_insert_with(|| Accumulator::new(agg.kind));
        acc.update(target_slot.map(|slot| &row.values[slot]));
        ScanControl::Continue
    })?;

    let mut out: Vec<GroupEstimate> = groups
        .into_iter()
        .map(|(key, acc)| GroupEstimate::exact(key, acc.finish()))
        .collect();
    order_groups(&mut out, query, &agg.alias);
    if let Some(limit) = query.limit {
        out.truncate(limit as usize);
    }
    Ok(QueryResult::Aggregate {
        column: agg.alias.clone(),
        group_columns: query.group_by.clone(),
        groups: out,
    })
}

/// Sort by ORDER BY keys, falling back to the group key.
pub(crate) fn order_groups(groups: &mut [GroupEstimate], query: &AggregateQuery, alias: &str) {
    groups.sort_by(|a, b| {
        for order in &query.order_by {
            let ord = if order.key == alias {
                cmp_values(&a.value, &b.value)
            } else {
                match query.group_by.iter().position(|c| *c == order.key) {
                    Some(i) => cmp_values(&a.key[i], &b.key[i]),
                    None => std::cmp::Ordering::Equal,
                }
            };
            let ord = if order.ascending { ord } else { ord.reverse() };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        a.key
            .iter()
            .zip(&b.key)
            .map(|(x, y)| cmp_values(x, y))
            .find(|o| *o != std::cmp::Ordering::Equal)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn execute_rows(table: &Table, query: &AggregateQuery) -> Result<QueryResult, AqeError> {
    let columns: Vec<String> = if query.projection.is_empty() {
        table
            .schema
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    } else {
        query.projection.clone()
    };
    let order_slots = query
        .order_by
        .iter()
        .map(|o| {
            columns
                .iter()
                .position(|c| *c == o.key)
                .map(|slot| (slot, o.ascending))
                .ok_or_else(|| {
                    AqeError::Unsupported(format!("ORDER BY {} must be a selected column", o.key))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let request = ScanRequest {
        table: query.table.clone(),
        columns: columns.clone(),
        filters: query.filters.clone(),
        sample: None,
    };
    // without ORDER BY the scan can stop at the limit
    let stop_at = match (query.limit, order_slots.is_empty()) {
        (Some(limit), true) => Some(limit as usize),
        _ => None,
    };
    let mut rows: Vec<Vec<Value>> = Vec::new();
    if stop_at != Some(0) {
        MemoryStorage::scan_full(table, &request, &mut |row| {
            rows.push(row.values.to_vec());
            match stop_at {
                Some(limit) if rows.len() >= limit => ScanControl::Stop,
                _ => ScanControl::Continue,
            }
        })?;
    }
    if !order_slots.is_empty() {
        rows.sort_by(|a, b| {
            for &(slot, ascending) in &order_slots {
                let ord = cmp_values(&a[slot], &b[slot]);
                let ord = if ascending { ord } else { ord.reverse() };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
    if let Some(limit) = query.limit {
        rows.truncate(limit as usize);
    }
    Ok(QueryResult::Rows { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{parse_sql, CompareOp};
    use crate::sampler::Sampler;
    use arrow_schema::{Field, Schema};

    fn storage() -> MemoryStorage {
        fill(MemoryStorage::new())
    }

    fn fill(storage: MemoryStorage) -> MemoryStorage {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("country", DataType::Utf8, true),
            Field::new("amount", DataType::Float64, true),
        ]));
        let make = |start: i64, n: i64| {
            let ids: Vec<i64> = (start..start + n).collect();
            let countries: Vec<Option<&str>> = ids
                .iter()
                .map(|i| match i % 4 {
                    0 => Some("DE"),
                    1 => Some("FR"),
                    2 => Some("IT"),
                    _ => None,
                })
                .collect();
            let amounts: Vec<Option<f64>> = ids.iter().map(|i| Some(*i as f64)).collect();
            RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(Int64Array::from(ids)),
                    Arc::new(StringArray::from(countries)),
                    Arc::new(Float64Array::from(amounts)),
                ],
            )
            .unwrap()
        };
        storage
            .register_table("t", schema.clone(), vec![make(1, 600), make(601, 400)])
            .unwrap();
        storage
    }

    #[test]
    fn test_row_count_and_missing_table() {
        let s = storage();
        assert_eq!(s.row_count("t").unwrap(), 1000);
        assert!(matches!(s.row_count("nope"), Err(AqeError::NotFound(_))));
    }

    #[test]
    fn test_sample_scan_across_batches() {
        let s = storage();
        let def = Sampler::new(0).define(0.01).unwrap();
        let request = ScanRequest {
            table: "t".into(),
            columns: vec!["id".into()],
            filters: vec![],
            sample: Some(def),
        };
        let mut ids = Vec::new();
        let stats = s
            .scan(&request, &mut |row| {
                ids.push(row.row_id);
                ScanControl::Continue
            })
            .unwrap();
        assert_eq!(stats.rows_visited, 10);
        assert_eq!(ids, (1..=10).map(|i| i * 100).collect::<Vec<u64>>());
    }

    #[test]
    fn test_sample_cache_is_bounded() {
        let small = fill(MemoryStorage::with_sample_cache(2));
        let default = storage();
        for fraction in [0.01, 0.02, 0.05] {
            let request = ScanRequest {
                table: "t".into(),
                columns: vec!["id".into()],
                filters: vec![],
                sample: Some(Sampler::new(0).define(fraction).unwrap()),
            };
            small.scan(&request, &mut |_| ScanControl::Continue).unwrap();
            default.scan(&request, &mut |_| ScanControl::Continue).unwrap();
        }
        assert_eq!(small.cached_samples(), 2);
        assert_eq!(default.cached_samples(), 3);
    }

    #[test]
    fn test_sample_scan_applies_filters_after_predicate() {
        let s = storage();
        let def = Sampler::new(0).define(0.1).unwrap();
        let request = ScanRequest {
            table: "t".into(),
            columns: vec!["amount".into()],
            filters: vec![Filter {
                column: "country".into(),
                op: CompareOp::Eq,
                value: Value::Text("IT".into()),
            }],
            sample: Some(def),
        };
        let stats = s.scan(&request, &mut |_| ScanControl::Continue).unwrap();
        assert_eq!(stats.rows_visited, 100);
        // ids 10, 20, ... with id % 4 == 2
        assert_eq!(stats.rows_matched, 50);
    }

    #[test]
    fn test_scan_stop() {
        let s = storage();
        let request = ScanRequest {
            table: "t".into(),
            columns: vec!["id".into()],
            filters: vec![],
            sample: None,
        };
        let mut seen = 0;
        let stats = s
            .scan(&request, &mut |_| {
                seen += 1;
                if seen == 5 {
                    ScanControl::Stop
                } else {
                    ScanControl::Continue
                }
            })
            .unwrap();
        assert!(stats.stopped);
        assert_eq!(stats.rows_matched, 5);
    }

    #[test]
    fn test_exact_grouped_count() {
        let s = storage();
        let q = parse_sql("SELECT country, COUNT(*) FROM t GROUP BY country").unwrap();
        let result = s.execute(&q).unwrap();
        assert_eq!(result.groups().len(), 4);
        let de = result.group(&[Value::Text("DE".into())]).unwrap();
        assert_eq!(de.value, Value::Int(250));
        let nulls = result.group(&[Value::Null]).unwrap();
        assert_eq!(nulls.value, Value::Int(250));
    }

    #[test]
    fn test_exact_fast_sum_matches_scan() {
        let s = storage();
        let fast = s.execute(&parse_sql("SELECT SUM(amount) FROM t").unwrap()).unwrap();
        assert_eq!(fast.scalar(), Some(500_500.0));
        let filtered = s
            .execute(&parse_sql("SELECT SUM(amount) FROM t WHERE id > 0").unwrap())
            .unwrap();
        assert_eq!(filtered.scalar(), Some(500_500.0));
    }

    #[test]
    fn test_exact_count_column_skips_nulls() {
        let s = storage();
        let result = s
            .execute(&parse_sql("SELECT COUNT(country) FROM t").unwrap())
            .unwrap();
        assert_eq!(result.scalar(), Some(750.0));
        let distinct = s
            .execute(&parse_sql("SELECT COUNT(DISTINCT country) FROM t").unwrap())
            .unwrap();
        assert_eq!(distinct.scalar(), Some(3.0));
    }

    #[test]
    fn test_exact_min_max_and_empty_filter() {
        let s = storage();
        let max = s.execute(&parse_sql("SELECT MAX(amount) FROM t").unwrap()).unwrap();
        assert_eq!(max.groups()[0].value, Value::Float(1000.0));
        let none = s
            .execute(&parse_sql("SELECT COUNT(*) FROM t WHERE id > 5000").unwrap())
            .unwrap();
        assert_eq!(none.scalar(), Some(0.0));
    }

    #[test]
    fn test_order_by_and_limit() {
        let s = storage();
        let q = parse_sql(
            "SELECT country, SUM(amount) AS total FROM t WHERE country <> 'DE' \
             GROUP BY country ORDER BY total DESC LIMIT 1",
        )
        .unwrap();
        let result = s.execute(&q).unwrap();
        assert_eq!(result.groups().len(), 1);
        assert_eq!(result.groups()[0].key, vec![Value::Text("IT".into())]);

        let rows = s
            .execute(&parse_sql("SELECT id FROM t ORDER BY id DESC LIMIT 3").unwrap())
            .unwrap();
        match rows {
            QueryResult::Rows { rows, .. } => {
                assert_eq!(
                    rows,
                    vec![vec![Value::Int(1000)], vec![Value::Int(999)], vec![Value::Int(998)]]
                );
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn test_column_stats_and_versions() {
        let s = storage();
        let v1 = s.snapshot_version("t").unwrap();
        let stats = s.column_stats("t", "country").unwrap().unwrap();
        assert_eq!(stats.distinct_estimate, 3);
        assert_eq!(stats.null_count, 250);
        assert_eq!(stats.min_frequency, Some(250));
        // every id is unique
        let ids = s.column_stats("t", "id").unwrap().unwrap();
        assert_eq!(ids.min_frequency, Some(1));

        let schema = s.table("t").unwrap().schema.clone();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1001])),
                Arc::new(StringArray::from(vec![Some("ES")])),
                Arc::new(Float64Array::from(vec![Some(1.0)])),
            ],
        )
        .unwrap();
        s.append_batch("t", batch).unwrap();
        assert!(s.snapshot_version("t").unwrap() > v1);
        assert_eq!(s.row_count("t").unwrap(), 1001);
        let stats = s.column_stats("t", "country").unwrap().unwrap();
        assert_eq!(stats.distinct_estimate, 4);
        assert_eq!(stats.min_frequency, Some(1));
    }
}
