//! Append-only ledger of strategy outcomes.
//!
//! Records are grouped by [`SimilarityKey`]; per-strategy summaries are
//! recomputed on every read from a copy taken under the lock.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AqeConfig;
use crate::error::AqeError;
use crate::query::SimilarityKey;
use crate::strategy::Strategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub fingerprint: u64,
    pub key: SimilarityKey,
    pub strategy: Strategy,
    pub speedup: f64,
    pub relative_error: f64,
    /// Speedup came from timing an exact baseline rather than the estimate
    pub speedup_measured: bool,
    /// Microseconds since the epoch, assigned by the store
    pub timestamp_micros: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub strategy: Strategy,
    pub observations: u64,
    pub mean_speedup: f64,
    pub mean_relative_error: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub key: SimilarityKey,
    pub strategies: Vec<StrategySummary>,
}

impl HistorySummary {
    pub fn empty(key: SimilarityKey) -> Self {
        Self {
            key,
            strategies: Vec::new(),
        }
    }

    pub fn get(&self, strategy: &Strategy) -> Option<&StrategySummary> {
        self.strategies.iter().find(|s| s.strategy == *strategy)
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn total_observations(&self) -> u64 {
        self.strategies.iter().map(|s| s.observations).sum()
    }
}

/// Confidence grows linearly with observations from `floor` to `ceiling`,
/// reaching it after `saturation` observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidencePolicy {
    pub floor: f64,
    pub ceiling: f64,
    pub saturation: u64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            floor: 0.6,
            ceiling: 0.9,
            saturation: 10,
        }
    }
}

impl ConfidencePolicy {
    pub fn from_config(config: &AqeConfig) -> Self {
        Self {
            floor: config.history_confidence_floor,
            ceiling: config.history_confidence_ceiling,
            saturation: config.history_saturation_count.max(1),
        }
    }

    pub fn confidence(&self, observations: u64) -> f64 {
        let step = (self.ceiling - self.floor) * observations as f64 / self.saturation as f64;
        (self.floor + step).min(self.ceiling)
    }
}

fn summarize_records<'a>(
    records: impl Iterator<Item = &'a HistoryRecord>,
    policy: &ConfidencePolicy,
) -> Vec<StrategySummary> {
    // (strategy, count, speedup sum, error sum), in first-seen order
    let mut acc: Vec<(Strategy, u64, f64, f64)> = Vec::new();
    for record in records {
        match acc.iter_mut().find(|(s, ..)| *s == record.strategy) {
            Some(entry) => {
                entry.1 += 1;
                entry.2 += record.speedup;
                entry.3 += record.relative_error;
            }
            None => acc.push((record.strategy, 1, record.speedup, record.relative_error)),
        }
    }
    acc.into_iter()
        .map(|(strategy, n, speedup, error)| StrategySummary {
            strategy,
            observations: n,
            mean_speedup: speedup / n as f64,
            mean_relative_error: error / n as f64,
            confidence: policy.confidence(n),
        })
        .collect()
}

// ============================================================================
// Persistence
// ============================================================================

/// Durable sink for history records.
pub trait HistoryLog: Send + Sync {
    fn append(&self, record: &HistoryRecord) -> Result<(), AqeError>;

    fn load(&self) -> Result<Vec<HistoryRecord>, AqeError>;
}

/// One JSON object per line, flushed on every append.
#[derive(Debug)]
pub struct JsonLinesHistoryLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesHistoryLog {
    pub fn open(path: &Path) -> Result<Self, AqeError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)
                    .map_err(|e| AqeError::Io(format!("create history dir failed: {e}")))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AqeError::Io(format!("open history log failed: {e}")))?;
        let mut writer = BufWriter::new(file);
        // terminate a torn last line so new records start on their own line
        if !ends_with_newline(path)? {
            writer
                .write_all(b"\n")
                .and_then(|_| writer.flush())
                .map_err(|e| AqeError::Io(format!("history append failed: {e}")))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ends_with_newline(path: &Path) -> Result<bool, AqeError> {
    let mut file = File::open(path)
        .map_err(|e| AqeError::Io(format!("open history log failed: {e}")))?;
    let len = file
        .metadata()
        .map_err(|e| AqeError::Io(format!("stat history log failed: {e}")))?
        .len();
    if len == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| AqeError::Io(format!("read history log: {e}")))?;
    Ok(last[0] == b'\n')
}

impl HistoryLog for JsonLinesHistoryLog {
    fn append(&self, record: &HistoryRecord) -> Result<(), AqeError> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| AqeError::History(format!("encode record: {e}")))?;
        let mut writer = self.writer.lock();
        writer
            .write_all(&bytes)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .map_err(|e| AqeError::Io(format!("history append failed: {e}")))
    }

    fn load(&self) -> Result<Vec<HistoryRecord>, AqeError> {
        let file = File::open(&self.path)
            .map_err(|e| AqeError::Io(format!("open history log failed: {e}")))?;
        let mut records = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| AqeError::Io(format!("read history log: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(record) => records.push(record),
                // a torn final line after a crash is expected
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable history record"
                ),
            }
        }
        Ok(records)
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct HistoryStore {
    records: Mutex<Vec<HistoryRecord>>,
    log: Option<Box<dyn HistoryLog>>,
    policy: ConfidencePolicy,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("records", &self.len())
            .field("persistent", &self.log.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

impl HistoryStore {
    pub fn new(policy: ConfidencePolicy) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            log: None,
            policy,
        }
    }

    /// Open a store backed by `log`, replaying what it already holds.
    pub fn with_log(policy: ConfidencePolicy, log: Box<dyn HistoryLog>) -> Result<Self, AqeError> {
        let mut records = log.load()?;
        // keep timestamps non-decreasing even if the log was edited by hand
        let mut last = i64::MIN;
        for record in &mut records {
            record.timestamp_micros = record.timestamp_micros.max(last);
            last = record.timestamp_micros;
        }
        debug!(records = records.len(), "replayed history log");
        Ok(Self {
            records: Mutex::new(records),
            log: Some(log),
            policy,
        })
    }

    pub fn policy(&self) -> &ConfidencePolicy {
        &self.policy
    }

    /// Append a record, assigning its timestamp. Returns the stored record.
    pub fn append(&self, mut record: HistoryRecord) -> Result<HistoryRecord, AqeError> {
        let mut records = self.records.lock();
        let now = chrono::Utc::now().timestamp_micros();
        let last = records.last().map_or(i64::MIN, |r| r.timestamp_micros);
        record.timestamp_micros = now.max(last);
        if let Some(log) = &self.log {
            log.append(&record)?;
        }
        records.push(record.clone());
        Ok(record)
    }

    pub fn snapshot(&self) -> Vec<HistoryRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summarize(&self, key: &SimilarityKey) -> HistorySummary {
        let matching: Vec<HistoryRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.key == *key)
            .cloned()
            .collect();
        HistorySummary {
            key: *key,
            strategies: summarize_records(matching.iter(), &self.policy),
        }
    }

    /// Per-strategy summaries across all keys for records at or after
    /// `since_micros`.
    pub fn summarize_since(&self, since_micros: i64) -> Vec<StrategySummary> {
        let recent: Vec<HistoryRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.timestamp_micros >= since_micros)
            .cloned()
            .collect();
        summarize_records(recent.iter(), &self.policy)
    }
}
