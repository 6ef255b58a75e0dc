use serde::{Deserialize, Serialize};

use crate::bootstrap::ConfidenceInterval;
use crate::query::Value;

/// One output group of an aggregate query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEstimate {
    /// Group-by values in query order; empty for an ungrouped aggregate
    pub key: Vec<Value>,
    pub value: Value,
    /// Absent for exact results
    pub interval: Option<ConfidenceInterval>,
    pub relative_error: f64,
    /// Sampled rows behind this group, when sampling was used
    pub sample_rows: Option<u64>,
}

impl GroupEstimate {
    pub fn exact(key: Vec<Value>, value: Value) -> Self {
        Self {
            key,
            value,
            interval: None,
            relative_error: 0.0,
            sample_rows: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryResult {
    Aggregate {
        column: String,
        group_columns: Vec<String>,
        groups: Vec<GroupEstimate>,
    },
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
}

impl QueryResult {
    pub fn groups(&self) -> &[GroupEstimate] {
        match self {
            QueryResult::Aggregate { groups, .. } => groups,
            QueryResult::Rows { .. } => &[],
        }
    }

    /// Value of an ungrouped aggregate.
    pub fn scalar(&self) -> Option<f64> {
        match self.groups() {
            [single] if single.key.is_empty() => single.value.as_f64(),
            _ => None,
        }
    }

    pub fn group(&self, key: &[Value]) -> Option<&GroupEstimate> {
        self.groups().iter().find(|g| g.key == key)
    }

    /// Largest per-group relative error; 0 for exact and row results.
    pub fn max_relative_error(&self) -> f64 {
        self.groups()
            .iter()
            .map(|g| g.relative_error)
            .fold(0.0, f64::max)
    }

    pub fn row_count(&self) -> usize {
        match self {
            QueryResult::Aggregate { groups, .. } => groups.len(),
            QueryResult::Rows { rows, .. } => rows.len(),
        }
    }
}

/// Relative error of an approximate result against the exact one:
/// `Σ|approx − exact| / Σ|exact|` over the exact result's groups. Groups
/// missing from the approximation count as 0.
pub fn relative_error_against(approx: &QueryResult, exact: &QueryResult) -> f64 {
    let mut diff = 0.0;
    let mut total = 0.0;
    for group in exact.groups() {
        let truth = group.value.as_f64().unwrap_or(0.0);
        let estimate = approx
            .group(&group.key)
            .and_then(|g| g.value.as_f64())
            .unwrap_or(0.0);
        diff += (estimate - truth).abs();
        total += truth.abs();
    }
    // groups the approximation invented
    for group in approx.groups() {
        if exact.group(&group.key).is_none() {
            diff += group.value.as_f64().unwrap_or(0.0).abs();
        }
    }
    if total == 0.0 {
        if diff == 0.0 {
            0.0
        } else {
            1.0
        }
    } else {
        diff / total
    }
}
