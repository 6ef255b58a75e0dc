use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sketch", rename_all = "snake_case")]
pub enum SketchKind {
    /// HyperLogLog distinct count
    Cardinality { precision: u8 },
    /// Count-Min point frequency
    Frequency { depth: usize, width: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    Exact,
    Sample { fraction: f64 },
    /// Per-group sample sized from `fraction` of the table, with every group
    /// topped up to the minimum sample size
    Stratified { fraction: f64 },
    Sketch { kind: SketchKind },
}

impl Strategy {
    pub fn is_exact(&self) -> bool {
        matches!(self, Strategy::Exact)
    }

    pub fn label(&self) -> String {
        match self {
            Strategy::Exact => "exact".to_string(),
            Strategy::Sample { fraction } => format!("sample({fraction:.4})"),
            Strategy::Stratified { fraction } => format!("stratified({fraction:.4})"),
            Strategy::Sketch {
                kind: SketchKind::Cardinality { precision },
            } => format!("hll(p={precision})"),
            Strategy::Sketch {
                kind: SketchKind::Frequency { depth, width },
            } => format!("count_min({depth}x{width})"),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Output of the strategy selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub strategy: Strategy,
    pub confidence: f64,
    pub estimated_speedup: f64,
    /// Expected relative error; always 0 for exact execution
    pub estimated_error: f64,
    pub reasoning: String,
    pub transformations: Vec<String>,
}

impl StrategyDecision {
    pub fn exact(reasoning: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::Exact,
            confidence: 1.0,
            estimated_speedup: 1.0,
            estimated_error: 0.0,
            reasoning: reasoning.into(),
            transformations: Vec::new(),
        }
    }
}
