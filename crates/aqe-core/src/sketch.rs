//! Probabilistic sketches used by the sketch strategy.
//!
//! Both sketches hash through [`hash64`] with an explicit seed, so two
//! sketches are only mergeable when they were built with the same seed and
//! the same shape.

use crate::bootstrap::{z_score, ConfidenceInterval};
use crate::error::AqeError;

pub const MIN_PRECISION: u8 = 4;
pub const MAX_PRECISION: u8 = 18;

/// Operations shared by every sketch.
pub trait Sketch {
    fn ingest(&mut self, item: &[u8]);

    fn estimate(&self) -> f64;

    fn mergeable(&self, other: &Self) -> bool;

    fn merge(&mut self, other: &Self) -> Result<(), AqeError>;
}

/// Seeded 64-bit hash: multiplicative byte mixing followed by the
/// MurmurHash3 finalizer.
pub fn hash64(item: &[u8], seed: u64) -> u64 {
    let mut h = 0xcbf29ce484222325u64 ^ seed.wrapping_mul(0x9e3779b97f4a7c15);
    for &byte in item {
        h = h.wrapping_add(byte as u64);
        h = h.wrapping_mul(0x517cc1b727220a95);
        h ^= h >> 47;
    }
    fmix64(h ^ item.len() as u64)
}

fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

// ============================================================================
// HyperLogLog
// ============================================================================

/// HyperLogLog cardinality estimator.
///
/// Memory = 2^precision bytes, standard error ≈ 1.04 / sqrt(2^precision).
#[derive(Debug, Clone)]
pub struct HyperLogLog {
    registers: Vec<u8>,
    precision: u8,
    seed: u64,
}

impl HyperLogLog {
    pub fn new(precision: u8, seed: u64) -> Result<Self, AqeError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(AqeError::Configuration(format!(
                "hyperloglog precision {precision} outside {MIN_PRECISION}..={MAX_PRECISION}"
            )));
        }
        Self::with_registers(vec![0; 1usize << precision], seed)
    }

    /// Rebuild a sketch from a raw register array.
    pub fn with_registers(registers: Vec<u8>, seed: u64) -> Result<Self, AqeError> {
        let m = registers.len();
        if m == 0 || !m.is_power_of_two() {
            return Err(AqeError::Configuration(format!(
                "hyperloglog register count {m} is not a power of two"
            )));
        }
        let precision = m.trailing_zeros() as u8;
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(AqeError::Configuration(format!(
                "hyperloglog precision {precision} outside {MIN_PRECISION}..={MAX_PRECISION}"
            )));
        }
        let max_rank = 64 - precision + 1;
        if let Some(r) = registers.iter().find(|&&r| r > max_rank) {
            return Err(AqeError::Configuration(format!(
                "register value {r} exceeds maximum rank {max_rank}"
            )));
        }
        Ok(Self {
            registers,
            precision,
            seed,
        })
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    pub fn standard_error(&self) -> f64 {
        1.04 / (self.registers.len() as f64).sqrt()
    }

    /// Normal-approximation interval around the current estimate.
    pub fn confidence_interval(&self, level: f64) -> ConfidenceInterval {
        let estimate = self.estimate();
        let half_width = z_score(level) * self.standard_error() * estimate;
        ConfidenceInterval {
            lower: (estimate - half_width).max(0.0),
            upper: estimate + half_width,
            level,
        }
    }

    fn alpha(&self) -> f64 {
        let m = self.registers.len() as f64;
        match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        }
    }
}

impl Sketch for HyperLogLog {
    fn ingest(&mut self, item: &[u8]) {
        let hash = hash64(item, self.seed);
        let p = self.precision as u32;
        let index = (hash & ((1u64 << p) - 1)) as usize;
        let w = hash >> p;
        // leading zeros of the remaining 64-p bits, plus one
        let rank = (w.leading_zeros() - p + 1) as u8;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2.0_f64.powi(-(r as i32)))
            .sum();
        let raw = self.alpha() * m * m / sum;

        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros > 0 {
                return m * (m / zeros as f64).ln();
            }
            return raw;
        }
        let two_64 = 2.0_f64.powi(64);
        if raw > two_64 / 30.0 {
            return -two_64 * (1.0 - raw / two_64).ln();
        }
        raw
    }

    fn mergeable(&self, other: &Self) -> bool {
        self.precision == other.precision && self.seed == other.seed
    }

    fn merge(&mut self, other: &Self) -> Result<(), AqeError> {
        if !self.mergeable(other) {
            return Err(AqeError::ShapeMismatch(format!(
                "hyperloglog p={} seed={} vs p={} seed={}",
                self.precision, self.seed, other.precision, other.seed
            )));
        }
        for (a, b) in self.registers.iter_mut().zip(&other.registers) {
            *a = (*a).max(*b);
        }
        Ok(())
    }
}

// ============================================================================
// Count-Min
// ============================================================================

/// Count-Min sketch for point-frequency queries.
///
/// Estimates never undercount; overcount is at most `epsilon() * total`
/// with probability `1 - e^-depth`.
#[derive(Debug, Clone)]
pub struct CountMinSketch {
    counters: Vec<Vec<u64>>,
    depth: usize,
    width: usize,
    total: u64,
    seed: u64,
}

impl CountMinSketch {
    pub fn new(depth: usize, width: usize, seed: u64) -> Result<Self, AqeError> {
        if depth == 0 || width == 0 {
            return Err(AqeError::Configuration(format!(
                "count-min shape d={depth} w={width} must be positive"
            )));
        }
        Ok(Self {
            counters: vec![vec![0; width]; depth],
            depth,
            width,
            total: 0,
            seed,
        })
    }

    /// Size the sketch for additive error `epsilon * N` with failure
    /// probability `delta`.
    pub fn from_error_rate(epsilon: f64, delta: f64, seed: u64) -> Result<Self, AqeError> {
        if !(epsilon > 0.0 && epsilon < 1.0) || !(delta > 0.0 && delta < 1.0) {
            return Err(AqeError::Configuration(format!(
                "count-min error rate epsilon={epsilon} delta={delta} must be in (0, 1)"
            )));
        }
        let width = (std::f64::consts::E / epsilon).ceil() as usize;
        let depth = (1.0 / delta).ln().ceil() as usize;
        Self::new(depth.max(1), width.max(1), seed)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn total_count(&self) -> u64 {
        self.total
    }

    pub fn epsilon(&self) -> f64 {
        std::f64::consts::E / self.width as f64
    }

    pub fn add_count(&mut self, item: &[u8], count: u64) {
        self.total = self.total.saturating_add(count);
        let (h1, h2) = self.hashes(item);
        for (row, counters) in self.counters.iter_mut().enumerate() {
            let idx = Self::slot(h1, h2, row, self.width);
            counters[idx] = counters[idx].saturating_add(count);
        }
    }

    /// Point query: minimum over rows.
    pub fn frequency(&self, item: &[u8]) -> u64 {
        let (h1, h2) = self.hashes(item);
        self.counters
            .iter()
            .enumerate()
            .map(|(row, counters)| counters[Self::slot(h1, h2, row, self.width)])
            .min()
            .unwrap_or(0)
    }

    /// Interval containing the true frequency with probability `1 - e^-d`.
    pub fn frequency_interval(&self, item: &[u8]) -> ConfidenceInterval {
        let estimate = self.frequency(item) as f64;
        let slack = self.epsilon() * self.total as f64;
        ConfidenceInterval {
            lower: (estimate - slack).max(0.0),
            upper: estimate,
            level: 1.0 - (-(self.depth as f64)).exp(),
        }
    }

    fn hashes(&self, item: &[u8]) -> (u64, u64) {
        let h1 = hash64(item, self.seed);
        let h2 = fmix64(h1 ^ 0x9e3779b97f4a7c15) | 1;
        (h1, h2)
    }

    fn slot(h1: u64, h2: u64, row: usize, width: usize) -> usize {
        (h1.wrapping_add((row as u64).wrapping_mul(h2)) % width as u64) as usize
    }
}

impl Sketch for CountMinSketch {
    fn ingest(&mut self, item: &[u8]) {
        self.add_count(item, 1);
    }

    /// Total number of ingested items.
    fn estimate(&self) -> f64 {
        self.total as f64
    }

    fn mergeable(&self, other: &Self) -> bool {
        self.depth == other.depth && self.width == other.width && self.seed == other.seed
    }

    fn merge(&mut self, other: &Self) -> Result<(), AqeError> {
        if !self.mergeable(other) {
            return Err(AqeError::ShapeMismatch(format!(
                "count-min {}x{} seed={} vs {}x{} seed={}",
                self.depth, self.width, self.seed, other.depth, other.width, other.seed
            )));
        }
        self.total = self.total.saturating_add(other.total);
        for (mine, theirs) in self.counters.iter_mut().zip(&other.counters) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a = a.saturating_add(*b);
            }
        }
        Ok(())
    }
}
