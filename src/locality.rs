//! Sparse-histogram entropy and parallel spatial locality (PSL).
//!
//! Two information-theoretic reductions feed the memory metrics:
//!
//! - [`entropy`] maps an address histogram to an 11-entry vector: the raw
//!   address entropy at skip 0, then the entropy of `address >> skip` for
//!   skips 1..=10. Shifting by `k` groups addresses into cache-line-like
//!   buckets of `2^k` bytes, so the tail of the vector measures locality
//!   rather than footprint.
//! - [`parallel_spatial_locality`] reduces a ledger of per-work-item access
//!   streams timestep-major: at each parallel step it takes the entropy of
//!   the set of addresses the work-items touch concurrently, then averages
//!   over steps. High entropy at a step means poor spatial coalescing on
//!   that step.
//!
//! Both use `1/(total + 1)` probabilities. The smoothing is part of the
//! defined metric for this path; the end-of-invocation global entropy in
//! `metrics` deliberately divides by the raw total instead.

use std::collections::HashMap;

/// Entropy vectors carry skip 0 plus skips 1..=10.
pub const SKIP_LEVELS: usize = 11;

/// One recorded memory access. The timestep is carried for round-tripping;
/// the PSL reduction uses the element's position in its row as the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerElement {
    pub address: u64,
    pub timestep: u32,
}

/// Per-work-group access ledger: one row per work-item (dense, indexed by
/// the linearised local id), each row an append-ordered access stream.
#[derive(Debug, Default)]
pub struct Ledger {
    rows: Vec<Vec<LedgerElement>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Size the outer dimension to `rows` work-items, dropping any recorded
    /// elements. Called at each work-group begin with the current local
    /// volume.
    pub fn resize(&mut self, rows: usize) {
        for row in &mut self.rows {
            row.clear();
        }
        self.rows.resize_with(rows, Vec::new);
    }

    /// Append an access to the given work-item's row.
    #[inline]
    pub fn record(&mut self, row: usize, address: u64, timestep: u32) {
        self.rows[row].push(LedgerElement { address, timestep });
    }

    /// Drop all recorded elements while retaining the row slots.
    pub fn clear_rows(&mut self) {
        for row in &mut self.rows {
            row.clear();
        }
    }

    /// Length of the longest access stream.
    pub fn max_row_len(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn rows(&self) -> &[Vec<LedgerElement>] {
        &self.rows
    }
}

/// Entropy vector of a sparse address histogram, one entry per skip width.
///
/// For each skip, addresses are bucketed by `address >> skip` and
/// `H = -Σ p·log2(p)` with `p = count / (total + 1)`. An empty histogram
/// yields all zeros.
pub fn entropy(histogram: &HashMap<u64, u32>) -> [f64; SKIP_LEVELS] {
    let mut out = [0.0f64; SKIP_LEVELS];

    let total: u64 = histogram.values().map(|&c| u64::from(c)).sum();
    if total == 0 {
        return out;
    }
    let denom = (total + 1) as f64;

    // Skip 0 needs no re-bucketing.
    let mut h0 = 0.0f64;
    for &count in histogram.values() {
        let p = f64::from(count) / denom;
        h0 -= p * p.log2();
    }
    out[0] = h0;

    let mut buckets: HashMap<u64, u64> = HashMap::new();
    for skip in 1..SKIP_LEVELS {
        buckets.clear();
        for (&address, &count) in histogram {
            *buckets.entry(address >> skip).or_insert(0) += u64::from(count);
        }
        let mut h = 0.0f64;
        for &count in buckets.values() {
            let p = count as f64 / denom;
            h -= p * p.log2();
        }
        out[skip] = h;
    }

    out
}

/// Timestep-major PSL of a ledger.
///
/// With `T` the longest row, builds the histogram of addresses the rows
/// access concurrently at each step `t < T`, takes its entropy vector, and
/// returns the per-skip sum divided by `T + 1`.
pub fn parallel_spatial_locality(ledger: &Ledger) -> [f64; SKIP_LEVELS] {
    let steps = ledger.max_row_len();
    let mut psl = [0.0f64; SKIP_LEVELS];
    if steps == 0 {
        return psl;
    }

    let mut histogram: HashMap<u64, u32> = HashMap::new();
    for t in 0..steps {
        histogram.clear();
        for row in ledger.rows() {
            if let Some(element) = row.get(t) {
                *histogram.entry(element.address).or_insert(0) += 1;
            }
        }
        let step_entropy = entropy(&histogram);
        for (acc, h) in psl.iter_mut().zip(step_entropy.iter()) {
            *acc += h;
        }
    }

    let denom = (steps + 1) as f64;
    for value in &mut psl {
        *value /= denom;
    }
    psl
}
